//! Command translator against a stub inference gateway and a live session.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use shapeshare_agent::{Caller, CommandError, CommandStatus, CommandTranslator, Exhausted};
use shapeshare_core::config::Config;
use shapeshare_core::memory_gateway::InMemoryGateway;
use shapeshare_core::types::{Geometry, ShapeDraft, ShapeType};
use shapeshare_providers::{
    InferenceError, InferenceGateway, InferenceRequest, InferenceResponse, ToolCall,
};
use shapeshare_sync::{SessionConfig, SessionHandle, spawn_session};

struct Gate {
    entered: Notify,
    release: Notify,
}

struct StubGateway {
    response: Result<InferenceResponse, InferenceError>,
    requests: Mutex<Vec<InferenceRequest>>,
    gate: Option<Gate>,
}

impl StubGateway {
    fn replying(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            response: Ok(InferenceResponse {
                message: "Done.".into(),
                tool_calls,
                usage: None,
            }),
            requests: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    fn failing(error: InferenceError) -> Self {
        Self {
            response: Err(error),
            requests: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceGateway for StubGateway {
    fn id(&self) -> &str {
        "stub"
    }

    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(ref gate) = self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.response.clone()
    }
}

fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        arguments,
    }
}

fn config(extra_ai: Value) -> Arc<Config> {
    Arc::new(
        serde_json::from_value(json!({
            "auth": { "users": [{ "user_id": "alice", "token": "t0k" }] },
            "ai": extra_ai,
        }))
        .unwrap(),
    )
}

fn alice() -> Caller {
    Caller::new("alice", "t0k")
}

fn session() -> SessionHandle {
    let gateway = InMemoryGateway::new();
    let (handle, _task) = spawn_session(
        Arc::new(gateway.link()),
        SessionConfig::new("alice", "Alice"),
    );
    handle
}

#[tokio::test]
async fn test_blue_rectangle_at_500_500() {
    let stub = Arc::new(StubGateway::replying(vec![call(
        "call_1",
        "createShape",
        json!({"type": "rectangle", "x": 500, "y": 500, "fill": "blue"}),
    )]));
    let translator = CommandTranslator::new(stub.clone(), config(json!({})));
    let session = session();

    let report = translator
        .translate(&alice(), "Create a blue rectangle at 500, 500", &session)
        .await
        .unwrap();

    assert_eq!(report.status(), CommandStatus::Success);
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].tool, "createShape");

    let shapes = session.shapes().await.unwrap();
    assert_eq!(shapes.len(), 1);
    let shape = &shapes[0];
    assert_eq!(shape.shape_type, ShapeType::Rectangle);
    assert_eq!(shape.style.fill, "#0000ff");
    assert_eq!((shape.geometry.x, shape.geometry.y), (500.0, 500.0));
    assert_eq!(shape.last_modified_by, "alice");
    assert_eq!(report.applied[0].shape_ids, vec![shape.id.clone()]);

    let requests = stub.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].message, "Create a blue rectangle at 500, 500");
    assert_eq!(requests[0].temperature, 0.7);
    assert_eq!(requests[0].tools.len(), 5);
    assert!(requests[0].system_prompt.contains("The canvas is empty."));
}

#[tokio::test]
async fn test_batch_with_invalid_call_is_partial() {
    let stub = Arc::new(StubGateway::replying(vec![
        call("c1", "createShape", json!({"type": "rectangle", "x": 0, "y": 0})),
        call("c2", "createShape", json!({"type": "ellipse", "x": 10})),
        call(
            "c3",
            "createMultipleShapes",
            json!({"shapes": [
                {"type": "rectangle", "x": 100, "y": 0},
                {"type": "text", "x": 200, "y": 0, "text": "Hi"}
            ]}),
        ),
    ]));
    let translator = CommandTranslator::new(stub, config(json!({})));
    let session = session();

    let report = translator
        .translate(&alice(), "Draw a toolbar", &session)
        .await
        .unwrap();

    assert_eq!(report.status(), CommandStatus::Partial);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].call_id, "c2");
    assert!(report.rejected[0].reason.contains("'y'"));
    assert_eq!(report.applied.len(), 2);
    assert_eq!(report.applied[1].shape_ids.len(), 2);
    assert_eq!(session.shapes().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_locked_shape_edit_is_rejected() {
    let session = session();
    let mut draft = ShapeDraft::new(ShapeType::Rectangle, Geometry::new(0.0, 0.0, 10.0, 10.0))
        .with_id("pinned");
    draft.locked = true;
    session.create(draft).await.unwrap();

    let stub = Arc::new(StubGateway::replying(vec![call(
        "c1",
        "updateShape",
        json!({"shapeId": "pinned", "fill": "red"}),
    )]));
    let translator = CommandTranslator::new(stub.clone(), config(json!({})));

    let report = translator
        .translate(&alice(), "Make it red", &session)
        .await
        .unwrap();
    assert_eq!(report.status(), CommandStatus::Rejected);
    assert!(report.rejected[0].reason.contains("locked"));
    assert!(stub.requests.lock().unwrap()[0].system_prompt.contains("\"locked\":true"));
}

#[tokio::test]
async fn test_unverified_caller_never_reaches_model() {
    let stub = Arc::new(StubGateway::replying(Vec::new()));
    let translator = CommandTranslator::new(stub.clone(), config(json!({})));
    let session = session();

    let err = translator
        .translate(&Caller::new("alice", "wrong"), "Draw a cat", &session)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::Unauthenticated(_)));
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn test_empty_instruction_is_invalid() {
    let stub = Arc::new(StubGateway::replying(Vec::new()));
    let translator = CommandTranslator::new(stub.clone(), config(json!({})));
    let err = translator
        .translate(&alice(), "   ", &session())
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::InvalidArgument(_)));
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn test_per_user_quota() {
    let stub = Arc::new(StubGateway::replying(Vec::new()));
    let translator = CommandTranslator::new(stub, config(json!({"commands_per_minute": 1})));
    let session = session();

    translator.translate(&alice(), "one", &session).await.unwrap();
    let err = translator
        .translate(&alice(), "two", &session)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::ResourceExhausted {
            kind: Exhausted::RateLimit,
            ..
        }
    ));
}

#[tokio::test]
async fn test_concurrency_cap_rejects_excess_requests() {
    let stub = Arc::new(StubGateway {
        gate: Some(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        }),
        ..StubGateway::replying(Vec::new())
    });
    let translator = CommandTranslator::new(stub.clone(), config(json!({"max_concurrent": 1})));
    let session = session();

    let caller = alice();
    let (first, second) = tokio::join!(translator.translate(&caller, "first", &session), async {
        let gate = stub.gate.as_ref().unwrap();
        gate.entered.notified().await;
        let second = translator.translate(&caller, "second", &session).await;
        gate.release.notify_one();
        second
    });

    assert!(first.is_ok());
    assert!(matches!(
        second,
        Err(CommandError::ResourceExhausted {
            kind: Exhausted::RateLimit,
            ..
        })
    ));
}

#[tokio::test]
async fn test_command_refused_for_concurrency_keeps_quota() {
    let stub = Arc::new(StubGateway {
        gate: Some(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        }),
        ..StubGateway::replying(Vec::new())
    });
    let translator = CommandTranslator::new(
        stub.clone(),
        config(json!({"max_concurrent": 1, "commands_per_minute": 2})),
    );
    let session = session();

    let caller = alice();
    let (first, second) = tokio::join!(translator.translate(&caller, "first", &session), async {
        let gate = stub.gate.as_ref().unwrap();
        gate.entered.notified().await;
        let second = translator.translate(&caller, "second", &session).await;
        gate.release.notify_one();
        second
    });
    assert!(first.is_ok());
    assert!(second.is_err());

    // The refused command did not use the second slot of the minute.
    let third = tokio::join!(translator.translate(&caller, "third", &session), async {
        let gate = stub.gate.as_ref().unwrap();
        gate.entered.notified().await;
        gate.release.notify_one();
    })
    .0;
    assert!(third.is_ok(), "{third:?}");
    assert_eq!(stub.calls(), 2);
}

#[tokio::test]
async fn test_provider_quota_maps_to_quota() {
    let stub = Arc::new(StubGateway::failing(InferenceError::Quota(
        "insufficient_quota".into(),
    )));
    let translator = CommandTranslator::new(stub, config(json!({})));
    let err = translator
        .translate(&alice(), "Draw", &session())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandError::ResourceExhausted {
            kind: Exhausted::Quota,
            ..
        }
    ));
}
