//! Two sessions sharing one in-memory gateway.

use std::sync::Arc;
use std::time::Duration;

use shapeshare_canvas::{Reorder, StoreError};
use shapeshare_core::gateway::{RemoteWrite, ShapeWrite};
use shapeshare_core::memory_gateway::InMemoryGateway;
use shapeshare_core::types::{Geometry, Position, ShapeDraft, ShapePatch, ShapeType};
use shapeshare_sync::{
    spawn_session, ActionOutcome, ConnectionState, LocalAction, SessionConfig, SessionError,
    SessionHandle,
};

fn config(user: &str) -> SessionConfig {
    SessionConfig {
        reconnect_min: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
        ..SessionConfig::new(user, user.to_uppercase())
    }
}

fn start(link: &InMemoryGateway, user: &str) -> SessionHandle {
    let (handle, _task) = spawn_session(Arc::new(link.clone()), config(user));
    handle
}

fn rect(id: &str) -> ShapeDraft {
    ShapeDraft::new(ShapeType::Rectangle, Geometry::new(0.0, 0.0, 40.0, 20.0)).with_id(id)
}

/// Re-evaluate `$check` until it holds or five seconds pass.
macro_rules! eventually {
    ($what:expr, $check:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if $check {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {}", $what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }};
}

async fn wait_connected(session: &SessionHandle) {
    let mut state = session.watch_connection();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_connected()))
        .await
        .expect("session did not connect")
        .expect("session closed");
}

#[tokio::test]
async fn test_edits_propagate_between_sessions() {
    let gateway = InMemoryGateway::new();
    let alice = start(&gateway.link(), "alice");
    let bob = start(&gateway.link(), "bob");
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    let created = alice.create(rect("r1")).await.unwrap();
    assert_eq!(created.last_modified_by, "alice");

    eventually!("bob to see r1", bob.shapes().await.unwrap().iter().any(|s| s.id == "r1"));

    bob.update("r1", ShapePatch::position(300.0, 120.0)).await.unwrap();
    eventually!("alice to see bob's move", {
        alice
            .shapes()
            .await
            .unwrap()
            .iter()
            .any(|s| s.id == "r1" && s.geometry.x == 300.0 && s.last_modified_by == "bob")
    });

    alice.delete("r1").await.unwrap();
    eventually!("bob to see the delete", bob.shapes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disjoint_field_edits_both_survive() {
    let gateway = InMemoryGateway::new();
    let alice = start(&gateway.link(), "alice");
    let bob = start(&gateway.link(), "bob");
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    alice.create(rect("r1")).await.unwrap();
    eventually!("bob to see r1", !bob.shapes().await.unwrap().is_empty());

    alice
        .update(
            "r1",
            ShapePatch {
                fill: Some("#ff0000".into()),
                ..ShapePatch::default()
            },
        )
        .await
        .unwrap();
    bob.update("r1", ShapePatch::position(10.0, 10.0)).await.unwrap();

    for session in [&alice, &bob] {
        eventually!("both fields to converge", {
            session.shapes().await.unwrap().iter().any(|s| {
                s.id == "r1" && s.style.fill == "#ff0000" && s.geometry.x == 10.0
            })
        });
    }
}

#[tokio::test]
async fn test_presence_and_cursor_visible_to_others() {
    let gateway = InMemoryGateway::new();
    let alice = start(&gateway.link(), "alice");
    let bob = start(&gateway.link(), "bob");
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    alice.move_cursor(Position::new(42.0, 24.0)).unwrap();
    alice.select(vec!["r1".into()]).unwrap();

    eventually!("bob to see alice's cursor and selection", {
        let collaborators = bob.collaborators().await.unwrap();
        let cursor_ok = collaborators
            .cursors
            .iter()
            .any(|c| c.user_id == "alice" && c.position == Position::new(42.0, 24.0));
        let selection_ok = collaborators
            .users
            .iter()
            .any(|p| p.user_id == "alice" && p.selection == vec!["r1".to_string()]);
        cursor_ok && selection_ok
    });

    let own = alice.collaborators().await.unwrap();
    assert!(own.users.iter().all(|p| p.user_id != "alice"));
}

#[tokio::test]
async fn test_offline_writes_flush_in_issue_order() {
    let gateway = InMemoryGateway::new();
    let alice_link = gateway.link();
    let alice = start(&alice_link, "alice");
    let bob = start(&gateway.link(), "bob");
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    alice_link.set_online(false);
    let mut state = alice.watch_connection();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. })),
    )
    .await
    .unwrap()
    .unwrap();

    // Scripted edits while disconnected. Local view keeps up.
    alice.create(rect("s1")).await.unwrap();
    alice.create(rect("s2")).await.unwrap();
    alice.update("s1", ShapePatch::position(5.0, 6.0)).await.unwrap();
    alice.delete("s2").await.unwrap();
    alice.create(rect("s3")).await.unwrap();

    let view: Vec<String> = alice.shapes().await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(view, vec!["s3", "s1"]);
    assert_eq!(alice.pending_writes().await.unwrap(), 5);
    assert!(gateway.shape_record("s1").is_none());

    alice_link.set_online(true);
    wait_connected(&alice).await;
    eventually!("alice's outbox to drain", alice.pending_writes().await.unwrap() == 0);

    let flushed: Vec<(String, &'static str)> = gateway
        .committed_writes()
        .into_iter()
        .filter_map(|(_, write)| match write {
            RemoteWrite::Shape { id, author, op } if author == "alice" => {
                let kind = match op {
                    ShapeWrite::Create(_) => "create",
                    ShapeWrite::Update(_) => "update",
                    ShapeWrite::Delete => "delete",
                };
                Some((id, kind))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        flushed,
        vec![
            ("s1".to_string(), "create"),
            ("s2".to_string(), "create"),
            ("s1".to_string(), "update"),
            ("s2".to_string(), "delete"),
            ("s3".to_string(), "create"),
        ]
    );

    eventually!("bob to converge", {
        let shapes = bob.shapes().await.unwrap();
        shapes.len() == 2
            && shapes.iter().any(|s| s.id == "s1" && s.geometry.x == 5.0)
            && shapes.iter().any(|s| s.id == "s3")
    });
}

#[tokio::test]
async fn test_remote_changes_while_offline_arrive_via_resync() {
    let gateway = InMemoryGateway::new();
    let alice_link = gateway.link();
    let alice = start(&alice_link, "alice");
    let bob = start(&gateway.link(), "bob");
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    alice_link.set_online(false);
    bob.create(rect("from-bob")).await.unwrap();
    eventually!("bob's write to commit", bob.pending_writes().await.unwrap() == 0);
    assert!(alice.shapes().await.unwrap().is_empty());

    alice_link.set_online(true);
    eventually!("alice to resync", {
        alice
            .shapes()
            .await
            .unwrap()
            .iter()
            .any(|s| s.id == "from-bob")
    });
}

#[tokio::test]
async fn test_batch_applies_valid_actions_together() {
    let gateway = InMemoryGateway::new();
    let alice = start(&gateway.link(), "alice");
    wait_connected(&alice).await;

    let results = alice
        .apply(vec![
            LocalAction::Create(rect("a")),
            LocalAction::Update {
                id: "missing".into(),
                patch: ShapePatch::position(1.0, 1.0),
            },
            LocalAction::Create(rect("b")),
            LocalAction::Reorder {
                id: "a".into(),
                reorder: Reorder::ToFront,
            },
        ])
        .await
        .unwrap();

    assert!(matches!(results[0], Ok(ActionOutcome::Created(_))));
    assert_eq!(results[1], Err(StoreError::NotFound("missing".into())));
    assert!(matches!(results[2], Ok(ActionOutcome::Created(_))));
    assert_eq!(results[3], Ok(ActionOutcome::Reordered("a".into())));

    let order: Vec<String> = alice.shapes().await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(order, vec!["a", "b"]);
}

#[tokio::test]
async fn test_locked_shape_refuses_session_edits() {
    let gateway = InMemoryGateway::new();
    let alice = start(&gateway.link(), "alice");
    wait_connected(&alice).await;

    let mut draft = rect("locked");
    draft.locked = true;
    alice.create(draft).await.unwrap();

    let err = alice
        .update("locked", ShapePatch::position(9.0, 9.0))
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::Store(StoreError::Locked("locked".into())));
}

#[tokio::test]
async fn test_zero_periods_do_not_kill_the_session() {
    let gateway = InMemoryGateway::new();
    let config = SessionConfig {
        heartbeat_interval: Duration::ZERO,
        cursor_throttle: Duration::ZERO,
        ..config("alice")
    };
    let (alice, task) = spawn_session(Arc::new(gateway.link()), config);
    wait_connected(&alice).await;

    alice.create(rect("r1")).await.unwrap();
    alice.move_cursor(Position::new(1.0, 1.0)).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(alice.shapes().await.unwrap().len(), 1);
    assert!(!task.is_finished());

    alice.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_handle() {
    let gateway = InMemoryGateway::new();
    let (alice, task) = spawn_session(Arc::new(gateway.link()), config("alice"));
    wait_connected(&alice).await;
    alice.shutdown();
    task.await.unwrap();
    assert_eq!(alice.shapes().await, Err(SessionError::Closed));
}
