//! OpenAI Chat Completions gateway.
//!
//! Sends one non-streaming request to `/v1/chat/completions` with the canvas
//! tools attached. Works with any OpenAI-compatible endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use shapeshare_core::config::Config;

use crate::{
    InferenceError, InferenceGateway, InferenceRequest, InferenceResponse, ToolCall, ToolSchema,
    Usage,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiGateway {
    pub base_url: String,
    api_key: Option<String>,
    max_response_bytes: usize,
    client: reqwest::Client,
}

impl OpenAiGateway {
    pub fn new(
        base_url: Option<&str>,
        api_key: Option<String>,
        timeout: Duration,
        max_response_bytes: usize,
    ) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            max_response_bytes,
            client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, InferenceError> {
        Self::new(
            Some(&config.ai_base_url()),
            config.ai_api_key(),
            config.ai_timeout(),
            config.ai_max_response_bytes(),
        )
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<RawToolCall>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    id: String,
    function: RawFunction,
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn format_tools(tools: &[ToolSchema]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

fn build_body(request: &InferenceRequest) -> ChatRequest {
    let tools = format_tools(&request.tools);
    ChatRequest {
        model: request.model.clone(),
        messages: vec![
            json!({ "role": "system", "content": request.system_prompt }),
            json!({ "role": "user", "content": request.message }),
        ],
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        tool_choice: (!tools.is_empty()).then_some("auto"),
        tools,
    }
}

/// Map a non-success HTTP status to an error category.
fn classify_status(status: u16, body: &str) -> InferenceError {
    let detail = format!("HTTP {status}: {}", body.trim());
    match status {
        401 | 403 => InferenceError::Unauthenticated(detail),
        400 | 404 | 422 => InferenceError::InvalidArgument(detail),
        429 if body.contains("insufficient_quota") => InferenceError::Quota(detail),
        429 => InferenceError::RateLimited(detail),
        408 | 504 => InferenceError::Timeout,
        _ => InferenceError::Internal(detail),
    }
}

fn map_transport(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout
    } else {
        InferenceError::Internal(e.to_string())
    }
}

/// Read the whole body, failing once it grows past `limit` bytes.
async fn read_bounded(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, InferenceError> {
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(InferenceError::Internal(format!(
                "response of {len} bytes exceeds limit of {limit}"
            )));
        }
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(map_transport)? {
        if body.len() + chunk.len() > limit {
            return Err(InferenceError::Internal(format!(
                "response exceeds limit of {limit} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn parse_completion(body: &[u8]) -> Result<InferenceResponse, InferenceError> {
    let completion: ChatCompletion = serde_json::from_slice(body)
        .map_err(|e| InferenceError::Internal(format!("malformed completion: {e}")))?;
    let usage = completion.usage.map(|u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });
    let Some(choice) = completion.choices.into_iter().next() else {
        return Err(InferenceError::Internal("completion had no choices".into()));
    };

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| {
            // Unparseable arguments are passed through as a string so the
            // caller can reject that one call.
            let arguments = serde_json::from_str(&tc.function.arguments)
                .unwrap_or(serde_json::Value::String(tc.function.arguments));
            ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments,
            }
        })
        .collect();

    Ok(InferenceResponse {
        message: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage,
    })
}

#[async_trait]
impl InferenceGateway for OpenAiGateway {
    fn id(&self) -> &str {
        "openai"
    }

    async fn invoke(&self, request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let body = build_body(request);
        debug!(model = %body.model, base_url = %self.base_url, tools = body.tools.len(), "Invoking chat completion");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(ref api_key) = self.api_key {
            req_builder = req_builder.header("authorization", format!("Bearer {api_key}"));
        }

        let response = req_builder.json(&body).send().await.map_err(map_transport)?;
        let status = response.status();
        let bytes = read_bounded(response, self.max_response_bytes).await?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            let err = classify_status(status.as_u16(), &text);
            warn!(%status, error = %err, "Chat completion failed");
            return Err(err);
        }

        let parsed = parse_completion(&bytes)?;
        debug!(
            tool_calls = parsed.tool_calls.len(),
            input_tokens = parsed.usage.map(|u| u.input_tokens),
            output_tokens = parsed.usage.map(|u| u.output_tokens),
            "Chat completion received"
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request() -> InferenceRequest {
        InferenceRequest {
            model: "gpt-4o-mini".into(),
            system_prompt: "You edit a canvas.".into(),
            message: "Create a blue rectangle".into(),
            tools: vec![ToolSchema {
                name: "createShape".into(),
                description: "Create one shape".into(),
                parameters: json!({ "type": "object", "properties": {} }),
            }],
            temperature: 0.7,
            max_tokens: 256,
        }
    }

    /// Serve one canned HTTP response and return the base URL.
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let mut read = 0;
            // Headers, then as much body as Content-Length asks for.
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                if n == 0 {
                    break;
                }
                read += n;
                let text = String::from_utf8_lossy(&buf[..read]).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if read >= end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}")
    }

    fn gateway(base_url: &str, limit: usize) -> OpenAiGateway {
        OpenAiGateway::new(
            Some(base_url),
            Some("sk-test".into()),
            Duration::from_secs(5),
            limit,
        )
        .unwrap()
    }

    #[test]
    fn test_custom_base_url() {
        let gateway = gateway("https://my-proxy.example.com/", 1024);
        assert_eq!(gateway.base_url, "https://my-proxy.example.com");
        assert_eq!(gateway.id(), "openai");
    }

    #[test]
    fn test_body_wraps_tools_as_functions() {
        let body = build_body(&request());
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "Create a blue rectangle");
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["function"]["name"], "createShape");
        assert_eq!(value["tool_choice"], "auto");
        assert_eq!(value["temperature"], 0.7);
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(classify_status(401, ""), InferenceError::Unauthenticated(_)));
        assert!(matches!(classify_status(403, ""), InferenceError::Unauthenticated(_)));
        assert!(matches!(classify_status(400, "bad"), InferenceError::InvalidArgument(_)));
        assert!(matches!(
            classify_status(429, r#"{"error":{"code":"insufficient_quota"}}"#),
            InferenceError::Quota(_)
        ));
        assert!(matches!(classify_status(429, "slow down"), InferenceError::RateLimited(_)));
        assert!(matches!(classify_status(500, "boom"), InferenceError::Internal(_)));
    }

    #[test]
    fn test_parse_completion_with_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        {"id": "call_1", "type": "function", "function": {"name": "createShape", "arguments": "{\"type\":\"rectangle\"}"}},
                        {"id": "call_2", "type": "function", "function": {"name": "deleteShape", "arguments": "not json"}}
                    ]
                }
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7}
        });
        let parsed = parse_completion(body.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.message, "");
        assert_eq!(parsed.tool_calls.len(), 2);
        assert_eq!(parsed.tool_calls[0].arguments["type"], "rectangle");
        assert_eq!(parsed.tool_calls[1].arguments, json!("not json"));
        assert_eq!(
            parsed.usage,
            Some(Usage {
                input_tokens: 12,
                output_tokens: 7
            })
        );
    }

    #[test]
    fn test_parse_completion_without_choices_is_internal() {
        let err = parse_completion(br#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, InferenceError::Internal(_)));
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let body = json!({
            "choices": [{"message": {"content": "Done.", "tool_calls": []}}]
        })
        .to_string();
        let base_url = serve_once("200 OK", body).await;
        let response = gateway(&base_url, 1024 * 1024)
            .invoke(&request())
            .await
            .unwrap();
        assert_eq!(response.message, "Done.");
        assert!(response.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_maps_unauthorized() {
        let base_url = serve_once("401 Unauthorized", r#"{"error":"bad key"}"#.into()).await;
        let err = gateway(&base_url, 1024).invoke(&request()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_invoke_rejects_oversized_response() {
        let body = format!(r#"{{"choices":[{{"message":{{"content":"{}"}}}}]}}"#, "x".repeat(4096));
        let base_url = serve_once("200 OK", body).await;
        let err = gateway(&base_url, 1024).invoke(&request()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Internal(_)));
    }
}
