use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use claude_bridge::cli::AppConfig;
use claude_bridge::server::{app, AppState};
use mockito::{Matcher, Server};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const COMPLETION: &str = r#"{
    "id": "chatcmpl-1",
    "model": "gpt-4o-mini",
    "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
    "usage": {"prompt_tokens": 5, "completion_tokens": 2}
}"#;

fn provider(name: &str, priority: u32, url: &str, max_retries: u32) -> String {
    format!(
        r#"
        [[providers]]
        name = "{name}"
        priority = {priority}
        base_url = "{url}"
        api_key = "sk-{name}"
        max_retries = {max_retries}
        models = {{ small = "gpt-4o-mini", big = "gpt-4o" }}
        "#
    )
}

fn bridge(providers: &[String], failure_threshold: u32) -> axum::Router {
    let toml = format!(
        r#"
        [retry]
        max_retries = 0

        [circuit_breaker]
        failure_threshold = {failure_threshold}
        recovery_timeout_secs = 60

        {}
        "#,
        providers.join("\n")
    );
    let config = AppConfig::from_toml(&toml).unwrap();
    app(Arc::new(AppState::from_config(config).unwrap()))
}

fn messages_request(stream: bool) -> String {
    json!({
        "model": "claude-3-5-haiku-20241022",
        "max_tokens": 64,
        "stream": stream,
        "messages": [{"role": "user", "content": "Say hello"}]
    })
    .to_string()
}

async fn send(app: &axum::Router, method: &str, path: &str, body: Option<String>) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn sse_events(body: &[u8]) -> Vec<(String, Value)> {
    let text = String::from_utf8_lossy(body);
    text.split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let mut name = String::new();
            let mut data = Value::Null;
            for line in frame.lines() {
                if let Some(n) = line.strip_prefix("event: ") {
                    name = n.to_string();
                } else if let Some(d) = line.strip_prefix("data: ") {
                    data = serde_json::from_str(d).unwrap();
                }
            }
            (name, data)
        })
        .collect()
}

#[tokio::test]
async fn test_falls_over_to_next_provider() {
    let mut primary = Server::new_async().await;
    let mut secondary = Server::new_async().await;

    let failing = primary
        .mock("POST", "/chat/completions")
        .with_status(500)
        .with_body(r#"{"error":{"message":"boom"}}"#)
        .expect(1)
        .create_async()
        .await;
    let answering = secondary
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-secondary")
        .match_body(Matcher::PartialJson(json!({"model": "gpt-4o-mini"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(COMPLETION)
        .expect(1)
        .create_async()
        .await;

    let app = bridge(
        &[
            provider("primary", 1, &primary.url(), 0),
            provider("secondary", 2, &secondary.url(), 0),
        ],
        5,
    );

    let (status, body) = send(&app, "POST", "/v1/messages", Some(messages_request(false))).await;
    assert_eq!(status, StatusCode::OK);

    let response: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(response["type"], "message");
    assert_eq!(response["model"], "claude-3-5-haiku-20241022");
    assert_eq!(response["content"][0]["text"], "Hello!");
    assert_eq!(response["stop_reason"], "end_turn");
    assert_eq!(response["usage"]["output_tokens"], 2);

    failing.assert_async().await;
    answering.assert_async().await;

    let (_, body) = send(&app, "GET", "/api/providers", None).await;
    let providers: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(providers[0]["name"], "primary");
    assert_eq!(providers[0]["circuit"]["consecutive_failures"], 1);
    assert_eq!(providers[1]["circuit"]["consecutive_failures"], 0);
}

#[tokio::test]
async fn test_auth_errors_are_not_retried() {
    let mut primary = Server::new_async().await;
    let mut secondary = Server::new_async().await;

    let rejected = primary
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body(r#"{"error":{"message":"invalid api key"}}"#)
        .expect(1)
        .create_async()
        .await;
    secondary
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(COMPLETION)
        .create_async()
        .await;

    let app = bridge(
        &[
            provider("primary", 1, &primary.url(), 3),
            provider("secondary", 2, &secondary.url(), 0),
        ],
        5,
    );

    let (status, _) = send(&app, "POST", "/v1/messages", Some(messages_request(false))).await;
    assert_eq!(status, StatusCode::OK);
    rejected.assert_async().await;
}

#[tokio::test]
async fn test_exhausted_providers_report_every_cause() {
    let mut primary = Server::new_async().await;
    primary
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body("unavailable")
        .create_async()
        .await;

    let app = bridge(
        &[
            provider("primary", 1, &primary.url(), 0),
            provider("unreachable", 2, "http://127.0.0.1:1", 0),
        ],
        5,
    );

    let (status, body) = send(&app, "POST", "/v1/messages", Some(messages_request(false))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"]["type"], "api_error");
    let message = error["error"]["message"].as_str().unwrap();
    assert!(message.contains("primary"));
    assert!(message.contains("unreachable"));
}

#[tokio::test]
async fn test_open_circuit_skips_provider() {
    let mut primary = Server::new_async().await;
    let failing = primary
        .mock("POST", "/chat/completions")
        .with_status(500)
        .with_body("down")
        .expect(2)
        .create_async()
        .await;

    let app = bridge(&[provider("primary", 1, &primary.url(), 0)], 2);

    for _ in 0..2 {
        let (status, _) = send(&app, "POST", "/v1/messages", Some(messages_request(false))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    let (status, body) = send(&app, "POST", "/v1/messages", Some(messages_request(false))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert!(error["error"]["message"].as_str().unwrap().contains("circuit open"));

    failing.assert_async().await;

    let (_, body) = send(&app, "GET", "/api/providers", None).await;
    let providers: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(providers[0]["circuit"]["state"], "open");
}

#[tokio::test]
async fn test_streaming_response_is_transcoded() {
    let mut upstream = Server::new_async().await;
    let sse = [
        r#"{"id":"c1","model":"gpt-4o-mini","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"}}]}"#,
        r#"{"id":"c1","model":"gpt-4o-mini","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":null}]}"#,
        r#"{"id":"c1","model":"gpt-4o-mini","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        r#"{"id":"c1","model":"gpt-4o-mini","choices":[],"usage":{"prompt_tokens":4,"completion_tokens":2}}"#,
        "[DONE]",
    ]
    .iter()
    .map(|data| format!("data: {}\n\n", data))
    .collect::<String>();

    upstream
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({"stream": true, "stream_options": {"include_usage": true}})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse)
        .create_async()
        .await;

    let app = bridge(&[provider("primary", 1, &upstream.url(), 0)], 5);
    let request = Request::post("/v1/messages")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(messages_request(true)))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let events = sse_events(&body);
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop"
        ]
    );

    assert_eq!(events[0].1["message"]["model"], "claude-3-5-haiku-20241022");
    assert_eq!(events[6].1["delta"]["stop_reason"], "end_turn");
    assert_eq!(events[6].1["usage"]["output_tokens"], 2);
}

#[tokio::test]
async fn test_upstream_error_mid_stream_ends_with_error_event() {
    let mut upstream = Server::new_async().await;
    let sse = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"partial\"}}]}\n\n",
        "data: {\"error\":{\"message\":\"overloaded\"}}\n\n",
    );
    upstream
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse)
        .create_async()
        .await;

    let app = bridge(&[provider("primary", 1, &upstream.url(), 0)], 5);
    let (status, body) = send(&app, "POST", "/v1/messages", Some(messages_request(true))).await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&body);
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names[names.len() - 2..], ["content_block_stop", "error"]);
    assert!(!names.contains(&"message_stop"));
    assert_eq!(events.last().unwrap().1["error"]["type"], "api_error");
}

#[tokio::test]
async fn test_unmapped_category_is_reported() {
    let mut upstream = Server::new_async().await;
    let never = upstream
        .mock("POST", "/chat/completions")
        .expect(0)
        .create_async()
        .await;

    let app = bridge(&[provider("primary", 1, &upstream.url(), 0)], 5);
    let body = json!({
        "model": "claude-sonnet-4",
        "max_tokens": 16,
        "messages": [{"role": "user", "content": "hi"}]
    })
    .to_string();

    let (status, body) = send(&app, "POST", "/v1/messages", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert!(error["error"]["message"].as_str().unwrap().contains("no model mapped"));
    never.assert_async().await;
}
