//! Blocking client tests.

#![cfg(feature = "blocking")]

use std::time::Duration;

use pine_voice::{
    testing::{sse_frame, start_sse_server, SseScript},
    BlockingAuthClient, BlockingAuthConfig, BlockingClient, BlockingConfig, CallRequest,
    CallStatusKind, ErrorKind, RetryConfig, WaitOptions,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RESULT: &str = r#"{"call_id":"call_b","status":"completed","duration_seconds":61,"transcript":[{"speaker":"agent","text":"hi"}],"credits_charged":1.0}"#;

fn blocking_client(base_url: String) -> BlockingClient {
    BlockingClient::new(BlockingConfig {
        access_token: Some("tok_blocking".to_string()),
        user_id: Some("user_blocking".to_string()),
        gateway_url: Some(base_url),
        retry: Some(RetryConfig::disabled()),
        ..Default::default()
    })
    .expect("client creation should succeed")
}

#[test]
fn blocking_create_sends_request_and_parses_response() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime should start");

    let server = rt.block_on(async { MockServer::start().await });

    rt.block_on(async {
        Mock::given(method("POST"))
            .and(path("/api/v2/voice/call"))
            .and(header("authorization", "Bearer tok_blocking"))
            .and(header("x-pine-user-id", "user_blocking"))
            .and(body_json(json!({
                "dialed_number": "+61298765432",
                "callee_name": "Harbour Vet",
                "callee_context": "Dog named Rex",
                "call_objective": "Reschedule checkup",
                "detailed_instructions": "",
                "max_duration_minutes": 120
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "call_id": "call_b",
                "status": "queued"
            })))
            .expect(1)
            .mount(&server)
            .await;
    });

    let initiated = blocking_client(server.uri())
        .calls()
        .create(CallRequest::new(
            "+61298765432",
            "Harbour Vet",
            "Dog named Rex",
            "Reschedule checkup",
        ))
        .expect("create should succeed");

    assert_eq!(initiated.call_id, "call_b");
    assert_eq!(initiated.status, CallStatusKind::Pending);
}

#[test]
fn blocking_wait_follows_the_event_stream() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime should start");
    let server = rt.block_on(start_sse_server(
        vec![SseScript::frames([
            sse_frame(
                Some("1"),
                "status",
                r#"{"call_id":"call_b","status":"in_progress","phase":"connected"}"#,
            ),
            sse_frame(Some("2"), "result", RESULT),
        ])],
        Vec::new(),
    ));

    let seen = std::sync::Arc::new(std::sync::Mutex::new(0usize));
    let sink = seen.clone();
    let result = blocking_client(server.base_url.clone())
        .calls()
        .wait(
            "call_b",
            WaitOptions::default().with_progress(move |_| *sink.lock().unwrap() += 1),
        )
        .expect("wait");

    assert_eq!(result.duration_seconds, 61);
    assert_eq!(*seen.lock().unwrap(), 1);
    assert_eq!(server.poll_count(), 0);
}

#[test]
fn blocking_wait_polls_when_streaming_is_unavailable() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime should start");
    let server = rt.block_on(start_sse_server(
        Vec::new(),
        vec![
            r#"{"call_id":"call_b","status":"in_progress","phase":"dialing"}"#.to_string(),
            RESULT.to_string(),
        ],
    ));

    let result = blocking_client(server.base_url.clone())
        .calls()
        .wait(
            "call_b",
            WaitOptions::default().with_poll_interval(Duration::from_millis(20)),
        )
        .expect("wait");

    assert_eq!(result.status, CallStatusKind::Completed);
    assert_eq!(server.stream_cursors(), vec![None]);
    assert_eq!(server.poll_count(), 2);
}

#[test]
fn blocking_wait_honours_the_deadline() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime should start");
    let server = rt.block_on(start_sse_server(
        Vec::new(),
        vec![r#"{"call_id":"call_b","status":"in_progress"}"#.to_string()],
    ));

    let started = std::time::Instant::now();
    let err = blocking_client(server.base_url.clone())
        .calls()
        .wait(
            "call_b",
            WaitOptions::default()
                .disable_stream()
                .with_poll_interval(Duration::from_secs(30))
                .with_timeout(Duration::from_millis(150)),
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn blocking_wait_releases_a_quiet_stream_after_the_deadline() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime should start");
    let mut script = SseScript::frames([sse_frame(
        Some("1"),
        "status",
        r#"{"call_id":"call_b","status":"in_progress","phase":"ringing"}"#,
    )]);
    for _ in 0..250 {
        script
            .steps
            .push((Duration::from_millis(20), ": heartbeat\n\n".to_string()));
    }
    let server = rt.block_on(start_sse_server(vec![script], Vec::new()));

    let err = blocking_client(server.base_url.clone())
        .calls()
        .wait(
            "call_b",
            WaitOptions::default().with_timeout(Duration::from_millis(200)),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let started = std::time::Instant::now();
    while server.abandoned_streams() == 0 && started.elapsed() < Duration::from_secs(3) {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(server.abandoned_streams(), 1);
}

#[test]
fn blocking_auth_exchange() {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime should start");
    let server = rt.block_on(async { MockServer::start().await });

    rt.block_on(async {
        Mock::given(method("POST"))
            .and(path("/api/v2/auth/email/request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "request_token": "rt_b" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/auth/email/verify"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": { "message": "expired code" }
            })))
            .mount(&server)
            .await;
    });

    let auth = BlockingAuthClient::new(BlockingAuthConfig {
        auth_url: Some(server.uri()),
        ..Default::default()
    })
    .expect("auth client");

    let token = auth.request_code("ada@example.com").expect("request code");
    assert_eq!(token, "rt_b");
    let err = auth.verify_code("ada@example.com", &token, "123456").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
    assert_eq!(err.api_error().unwrap().code.as_deref(), Some("AUTH_VERIFY_FAILED"));
}
