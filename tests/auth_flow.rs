//! Email verification-code exchange against a wiremock server.

use pine_voice::{AuthClient, AuthConfig, Client, Config, Error, ErrorKind, RetryConfig};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn auth_for_server(server: &MockServer) -> AuthClient {
    AuthClient::new(AuthConfig {
        auth_url: Some(server.uri()),
        ..Default::default()
    })
    .expect("auth client")
}

#[tokio::test]
async fn request_and_verify_yield_usable_credentials() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v2/auth/email/request"))
        .and(body_json(json!({ "email": "ada@example.com" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "request_token": "rt_123" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/auth/email/verify"))
        .and(body_json(json!({
            "email": "ada@example.com",
            "request_token": "rt_123",
            "code": "424242"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "access_token": "at_live", "id": "user_ada" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/voice/call/c1"))
        .and(header("authorization", "Bearer at_live"))
        .and(header("x-pine-user-id", "user_ada"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "call_id": "c1",
            "status": "pending"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let auth = auth_for_server(&server);
    let token = auth.request_code(" ada@example.com ").await.expect("request code");
    assert_eq!(token, "rt_123");
    let creds = auth
        .verify_code("ada@example.com", &token, "424242")
        .await
        .expect("verify code");
    assert_eq!(creds.user_id(), "user_ada");
    assert_eq!(creds.access_token(), "at_live");

    let client = Client::with_credentials(
        creds,
        Config {
            gateway_url: Some(server.uri()),
            retry: Some(RetryConfig::disabled()),
            ..Default::default()
        },
    )
    .expect("client");
    let lookup = client.calls().get("c1").await.expect("lookup");
    assert!(!lookup.is_terminal());
}

#[tokio::test]
async fn rejected_code_is_an_auth_failure_with_remote_code() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v2/auth/email/verify"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": "INVALID_CODE", "message": "code does not match" }
        })))
        .mount(&server)
        .await;

    let err = auth_for_server(&server)
        .verify_code("ada@example.com", "rt", "000000")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
    assert_eq!(err.api_error().unwrap().code.as_deref(), Some("INVALID_CODE"));
    assert_eq!(err.api_error().unwrap().status, 400);
}

#[tokio::test]
async fn request_failure_without_code_gets_a_default() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v2/auth/email/request"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let err = auth_for_server(&server)
        .request_code("ada@example.com")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthFailure);
    assert_eq!(
        err.api_error().unwrap().code.as_deref(),
        Some("AUTH_REQUEST_FAILED")
    );
}

#[tokio::test]
async fn missing_token_in_success_body_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v2/auth/email/request"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
        .mount(&server)
        .await;

    let err = auth_for_server(&server)
        .request_code("ada@example.com")
        .await
        .unwrap_err();
    assert_eq!(err.api_error().unwrap().code.as_deref(), Some("NO_TOKEN"));
}

#[tokio::test]
async fn blank_inputs_are_validation_errors() {
    let auth = AuthClient::new(AuthConfig::default()).unwrap();
    assert!(matches!(auth.request_code("  ").await, Err(Error::Validation(_))));
    match auth.verify_code("ada@example.com", "rt", " ").await {
        Err(Error::Validation(v)) => assert_eq!(v.field.as_deref(), Some("code")),
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn client_without_credentials_is_a_config_error() {
    let err = Client::new(Config {
        access_token: Some(" ".into()),
        user_id: Some("u".into()),
        gateway_url: Some("http://127.0.0.1:9".into()),
        ..Default::default()
    });
    // Only fails when the environment does not supply a token either.
    if std::env::var("PINE_ACCESS_TOKEN").map(|v| v.trim().is_empty()).unwrap_or(true) {
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
