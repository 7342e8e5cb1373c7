use std::time::Duration;

use sluice_client::gitlab::client_config;
use sluice_client::{HeaderToken, ReqwestTransport};
use sluice_core::client::AsyncClient;
use sluice_core::error::AppError;
use sluice_core::request::ApiRequest;
use sluice_core::traits::Transport;
use tokio_util::sync::CancellationToken;

use crate::integration::fixture::{self, TOKEN};

fn client(endpoint: String, token: Option<&str>) -> AsyncClient<ReqwestTransport> {
    let mut builder = AsyncClient::builder(ReqwestTransport::new().unwrap(), client_config(endpoint));
    if let Some(token) = token {
        builder = builder.with_request_hook(HeaderToken::gitlab(token));
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn query_and_auth_header_reach_the_server() {
    let server = fixture::start().await;
    let client = client(server.endpoint(), Some(TOKEN));

    let response = client
        .execute(
            ApiRequest::get("echo").with_query("updated_after", "2024-05-03T12:00:00Z"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let body: serde_json::Value = response.json_body().unwrap();
    assert_eq!(body["query"]["updated_after"], "2024-05-03T12:00:00Z");
    assert_eq!(body["private_token"], TOKEN);
    assert!(body["user_agent"].as_str().unwrap().starts_with("Sluice/"));
}

#[tokio::test]
async fn transport_returns_error_statuses_as_responses() {
    let server = fixture::start().await;
    let transport = ReqwestTransport::new().unwrap();

    let response = transport
        .send(&ApiRequest::get(format!("{}/nope", server.endpoint())))
        .await
        .unwrap();

    assert_eq!(response.status, 404);
    assert!(response.text_snippet(100).contains("404 Not Found"));
    assert_eq!(response.header("content-type"), Some("application/json"));
}

#[tokio::test]
async fn client_classifies_not_found() {
    let server = fixture::start().await;
    let client = client(server.endpoint(), Some(TOKEN));

    let err = client
        .execute(ApiRequest::get("projects/999"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::HttpStatus { status: 404, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn rejected_token_makes_client_unauthorized() {
    let server = fixture::start().await;
    let client = client(server.endpoint(), Some("glpat-wrong"));
    let cancel = CancellationToken::new();

    let err = client
        .execute(ApiRequest::get("projects/37/issues"), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(client.is_unauthorized());

    let again = client
        .execute(ApiRequest::get("echo"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(again, AppError::Unauthorized { .. }));
}

#[tokio::test]
async fn gitlab_rate_limit_headers_drive_the_limiter() {
    let server = fixture::start().await;
    let client = client(server.endpoint(), Some(TOKEN));

    client
        .execute(ApiRequest::get("projects/37/issues"), &CancellationToken::new())
        .await
        .unwrap();

    let state = client.rate_limiter().state().unwrap();
    assert_eq!(state.limit, 6000);
    assert!(state.remaining <= 5999);
    assert_eq!(client.rate_limiter().interval(), Duration::from_millis(10));
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = fixture::start().await;
    let transport = ReqwestTransport::with_timeout(Duration::from_millis(200)).unwrap();

    let err = transport
        .send(&ApiRequest::get(format!("{}/slow", server.endpoint())))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Timeout(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn refused_connection_is_a_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = ReqwestTransport::new()
        .unwrap()
        .send(&ApiRequest::get(format!("http://{addr}/api/v4/projects")))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NetworkError(_)));
}
