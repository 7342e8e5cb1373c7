//! In-process GitLab lookalike served on an ephemeral port.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

pub const TOKEN: &str = "glpat-test";
pub const PROJECT_ID: u64 = 37;

pub struct Fixture {
    /// `http://127.0.0.1:<port>`
    pub base: String,
}

impl Fixture {
    pub fn endpoint(&self) -> String {
        format!("{}/api/v4", self.base)
    }

    pub fn host(&self) -> &str {
        self.base.trim_start_matches("http://")
    }
}

/// Bind `127.0.0.1:0` and serve the fixture router until the test ends.
pub async fn start() -> Fixture {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind fixture listener");
    let addr = listener.local_addr().expect("Failed to read fixture address");
    let base = format!("http://{addr}");

    let app = router(base.clone());
    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("Fixture server failed");
    });

    Fixture { base }
}

fn router(base: String) -> Router {
    Router::new()
        .route("/api/v4/echo", get(echo))
        .route("/api/v4/slow", get(slow))
        .route("/api/v4/projects/{id}", get(project))
        .route("/api/v4/projects/{id}/issues", get(issues))
        .route("/api/v4/projects/{id}/milestones", get(milestones))
        .route("/api/v4/projects/{id}/merge_requests", get(merge_requests))
        .route(
            "/api/v4/projects/{id}/merge_requests/{iid}/notes",
            get(mr_notes),
        )
        .route("/api/v4/projects/{id}/pipelines", get(pipelines))
        .fallback(|| async { not_found() })
        .with_state(base)
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("private-token").and_then(|v| v.to_str().ok()) == Some(TOKEN)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "401 Unauthorized"})),
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"message": "404 Not Found"})),
    )
        .into_response()
}

/// One page of `items`, with GitLab's paging and rate-limit headers.
fn page(items: Vec<Value>, query: &HashMap<String, String>) -> Response {
    let per_page: usize = query
        .get("per_page")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20)
        .max(1);
    let page: usize = query
        .get("page")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
        .max(1);
    let total_pages = items.len().div_ceil(per_page).max(1);
    let body: Vec<Value> = items
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .collect();
    let reset = (chrono::Utc::now().timestamp() + 60).to_string();

    (
        [
            ("x-total-pages", total_pages.to_string()),
            ("ratelimit-limit", "6000".to_string()),
            ("ratelimit-remaining", "5999".to_string()),
            ("ratelimit-reset", reset),
        ],
        Json(body),
    )
        .into_response()
}

fn updated_after(items: Vec<Value>, query: &HashMap<String, String>) -> Vec<Value> {
    match query.get("updated_after") {
        None => items,
        Some(after) => items
            .into_iter()
            .filter(|i| i["updated_at"].as_str().unwrap_or_default() >= after.as_str())
            .collect(),
    }
}

async fn echo(headers: HeaderMap, Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    Json(json!({
        "query": query,
        "private_token": header("private-token"),
        "user_agent": header("user-agent"),
    }))
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(json!({}))
}

async fn project(State(base): State<String>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    match id.as_str() {
        "37" | "infra/sluice" => Json(json!({
            "id": PROJECT_ID,
            "path_with_namespace": "infra/sluice",
            "http_url_to_repo": format!("{base}/infra/sluice.git"),
        }))
        .into_response(),
        _ => not_found(),
    }
}

async fn issues(
    Path(id): Path<u64>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if id != PROJECT_ID {
        return not_found();
    }
    let all = (1..=4)
        .map(|i| json!({"id": 100 + i, "iid": i, "updated_at": format!("2024-05-0{i}T12:00:00Z")}))
        .collect();
    page(updated_after(all, &query), &query)
}

async fn milestones(Path(_id): Path<u64>, Query(query): Query<HashMap<String, String>>) -> Response {
    let all = (1..=3).map(|i| json!({"id": i, "title": format!("v0.{i}")})).collect();
    page(all, &query)
}

async fn merge_requests(
    Path(_id): Path<u64>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let all = vec![
        json!({"id": 500, "iid": 5, "updated_at": "2024-05-01T12:00:00Z"}),
        json!({"id": 600, "iid": 6, "updated_at": "2024-05-02T12:00:00Z"}),
    ];
    page(updated_after(all, &query), &query)
}

async fn mr_notes(
    Path((_id, iid)): Path<(u64, u64)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let all = vec![
        json!({"id": iid * 10, "body": "lgtm", "system": false}),
        json!({"id": iid * 10 + 1, "body": "ship it", "system": false}),
    ];
    page(all, &query)
}

async fn pipelines() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"message": "403 Forbidden"})),
    )
        .into_response()
}
