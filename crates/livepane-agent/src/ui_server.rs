use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatService, Sender};
use crate::controller::Controller;
use crate::environment::{ReportedEnvironment, diagnose};
use crate::error_payload::ApiError;

const DEFAULT_LOG_PAGE: usize = 200;
const MAX_LOG_PAGE: usize = 2000;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
    pub chat: Arc<ChatService>,
}

pub fn router(state: AppState, isolation_headers: bool) -> Router {
    let mut app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status))
        .route("/api/run", post(run))
        .route("/api/stop", post(stop))
        .route("/api/runtime/retry", post(retry_runtime))
        .route("/api/diagnostics", get(diagnostics).post(diagnose_reported))
        .route("/api/files", get(list_files))
        .route("/api/files/*path", get(read_file).put(write_file))
        .route("/api/preview", get(preview).put(navigate_preview))
        .route("/api/logs", get(logs))
        .route("/api/messages", get(messages).post(send_message))
        .route("/api/notices", get(notices))
        .with_state(state);
    if isolation_headers {
        app = app.layer(middleware::from_fn(cross_origin_isolation));
    }
    app
}

// Needed for SharedArrayBuffer in the browser that embeds the preview.
async fn cross_origin_isolation(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(
        "cross-origin-embedder-policy",
        HeaderValue::from_static("require-corp"),
    );
    headers.insert(
        "cross-origin-opener-policy",
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        "cross-origin-resource-policy",
        HeaderValue::from_static("cross-origin"),
    );
    resp
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.status().await)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunAccepted {
    session_id: String,
}

async fn run(State(state): State<AppState>) -> Result<Response, ApiError> {
    let session = state
        .controller
        .begin_run()
        .await
        .map_err(|rejected| ApiError::conflict(rejected.code(), rejected.to_string()))?;

    tokio::spawn(state.controller.clone().drive(session.clone()));
    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            session_id: session.0,
        }),
    )
        .into_response())
}

async fn stop(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    if state.controller.stop().await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::conflict(
            "not_running",
            "No running application to stop.",
        ))
    }
}

async fn retry_runtime(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.controller.runtime().retry().await {
        Ok(_) => Ok(Json(state.controller.status().await).into_response()),
        Err(err) => Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            err.kind.code(),
            err.message,
        )
        .with_hint("Retry again after fixing the hosting environment.")),
    }
}

async fn diagnostics(State(state): State<AppState>) -> impl IntoResponse {
    Json(diagnose(state.controller.runtime().environment()))
}

async fn diagnose_reported(Json(reported): Json<ReportedEnvironment>) -> impl IntoResponse {
    Json(diagnose(&reported.into()))
}

#[derive(Serialize)]
struct FileList {
    files: Vec<String>,
    selected: Option<String>,
}

async fn list_files(State(state): State<AppState>) -> impl IntoResponse {
    Json(FileList {
        files: state.controller.files().await,
        selected: state.controller.selected_file().await,
    })
}

#[derive(Serialize)]
struct FileContents {
    path: String,
    contents: String,
}

async fn read_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<FileContents>, ApiError> {
    let contents = state
        .controller
        .file(&path)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no such file: {path}")))?;
    state.controller.select_file(&path).await;
    Ok(Json(FileContents { path, contents }))
}

#[derive(Deserialize)]
struct WriteFileBody {
    contents: String,
}

async fn write_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Json(body): Json<WriteFileBody>,
) -> Result<StatusCode, ApiError> {
    state
        .controller
        .edit_file(&path, body.contents)
        .await
        .map_err(|e| ApiError::bad_request("invalid_path", e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn preview(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.preview().snapshot())
}

#[derive(Deserialize)]
struct NavigateBody {
    address: String,
}

async fn navigate_preview(
    State(state): State<AppState>,
    Json(body): Json<NavigateBody>,
) -> impl IntoResponse {
    let preview = state.controller.preview();
    preview.navigate(body.address);
    Json(preview.snapshot())
}

#[derive(Deserialize)]
struct LogQuery {
    #[serde(default)]
    cursor: u64,
    limit: Option<usize>,
}

async fn logs(State(state): State<AppState>, Query(q): Query<LogQuery>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(DEFAULT_LOG_PAGE).clamp(1, MAX_LOG_PAGE);
    Json(state.controller.log().tail(q.cursor, limit).await)
}

#[derive(Deserialize)]
struct AfterQuery {
    #[serde(default)]
    after: u64,
}

async fn messages(State(state): State<AppState>, Query(q): Query<AfterQuery>) -> impl IntoResponse {
    Json(state.chat.messages(q.after).await)
}

#[derive(Deserialize)]
struct SendMessageBody {
    sender: Sender,
    message: String,
}

#[derive(Serialize)]
struct SendResult {
    delivered: bool,
}

async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<SendResult>, ApiError> {
    if body.message.trim().is_empty() {
        return Err(ApiError::bad_request("empty_message", "message is empty"));
    }
    let delivered = state
        .chat
        .send(body.sender, body.message)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()))?;
    Ok(Json(SendResult { delivered }))
}

async fn notices(State(state): State<AppState>, Query(q): Query<AfterQuery>) -> impl IntoResponse {
    Json(state.controller.notices(q.after).await)
}

#[cfg(test)]
mod tests {
    use livepane_process::RunPhase;
    use serde_json::{Value, json};

    use super::*;
    use crate::testing::{booted_controller, eventually};

    struct Server {
        base: String,
        http: reqwest::Client,
        controller: Arc<Controller>,
    }

    async fn start(isolation: bool) -> Server {
        let (controller, _) = booted_controller().await;
        let chat = Arc::new(ChatService::new(controller.clone(), None));
        let app = router(
            AppState {
                controller: controller.clone(),
                chat,
            },
            isolation,
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Server {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
            controller,
        }
    }

    impl Server {
        fn url(&self, path: &str) -> String {
            format!("{}{path}", self.base)
        }
    }

    #[tokio::test]
    async fn sets_isolation_headers() {
        let s = start(true).await;
        let resp = s.http.get(s.url("/healthz")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let h = resp.headers();
        assert_eq!(h["cross-origin-embedder-policy"], "require-corp");
        assert_eq!(h["cross-origin-opener-policy"], "same-origin");
        assert_eq!(h["cross-origin-resource-policy"], "cross-origin");

        let s = start(false).await;
        let resp = s.http.get(s.url("/healthz")).send().await.unwrap();
        assert!(resp.headers().get("cross-origin-embedder-policy").is_none());
    }

    #[tokio::test]
    async fn run_on_empty_tree_is_conflict() {
        let s = start(true).await;
        let resp = s.http.post(s.url("/api/run")).send().await.unwrap();
        assert_eq!(resp.status(), 409);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "empty_tree");
        assert_eq!(
            body["message"],
            "No files to run. Please ask AI to create a project first."
        );
    }

    #[tokio::test]
    async fn edit_then_run() {
        let s = start(true).await;
        let resp = s
            .http
            .put(s.url("/api/files/server.js"))
            .json(&json!({"contents": "require('http')"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);

        let file: Value = s
            .http
            .get(s.url("/api/files/server.js"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(file["contents"], "require('http')");

        let missing = s.http.get(s.url("/api/files/nope.js")).send().await.unwrap();
        assert_eq!(missing.status(), 404);

        let resp = s.http.post(s.url("/api/run")).send().await.unwrap();
        assert_eq!(resp.status(), 202);
        let accepted: Value = resp.json().await.unwrap();
        assert!(accepted["sessionId"].is_string());

        let c = s.controller.clone();
        assert!(
            eventually(|| {
                let c = c.clone();
                async move { c.status().await.phase == RunPhase::Starting }
            })
            .await
        );
        let files: Value = s
            .http
            .get(s.url("/api/files"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(files["files"], json!(["server.js", "package.json"]));

        let logs: Value = s
            .http
            .get(s.url("/api/logs?cursor=0&limit=500"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(logs["lines"].as_array().unwrap().iter().any(|l| l == "[livepane] $ npm install"));
    }

    #[tokio::test]
    async fn rejects_traversal_paths() {
        let s = start(true).await;
        let resp = s
            .http
            .put(s.url("/api/files/a/..%2F..%2Fetc"))
            .json(&json!({"contents": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "invalid_path");
    }

    #[tokio::test]
    async fn stop_without_process_is_conflict() {
        let s = start(true).await;
        let resp = s.http.post(s.url("/api/stop")).send().await.unwrap();
        assert_eq!(resp.status(), 409);
    }

    #[tokio::test]
    async fn preview_navigation_override() {
        let s = start(true).await;
        let state: Value = s
            .http
            .put(s.url("/api/preview"))
            .json(&json!({"address": "http://localhost:3000/about"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(state["address"], "http://localhost:3000/about");
        assert_eq!(state["published"], Value::Null);
    }

    #[tokio::test]
    async fn diagnostics_for_reported_environment() {
        let s = start(true).await;
        let diag: Value = s
            .http
            .post(s.url("/api/diagnostics"))
            .json(&json!({
                "url": "http://example.com/",
                "isSecureContext": false,
                "crossOriginIsolated": false,
                "userAgent": "Mozilla/5.0 Chrome/120.0"
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(diag["can_proceed"], false);

        let own: Value = s
            .http
            .get(s.url("/api/diagnostics"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(own["can_proceed"], true);
    }

    #[tokio::test]
    async fn messages_round_trip_locally() {
        let s = start(true).await;
        let sent: Value = s
            .http
            .post(s.url("/api/messages"))
            .json(&json!({"sender": {"_id": "u1"}, "message": "hi"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sent["delivered"], false);

        let list: Value = s
            .http
            .get(s.url("/api/messages?after=0"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list[0]["text"], "hi");
        assert_eq!(list[0]["kind"], "plain");
    }
}
