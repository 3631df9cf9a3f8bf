use std::{convert::Infallible, path::Path};

use axum::{
    Form, Json, Router,
    extract::{DefaultBodyLimit, Multipart, Query, State, multipart::MultipartError},
    http::StatusCode,
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use futures_util::{Stream, StreamExt};
use minimc_process::{LogLine, ServerStatus};
use serde::{Deserialize, Serialize};
use tower_http::services::{ServeDir, ServeFile};

use crate::{
    error_payload::ApiError,
    files::{ExtractReport, FileInfo},
    security::require_basic_auth,
    state::AppState,
    stats::{self, ServerStats},
};

const DEFAULT_TAIL_LIMIT: usize = 200;
const MAX_TAIL_LIMIT: usize = 1000;
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Full HTTP surface. Every route, static assets included, sits behind Basic auth.
pub fn router(state: AppState, web_dir: Option<&Path>) -> Router {
    let api = Router::new()
        .route("/logs", get(stream_logs))
        .route("/logs/tail", get(tail_logs))
        .route("/command", post(run_command))
        .route("/status", get(status))
        .route("/stats", get(resource_stats))
        .route("/files", get(list_files).delete(delete_file))
        .route("/files/", get(list_files))
        .route(
            "/files/content",
            get(read_file).post(write_file).put(write_file),
        )
        .route("/files/mkdir", post(make_dir))
        .route("/files/move", post(move_file))
        .route("/files/copy", post(copy_file))
        .route("/files/extract", post(extract_archive))
        .route(
            "/files/upload",
            post(upload_file).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        );

    let mut app = Router::new().nest("/api", api);
    if let Some(dir) = web_dir {
        app = app.fallback_service(
            ServeDir::new(dir).fallback(ServeFile::new(dir.join("index.html"))),
        );
    }

    app.layer(middleware::from_fn_with_state(
        state.clone(),
        require_basic_auth,
    ))
    .with_state(state)
}

fn log_event(line: &LogLine) -> Event {
    // SSE cannot carry carriage returns; progress bars in server output use them.
    let data = line.render().replace('\r', "");
    Event::default()
        .id(line.seq.to_string())
        .event(line.level.as_str())
        .data(data)
}

async fn stream_logs(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (history, live) = state.hub.subscribe_with_snapshot();
    let stream = futures_util::stream::iter(history)
        .chain(live.into_stream())
        .take_until(state.shutdown.cancelled_owned())
        .map(|line| Ok(log_event(&line)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct TailQuery {
    cursor: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TailResponse {
    lines: Vec<LogLine>,
    next_cursor: u64,
}

async fn tail_logs(
    State(state): State<AppState>,
    Query(q): Query<TailQuery>,
) -> Json<TailResponse> {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_TAIL_LIMIT)
        .clamp(1, MAX_TAIL_LIMIT);
    let (lines, next_cursor) = state.hub.tail_after(q.cursor.unwrap_or(0), limit);
    Json(TailResponse { lines, next_cursor })
}

#[derive(Debug, Deserialize)]
struct CommandForm {
    #[serde(default)]
    command: String,
}

async fn run_command(
    State(state): State<AppState>,
    Form(form): Form<CommandForm>,
) -> Result<StatusCode, ApiError> {
    // Keywords match trimmed; console lines go through as typed.
    match form.command.trim() {
        "" => {
            return Err(ApiError::bad_request(
                "missing_command",
                "command is required",
            ));
        }
        "start" => {
            state.supervisor.start()?;
        }
        "stop" => state.supervisor.stop()?,
        "kill" => state.supervisor.kill()?,
        "stats" => {
            let stats = stats::collect(state.files.root()).await;
            tracing::info!("{}", stats.summary());
        }
        _ => state.supervisor.run_command(&form.command)?,
    }
    Ok(StatusCode::OK)
}

async fn status(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(state.supervisor.describe())
}

async fn resource_stats(State(state): State<AppState>) -> Json<ServerStats> {
    Json(stats::collect(state.files.root()).await)
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
struct PathBody {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileContent {
    #[serde(default)]
    path: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct FromTo {
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
}

fn required(path: &str) -> Result<&str, ApiError> {
    if path.trim().is_empty() {
        return Err(ApiError::bad_request("missing_path", "path is required"));
    }
    Ok(path)
}

async fn list_files(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> Result<Json<Vec<FileInfo>>, ApiError> {
    Ok(Json(state.files.list(&q.path).await?))
}

async fn read_file(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> Result<Json<FileContent>, ApiError> {
    let content = state.files.read(required(&q.path)?).await?;
    Ok(Json(FileContent {
        path: q.path,
        content,
    }))
}

async fn write_file(
    State(state): State<AppState>,
    Json(body): Json<FileContent>,
) -> Result<StatusCode, ApiError> {
    state
        .files
        .write(required(&body.path)?, &body.content)
        .await?;
    Ok(StatusCode::OK)
}

async fn delete_file(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
) -> Result<StatusCode, ApiError> {
    state.files.remove(required(&q.path)?).await?;
    Ok(StatusCode::OK)
}

async fn make_dir(
    State(state): State<AppState>,
    Json(body): Json<PathBody>,
) -> Result<StatusCode, ApiError> {
    state.files.mkdir(required(&body.path)?).await?;
    Ok(StatusCode::CREATED)
}

fn required_pair(body: &FromTo) -> Result<(&str, &str), ApiError> {
    if body.from.trim().is_empty() || body.to.trim().is_empty() {
        return Err(ApiError::bad_request(
            "missing_path",
            "both from and to are required",
        ));
    }
    Ok((&body.from, &body.to))
}

async fn move_file(
    State(state): State<AppState>,
    Json(body): Json<FromTo>,
) -> Result<StatusCode, ApiError> {
    let (from, to) = required_pair(&body)?;
    state.files.rename(from, to).await?;
    Ok(StatusCode::OK)
}

async fn copy_file(
    State(state): State<AppState>,
    Json(body): Json<FromTo>,
) -> Result<StatusCode, ApiError> {
    let (from, to) = required_pair(&body)?;
    state.files.copy(from, to).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct ExtractBody {
    #[serde(default)]
    path: String,
    #[serde(default)]
    destination: Option<String>,
}

async fn extract_archive(
    State(state): State<AppState>,
    Json(body): Json<ExtractBody>,
) -> Result<Json<ExtractReport>, ApiError> {
    let report = state
        .files
        .extract(required(&body.path)?, body.destination.as_deref())
        .await?;
    tracing::info!(
        "extracted {} files from {} to /{}",
        report.count,
        report.source,
        report.destination
    );
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    path: String,
    size: u64,
}

fn multipart_error(err: MultipartError) -> ApiError {
    ApiError::new(err.status(), "invalid_upload", err.body_text())
}

/// Multipart upload: a `path` field (or `?path=` query) naming the target, then a `file`
/// field with the content. The file is streamed to disk, so the path must come first.
async fn upload_file(
    State(state): State<AppState>,
    Query(q): Query<PathQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut path = q.path;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("path") => path = field.text().await.map_err(multipart_error)?,
            Some("file") => {
                let rel = required(&path)
                    .map_err(|e| e.with_hint("send the path field before the file field"))?
                    .to_string();
                let size = state.files.write_stream(&rel, field).await?;
                tracing::info!("uploaded file: {rel} ({size} bytes)");
                return Ok(Json(UploadResponse { path: rel, size }));
            }
            _ => {}
        }
    }
    Err(ApiError::bad_request(
        "missing_file",
        "a multipart field named file is required",
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{Request, Response, header},
    };
    use base64::Engine;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        files::FileTree,
        launch::LaunchSpec,
        log_hub::LogHub,
        state::Credentials,
        supervisor::{ProcessRegistry, Supervisor, SupervisorOptions},
    };

    fn app_with(script: &str) -> (Router, AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchSpec::new(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string()],
            dir.path(),
        );
        let supervisor = Supervisor::new(
            ProcessRegistry::new(),
            LogHub::default(),
            launch,
            SupervisorOptions::default(),
        );
        let state = AppState::new(
            supervisor,
            FileTree::new(dir.path()),
            Credentials {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
            CancellationToken::new(),
        );
        (router(state.clone(), None), state, dir)
    }

    fn app() -> (Router, AppState, tempfile::TempDir) {
        app_with("exec sleep 30")
    }

    fn auth() -> String {
        let token = base64::engine::general_purpose::STANDARD.encode("admin:secret");
        format!("Basic {token}")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri)
            .header(header::AUTHORIZATION, auth())
            .body(Body::empty())
            .unwrap()
    }

    fn command(cmd: &str) -> Request<Body> {
        Request::post("/api/command")
            .header(header::AUTHORIZATION, auth())
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("command={cmd}")))
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, auth())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn requests_without_credentials_are_rejected() {
        let (app, _state, _dir) = app();
        let resp = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn status_reports_idle() {
        let (app, _state, _dir) = app();
        let resp = app.oneshot(get("/api/status")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["running"], false);
        assert_eq!(body["state"], "idle");
    }

    #[tokio::test]
    async fn empty_command_is_a_bad_request() {
        let (app, _state, _dir) = app();
        let resp = app.oneshot(command("")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "missing_command");
    }

    #[tokio::test]
    async fn stop_while_idle_conflicts() {
        let (app, _state, _dir) = app();
        let resp = app.oneshot(command("stop")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = json_body(resp).await;
        assert_eq!(body["code"], "not_running");
        assert!(body["hint"].is_string());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_then_duplicate_start_then_kill() {
        let (app, state, _dir) = app();
        let resp = app.clone().oneshot(command("start")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.supervisor.status());

        let resp = app.clone().oneshot(command("start")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["code"], "already_running");

        let resp = app.oneshot(command("kill")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.supervisor.wait_for_exit(Duration::from_secs(5)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn console_lines_reach_the_server() {
        let (app, state, _dir) = app_with(
            r#"while IFS= read -r line; do echo "got:$line"; done"#,
        );
        let resp = app.clone().oneshot(command("start")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(command("say+hello")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let mut seen = false;
        for _ in 0..100 {
            if state.hub.snapshot().iter().any(|l| l.text == "got:say hello") {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen);
        state.supervisor.kill().unwrap();
        assert!(state.supervisor.wait_for_exit(Duration::from_secs(5)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn console_lines_are_forwarded_as_typed_and_single() {
        let (app, state, _dir) = app_with(
            r#"while IFS= read -r line; do echo "got:[$line]"; done"#,
        );
        let resp = app.clone().oneshot(command("+start+")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.clone().oneshot(command("say+hi%0Aop+someone")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "invalid_command");

        let resp = app.oneshot(command("++say+spaced++")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let mut seen = false;
        for _ in 0..100 {
            if state
                .hub
                .snapshot()
                .iter()
                .any(|l| l.text == "got:[  say spaced  ]")
            {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen);
        assert!(
            !state
                .hub
                .snapshot()
                .iter()
                .any(|l| l.text.starts_with("got:[op"))
        );
        state.supervisor.kill().unwrap();
        assert!(state.supervisor.wait_for_exit(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn tail_pages_after_cursor() {
        let (app, state, _dir) = app();
        state.hub.info("one");
        state.hub.info("two");
        state.hub.info("three");

        let resp = app
            .oneshot(get("/api/logs/tail?cursor=1&limit=10"))
            .await
            .unwrap();
        let body = json_body(resp).await;
        let texts: Vec<&str> = body["lines"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["two", "three"]);
        assert_eq!(body["next_cursor"], 3);
    }

    #[tokio::test]
    async fn log_stream_replays_history_as_sse() {
        let (app, state, _dir) = app();
        state.hub.info("hello");
        state.hub.warn("careful");

        let resp = app.oneshot(get("/api/logs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let mut body = resp.into_body().into_data_stream();
        let mut text = String::new();
        while !text.contains("careful") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        let fields: Vec<(&str, &str)> = text
            .lines()
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k, v.strip_prefix(' ').unwrap_or(v)))
            .collect();
        assert!(fields.contains(&("id", "1")));
        assert!(fields.contains(&("event", "info")));
        assert!(fields.contains(&("data", "[i] hello")));
        assert!(fields.contains(&("event", "warning")));
        assert!(fields.contains(&("data", "[w] careful")));
    }

    #[tokio::test]
    async fn file_routes_round_trip() {
        let (app, _state, _dir) = app();
        let resp = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/files/content",
                serde_json::json!({ "path": "/config/paper.yml", "content": "a: 1\n" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(get("/api/files/content?path=config/paper.yml"))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["content"], "a: 1\n");

        let resp = app.clone().oneshot(get("/api/files?path=config")).await.unwrap();
        let body = json_body(resp).await;
        assert_eq!(body[0]["name"], "paper.yml");
        assert_eq!(body[0]["extension"], "yml");

        let resp = app
            .clone()
            .oneshot(get("/api/files/content?path=../etc/passwd"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "invalid_path");

        let resp = app
            .oneshot(
                Request::delete("/api/files?path=")
                    .header(header::AUTHORIZATION, auth())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (app, _state, _dir) = app();
        let resp = app
            .oneshot(get("/api/files/content?path=nope.txt"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["code"], "file_not_found");
    }

    #[tokio::test]
    async fn extract_route_unpacks_tar_gz() {
        let (app, _state, dir) = app();
        let file = std::fs::File::create(dir.path().join("plugins.tgz")).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "plugins/a.yml", "x\n".as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let resp = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/files/extract",
                serde_json::json!({ "path": "plugins.tgz" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["extracted_files"][0], "plugins/a.yml");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("plugins/a.yml")).unwrap(),
            "x\n"
        );

        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/files/extract",
                serde_json::json!({ "path": "plugins/a.yml" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "unsupported_format");
    }

    fn multipart(parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
        const BOUNDARY: &str = "minimc-upload-boundary";
        let mut body = String::new();
        for (name, filename, content) in parts {
            body.push_str(&format!("--{BOUNDARY}\r\n"));
            match filename {
                Some(f) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(content);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        Request::post("/api/files/upload")
            .header(header::AUTHORIZATION, auth())
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_writes_the_file_part() {
        let (app, _state, dir) = app();
        let resp = app
            .clone()
            .oneshot(multipart(&[
                ("path", None, "plugins/motd.txt"),
                ("file", Some("motd.txt"), "welcome"),
            ]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["path"], "plugins/motd.txt");
        assert_eq!(body["size"], 7);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("plugins/motd.txt")).unwrap(),
            "welcome"
        );

        let resp = app
            .clone()
            .oneshot(multipart(&[
                ("path", None, "../escape.txt"),
                ("file", Some("x"), "x"),
            ]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "invalid_path");

        let resp = app
            .oneshot(multipart(&[("file", Some("x"), "x")]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "missing_path");
    }
}
