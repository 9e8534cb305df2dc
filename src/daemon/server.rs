//! Local RPC over a Unix socket
//!
//! `POST /v1/<group>/<op>` with a JSON body runs one [`Command`]. Commands are
//! blocking, so each one runs on the blocking pool under the daemon's command
//! timeout. Errors come back as `{"Error": "..."}` with a status derived from
//! the error kind. A command that overruns its timeout is undone once it
//! finishes.
//!
//! The same socket serves the Docker volume plugin protocol under
//! `/Plugin.Activate` and `/VolumeDriver.*`.

use axum::{
    body::Bytes,
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;

use super::{Command, Daemon, PluginOp, PluginRequest, PluginResponse};
use crate::error::{Error, Result};

#[derive(Clone)]
struct AppState {
    daemon: Arc<Daemon>,
    timeout: Duration,
}

fn router(daemon: Arc<Daemon>) -> Router {
    let state = AppState {
        timeout: daemon.cmd_timeout(),
        daemon,
    };
    let mut router = Router::new()
        .route("/v1/info", post(info))
        .route("/v1/{group}/{op}", post(command))
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Capabilities", post(capabilities));
    for op in PluginOp::ALL {
        router = router.route(
            &format!("/{}", op),
            post(move |State(state): State<AppState>, body: Bytes| plugin(state, op, body)),
        );
    }
    router.with_state(state)
}

/// Serve requests on `socket` until SIGINT or SIGTERM
pub async fn serve(daemon: Arc<Daemon>, socket: &Path) -> Result<()> {
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(socket) {
        Ok(()) => log::warn!("Removed stale socket {}", socket.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(socket)?;
    log::info!("Listening on {}", socket.display());

    axum::serve(listener, router(daemon))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = std::fs::remove_file(socket);
    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("Shutting down");
}

async fn info(State(state): State<AppState>) -> Response {
    run(state, "info".to_string(), Bytes::new()).await
}

async fn command(
    State(state): State<AppState>,
    UrlPath((group, op)): UrlPath<(String, String)>,
    body: Bytes,
) -> Response {
    run(state, format!("{}.{}", group, op), body).await
}

async fn run(state: AppState, op: String, body: Bytes) -> Response {
    let command = match Command::parse(&op, &body) {
        Ok(command) => command,
        Err(e) => return error_response(&op, e),
    };
    log::debug!("Request {}: {}", op, String::from_utf8_lossy(&body));

    let result = match dispatch(&state, op.clone(), command).await {
        Outcome::Finished(result) => result,
        Outcome::TimedOut(_) => Err(timed_out(&op, state.timeout)),
    };
    match result {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(e) => error_response(&op, e),
    }
}

/// How a blocking command ended from the caller's side
enum Outcome<T> {
    Finished(Result<T>),
    /// The caller gave up; the handle completes once the late result is undone
    TimedOut(tokio::task::JoinHandle<()>),
}

async fn dispatch(state: &AppState, op: String, command: Command) -> Outcome<serde_json::Value> {
    let undo_op = op.clone();
    execute(
        state,
        op,
        move |daemon| daemon.dispatch(command),
        move |daemon, value| daemon.roll_back(&undo_op, &value),
    )
    .await
}

/// Run `work` on the blocking pool under the command timeout. When the
/// timeout fires first, a successful late result is passed to `undo`.
async fn execute<T, W, U>(state: &AppState, op: String, work: W, undo: U) -> Outcome<T>
where
    T: Send + 'static,
    W: FnOnce(&Daemon) -> Result<T> + Send + 'static,
    U: FnOnce(&Daemon, T) -> Result<()> + Send + 'static,
{
    let daemon = state.daemon.clone();
    let mut task = tokio::task::spawn_blocking(move || work(&daemon));
    match tokio::time::timeout(state.timeout, &mut task).await {
        Ok(Ok(result)) => Outcome::Finished(result),
        Ok(Err(e)) => Outcome::Finished(Err(Error::Backend(format!("{} aborted: {}", op, e)))),
        Err(_) => {
            let daemon = state.daemon.clone();
            Outcome::TimedOut(tokio::spawn(async move {
                let Ok(Ok(value)) = task.await else {
                    return;
                };
                log::warn!("{} finished after its caller timed out, undoing it", op);
                let undone = tokio::task::spawn_blocking(move || undo(&daemon, value)).await;
                match undone {
                    Ok(Ok(())) => log::info!("Undid late {}", op),
                    Ok(Err(e)) => log::error!("Cannot undo late {}: {}", op, e),
                    Err(e) => log::error!("Undo of late {} aborted: {}", op, e),
                }
            }))
        }
    }
}

fn timed_out(op: &str, timeout: Duration) -> Error {
    Error::Timeout(format!("{} did not finish within {:?}", op, timeout))
}

async fn activate() -> Json<serde_json::Value> {
    log::debug!("Plugin activated");
    Json(serde_json::json!({ "Implements": ["VolumeDriver"] }))
}

async fn capabilities() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "Capabilities": { "Scope": "local" } }))
}

/// Docker expects 200 with any failure in `Err`
async fn plugin(state: AppState, op: PluginOp, body: Bytes) -> Json<PluginResponse> {
    Json(match plugin_outcome(&state, op, body).await {
        Outcome::Finished(Ok(response)) => response,
        Outcome::Finished(Err(e)) => {
            log::info!("{} failed: {}", op, e);
            PluginResponse::error(&e)
        }
        Outcome::TimedOut(_) => PluginResponse::error(&timed_out(&op.to_string(), state.timeout)),
    })
}

async fn plugin_outcome(state: &AppState, op: PluginOp, body: Bytes) -> Outcome<PluginResponse> {
    let req: PluginRequest = if body.iter().all(u8::is_ascii_whitespace) {
        PluginRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                return Outcome::Finished(Err(Error::InvalidArgument(format!(
                    "{} request: {}",
                    op, e
                ))))
            }
        }
    };
    let undo_req = req.clone();
    execute(
        state,
        op.to_string(),
        move |daemon| daemon.plugin(op, &req),
        move |daemon, response| daemon.roll_back_plugin(op, &undo_req, &response),
    )
    .await
}

fn status_of(error: &Error) -> StatusCode {
    match error {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        Error::AlreadyExists(_) | Error::Busy(_) | Error::HasChildren(_) => StatusCode::CONFLICT,
        Error::NotSupported { .. } => StatusCode::NOT_IMPLEMENTED,
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(op: &str, error: Error) -> Response {
    let status = status_of(&error);
    if status.is_server_error() {
        log::error!("{} failed: {}", op, error);
    } else {
        log::info!("{} rejected: {}", op, error);
    }
    (
        status,
        Json(serde_json::json!({ "Error": error.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::super::tests::options;
    use super::super::{VolumeListRequest, VolumeRequest};
    use super::*;
    use tempfile::TempDir;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn state(dir: &TempDir) -> AppState {
        let daemon = Arc::new(Daemon::start(options(dir)).unwrap());
        AppState {
            timeout: daemon.cmd_timeout(),
            daemon,
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(&Error::NotFound("v".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(&Error::HasChildren("v".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_of(&Error::not_supported("longhorn", "snapshot")),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(status_of(&Error::InvalidArgument("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(&Error::Timeout("x".into())), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_of(&Error::Corrupt("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requests() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        let response = run(
            state.clone(),
            "volume.create".into(),
            Bytes::from_static(br#"{"Name": "db"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        assert_eq!(created["Name"], "db");

        let response = run(
            state.clone(),
            "volume.create".into(),
            Bytes::from_static(br#"{"Name": "db"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_json(response).await["Error"]
            .as_str()
            .unwrap()
            .contains("db"));

        let response = run(
            state.clone(),
            "volume.inspect".into(),
            Bytes::from_static(br#"{"Volume": "nope"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = run(state.clone(), "volume.resize".into(), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = run(state.clone(), "info".into(), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["General"]["DriverList"][0], "vfs");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timed_out_create_is_undone() {
        let dir = TempDir::new().unwrap();
        let mut state = state(&dir);
        state.timeout = Duration::from_millis(50);

        let command = Command::parse("volume.create", br#"{"Name": "db"}"#).unwrap();
        // Holding the index lock stalls the create past its timeout
        let indexes = state.daemon.write().unwrap();
        let outcome = dispatch(&state, "volume.create".into(), command).await;
        drop(indexes);
        let Outcome::TimedOut(undo) = outcome else {
            panic!("create finished despite the held lock");
        };
        undo.await.unwrap();

        assert!(matches!(
            state.daemon.inspect_volume(&VolumeRequest { volume: "db".into() }),
            Err(Error::NotFound(_))
        ));
        let listed = state
            .daemon
            .list_volumes(&VolumeListRequest {
                driver_specific: true,
            })
            .unwrap();
        assert_eq!(listed, serde_json::json!({}));

        // The name is free again
        let state = AppState {
            timeout: Duration::from_secs(60),
            ..state
        };
        let response = run(
            state,
            "volume.create".into(),
            Bytes::from_static(br#"{"Name": "db"}"#),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timed_out_plugin_mount_is_undone() {
        let dir = TempDir::new().unwrap();
        let mut opts = options(&dir);
        opts.create_on_docker_mount = true;
        let daemon = Arc::new(Daemon::start(opts).unwrap());
        let state = AppState {
            timeout: Duration::from_millis(50),
            daemon,
        };

        let indexes = state.daemon.write().unwrap();
        let body = Bytes::from_static(br#"{"Name": "web"}"#);
        let outcome = plugin_outcome(&state, PluginOp::Mount, body.clone()).await;
        drop(indexes);
        let Outcome::TimedOut(undo) = outcome else {
            panic!("mount finished despite the held lock");
        };
        undo.await.unwrap();

        let response = plugin(state, PluginOp::Get, body).await.0;
        assert!(response.err.contains("web"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_plugin_requests() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);

        assert_eq!(activate().await.0["Implements"][0], "VolumeDriver");
        assert_eq!(capabilities().await.0["Capabilities"]["Scope"], "local");

        let name = Bytes::from_static(br#"{"Name": "db", "Opts": {"size": "1G"}}"#);
        let created = plugin(state.clone(), PluginOp::Create, name.clone()).await.0;
        assert_eq!(serde_json::to_value(&created).unwrap(), serde_json::json!({}));

        let mounted = plugin(state.clone(), PluginOp::Mount, name.clone()).await.0;
        assert!(!mounted.mountpoint.is_empty());
        assert_eq!(
            serde_json::to_value(&mounted).unwrap(),
            serde_json::json!({ "Mountpoint": mounted.mountpoint })
        );

        let listed = plugin(state.clone(), PluginOp::List, Bytes::new()).await.0;
        assert_eq!(listed.volumes.map(|v| v.len()), Some(1));

        let missing = plugin(
            state.clone(),
            PluginOp::Path,
            Bytes::from_static(br#"{"Name": "nope"}"#),
        )
        .await
        .0;
        assert!(missing.mountpoint.is_empty());
        assert!(missing.err.contains("nope"));

        let garbled = plugin(state.clone(), PluginOp::Create, Bytes::from_static(b"{")).await.0;
        assert!(!garbled.err.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serve_on_socket() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let socket = dir.path().join("run").join("convoy.sock");

        let server = tokio::spawn({
            let daemon = state.daemon.clone();
            let socket = socket.clone();
            async move { serve(daemon, &socket).await }
        });
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(socket.exists());

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
        stream
            .write_all(b"POST /v1/info HTTP/1.1\r\nHost: convoy\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.contains("\"General\""));

        let mut stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
        let body = r#"{"Name": "db"}"#;
        let request = format!(
            "POST /VolumeDriver.Path HTTP/1.1\r\nHost: convoy\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.contains("\"Err\""));

        server.abort();
    }
}
