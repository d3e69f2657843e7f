// SPDX-License-Identifier: Apache-2.0

//! Request/response protocol over a Unix-domain socket: status, log queries,
//! restart-with-readiness, and stop-and-exit, plus liveness-based stale-socket
//! recovery at bind time.
//!
//! The accept loop generalizes `datadog-sidecar`'s `accept_socket_loop`
//! (`unix.rs`) from its single trampoline-spawned listener to an ordinary
//! in-process `tokio::select!` racing `accept()` against a shutdown signal;
//! each connection is served with `hyper::server::conn::http1` over
//! `hyper_util::rt::TokioIo`, the same pairing `datadog-remote-config`'s
//! `test_server.rs` uses for its own Unix/TCP listener loop.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::ring_buffer::RingBuffer;
use crate::supervisor::Supervisor;
use crate::types::{
    BufferStats, ErrorBody, LastExit, QueryOptions, ReadyType, RestartRequest, RestartResponse,
    RunnerStatus, StopRequest, StopResponse,
};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const STALE_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared state handed to every request handler. Cheap to clone (an `Arc`
/// wrapper around the pieces the server borrows from the runner).
#[derive(Clone)]
pub struct ServerState {
    pub name: String,
    pub ring: Arc<RingBuffer>,
    pub supervisor: Arc<Supervisor>,
    pub runner_pid: u32,
    pub started_at: u64,
    pub pty: bool,
    pub forward: bool,
    pub socket_path: PathBuf,
    shutdown_started: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerState {
    /// `shutdown_tx` is shared with the caller so `SIGINT`/`SIGTERM` handling
    /// can trigger the same shutdown path as a `POST /v1/stop` request.
    pub fn new(
        name: String,
        ring: Arc<RingBuffer>,
        supervisor: Arc<Supervisor>,
        socket_path: PathBuf,
        pty: bool,
        forward: bool,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        ServerState {
            name,
            ring,
            supervisor,
            runner_pid: std::process::id(),
            started_at: now_ms(),
            pty,
            forward,
            socket_path,
            shutdown_started: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Flips the shared shutdown watch exactly once; safe to call from a
    /// signal handler or from `POST /v1/stop`.
    pub fn begin_shutdown(&self) {
        if !self.shutdown_started.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
        }
    }

    fn status(&self) -> RunnerStatus {
        let child = self.supervisor.state();
        let buffer = self.ring.snapshot_stats();
        RunnerStatus {
            name: self.name.clone(),
            runner_pid: self.runner_pid,
            child_pid: child.pid,
            child_state: child.state,
            started_at: self.started_at,
            uptime_ms: now_ms().saturating_sub(self.started_at),
            pty: self.pty,
            forward: self.forward,
            buffer: BufferStats {
                max_lines: buffer.max_lines,
                max_bytes: buffer.max_bytes,
                current_lines: buffer.current_lines,
                current_bytes: buffer.current_bytes,
            },
            last_exit: LastExit {
                code: child.exit_code,
                signal: child.exit_signal,
            },
        }
    }
}

/// Binds the control socket, recovering from a stale (crashed-owner) socket
/// file: if a responsive runner already answers `GET /v1/status` there, bind
/// fails with `RunnerExists`; otherwise the stale path is unlinked first.
pub async fn bind_with_stale_recovery(socket_path: &Path) -> Result<UnixListener, ServerError> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    if socket_path.exists() {
        if crate::client::probe_status(socket_path, STALE_PROBE_TIMEOUT).await {
            return Err(ServerError::RunnerExists(socket_path.to_path_buf()));
        }
        info!(path = %socket_path.display(), "unlinking stale socket");
        let _ = std::fs::remove_file(socket_path);
    }

    UnixListener::bind(socket_path).map_err(ServerError::Io)
}

/// Runs the accept loop until the server's shutdown watch fires, serving
/// each connection with its own spawned task. Idempotent: a second shutdown
/// signal while already stopping is a no-op, and `begin_shutdown` guards
/// against redundant sends.
pub async fn serve(listener: UnixListener, state: ServerState) {
    let mut shutdown = state.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        tokio::spawn(serve_connection(stream, state));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
    }

    let _ = std::fs::remove_file(&state.socket_path);
}

/// `stop_requested` is set by `handle_stop` once the stop response has been
/// handed to hyper, and only consulted here after hyper's connection future
/// resolves — i.e. after the response (marked `Connection: close`) has
/// actually been written to the socket and the connection torn down. This is
/// what keeps `begin_shutdown` from racing ahead of the stop response: the
/// accept loop only ever observes the shutdown watch after this task signals
/// it, never from inside the handler itself.
async fn serve_connection(stream: UnixStream, state: ServerState) {
    let stop_requested = Arc::new(AtomicBool::new(false));
    let io = TokioIo::new(stream);
    let service = service_fn({
        let state = state.clone();
        let stop_requested = stop_requested.clone();
        move |req| dispatch(req, state.clone(), stop_requested.clone())
    });
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
    {
        debug!(error = %e, "connection closed with error");
    }

    if stop_requested.load(Ordering::SeqCst) {
        state.begin_shutdown();
    }
}

async fn dispatch(
    req: Request<Incoming>,
    state: ServerState,
    stop_requested: Arc<AtomicBool>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let result = match (&method, path.as_str()) {
        (&Method::GET, "/v1/status") => Ok(json_response(StatusCode::OK, &state.status())),
        (&Method::GET, "/v1/logs") => handle_logs(&state, &query),
        (&Method::POST, "/v1/restart") => handle_restart(req, &state).await,
        (&Method::POST, "/v1/stop") => handle_stop(req, &state, &stop_requested).await,
        _ => Err(ServerError::NotFound),
    };

    Ok(result.unwrap_or_else(|e| error_response(&e)))
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, ServerError> {
    let limited = Limited::new(req.into_body(), MAX_BODY_BYTES);
    let collected = limited
        .collect()
        .await
        .map_err(|_| ServerError::BodyTooLarge)?;
    Ok(collected.to_bytes())
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("response assembly cannot fail for a well-formed status/body")
}

fn error_response(err: &ServerError) -> Response<Full<Bytes>> {
    let body = ErrorBody {
        error: err.code(),
        message: err.to_string(),
    };
    json_response(err.status(), &body)
}

fn handle_logs(state: &ServerState, query: &str) -> Result<Response<Full<Bytes>>, ServerError> {
    let opts = parse_query_options(query)?;
    let mut response = state.ring.query(&opts)?;
    response.name = state.name.clone();
    Ok(json_response(StatusCode::OK, &response))
}

fn parse_query_options(query: &str) -> Result<QueryOptions, ServerError> {
    use crate::types::{GrepFilter, StreamFilter, WindowSelector};

    let mut opts = QueryOptions::default();
    let mut pattern: Option<String> = None;
    let mut regex = false;
    // Per the ring buffer's grep filter contract: insensitive by default,
    // unless the caller explicitly asks for `case_sensitive=1`.
    let mut case_sensitive = false;
    let mut invert = false;

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "since_cursor" => {
                let v: u64 = value
                    .parse()
                    .map_err(|_| ServerError::MalformedBody("since_cursor must be an integer".into()))?;
                opts.window = WindowSelector::SinceCursor(v);
            }
            "since_ms" => {
                let v: u64 = value
                    .parse()
                    .map_err(|_| ServerError::MalformedBody("since_ms must be an integer".into()))?;
                opts.window = WindowSelector::SinceMs(v);
            }
            "last" => {
                let v: usize = value
                    .parse()
                    .map_err(|_| ServerError::MalformedBody("last must be an integer".into()))?;
                opts.window = WindowSelector::Last(v);
            }
            "stream" => {
                opts.stream = match value.as_ref() {
                    "stdout" => StreamFilter::Stdout,
                    "stderr" => StreamFilter::Stderr,
                    _ => StreamFilter::Any,
                };
            }
            "grep" => pattern = Some(value.into_owned()),
            "regex" => regex = value.as_ref() == "1",
            "case_sensitive" => case_sensitive = value.as_ref() == "1",
            "invert" => invert = value.as_ref() == "1",
            "max_lines" => {
                opts.max_lines = Some(value.parse().map_err(|_| {
                    ServerError::MalformedBody("max_lines must be an integer".into())
                })?);
            }
            "max_bytes" => {
                opts.max_bytes = Some(value.parse().map_err(|_| {
                    ServerError::MalformedBody("max_bytes must be an integer".into())
                })?);
            }
            _ => {}
        }
    }

    if let Some(pattern) = pattern {
        opts.grep = Some(GrepFilter {
            pattern,
            regex,
            case_sensitive,
            invert,
        });
    }

    Ok(opts)
}

async fn handle_restart(
    req: Request<Incoming>,
    state: &ServerState,
) -> Result<Response<Full<Bytes>>, ServerError> {
    let body = read_body(req).await?;
    let restart_req: RestartRequest = if body.is_empty() {
        RestartRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ServerError::MalformedBody(e.to_string()))?
    };

    let grace_ms = restart_req
        .grace_ms
        .unwrap_or(crate::types::DEFAULT_GRACE_MS);
    let timeout_ms = restart_req
        .timeout_ms
        .unwrap_or(crate::types::DEFAULT_RESTART_TIMEOUT_MS);

    // Step 1: the floor for readiness scanning, captured before anything else
    // about this restart happens.
    let restart_cursor = state.ring.next_seq();

    // Step 2.
    state.ring.insert_marker("--- restart requested ---");

    // Step 3.
    state.supervisor.stop(Duration::from_millis(grace_ms)).await;

    // Step 4.
    if restart_req.clear_logs {
        state.ring.clear();
    }

    // Step 5 and step 6: `spawn(true)` inserts the `--- restarted (pid=…) ---`
    // marker itself, before handing output delivery to the new orchestrator
    // task, so the marker can never lose the race against the new child's
    // first line (see `Supervisor::spawn`'s doc comment).
    let pid = state.supervisor.spawn(true).await?;

    // `cursor_next` is deliberately read after the restart marker, matching
    // the documented intent that the immediate-return path reflects the
    // buffer state as of the new child's start, not the pre-restart one.
    let cursor_next = state.ring.next_seq();

    let Some(ready) = restart_req.ready else {
        return Ok(json_response(
            StatusCode::OK,
            &RestartResponse {
                restarted: true,
                ready: true,
                ready_match: None,
                reason: None,
                snippet: Vec::new(),
                pid: Some(pid),
                cursor_next,
            },
        ));
    };

    let shutdown_rx = state.shutdown_tx.subscribe();
    let outcome = state
        .ring
        .wait_for_match(
            &ready.pattern,
            matches!(ready.kind, ReadyType::Regex),
            ready.case_sensitive,
            restart_cursor,
            timeout_ms,
            shutdown_rx,
        )
        .await?;

    Ok(json_response(
        StatusCode::OK,
        &RestartResponse {
            restarted: true,
            ready: outcome.matched,
            ready_match: outcome.match_text,
            reason: if outcome.matched {
                None
            } else {
                Some("timeout".to_string())
            },
            snippet: outcome.snippet,
            pid: Some(pid),
            cursor_next,
        },
    ))
}

async fn handle_stop(
    req: Request<Incoming>,
    state: &ServerState,
    stop_requested: &AtomicBool,
) -> Result<Response<Full<Bytes>>, ServerError> {
    let body = read_body(req).await?;
    let stop_req: StopRequest = if body.is_empty() {
        StopRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ServerError::MalformedBody(e.to_string()))?
    };

    let grace_ms = stop_req
        .grace_ms
        .unwrap_or(crate::types::DEFAULT_GRACE_MS);
    state.supervisor.stop(Duration::from_millis(grace_ms)).await;

    // `Connection: close` tells hyper to close the socket once this response
    // is fully written rather than keeping it open for reuse, so
    // `serve_connection`'s future resolves promptly once the client has the
    // bytes. The shutdown watch itself isn't flipped here — `serve_connection`
    // does that after its `serve_connection(...).await` returns, so the
    // accept loop can never unlink the socket ahead of this response reaching
    // the client.
    stop_requested.store(true, Ordering::SeqCst);
    let mut response = json_response(StatusCode::OK, &StopResponse { stopped: true });
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));

    Ok(response)
}

