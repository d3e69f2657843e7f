// SPDX-License-Identifier: Apache-2.0

//! HTTP-over-Unix-domain-socket client used by the CLI (and, for the stale
//! socket probe, by the control server's own bind path). Requests are
//! addressed with `hyperlocal`'s hex-encoded `unix://` URIs, matching the
//! corpus's own socket-path-to-`Uri` encoding.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixConnector, Uri as UnixUri};

use crate::error::ClientError;
use crate::types::{
    ObserveResponse, RestartRequest, RestartResponse, RunnerStatus, StopRequest, StopResponse,
};

fn build_client() -> Client<UnixConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build(UnixConnector)
}

async fn request(
    socket_path: &Path,
    method: Method,
    path_and_query: &str,
    body: Bytes,
    timeout: Duration,
) -> Result<(StatusCode, Bytes), ClientError> {
    if !socket_path.exists() {
        return Err(ClientError::NoRunner(socket_path.to_path_buf()));
    }

    let uri: hyper::Uri = UnixUri::new(socket_path, path_and_query).into();
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Full::new(body))
        .map_err(hyper::Error::from)?;

    let client = build_client();
    let response = tokio::time::timeout(timeout, client.request(req))
        .await
        .map_err(|_| ClientError::Timeout)??;

    let status = response.status();
    let body = tokio::time::timeout(timeout, response.into_body().collect())
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(|e| ClientError::Http(hyper::Error::from(e)))?
        .to_bytes();

    Ok((status, body))
}

fn decode_error(status: StatusCode, body: &Bytes) -> ClientError {
    match serde_json::from_slice::<crate::types::ErrorBody>(body) {
        Ok(err) => ClientError::Remote {
            status: status.as_u16(),
            code: err.error.to_string(),
            message: err.message,
        },
        Err(_) => ClientError::Remote {
            status: status.as_u16(),
            code: "unknown".to_string(),
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

/// A short-timeout liveness probe used by the control server's stale-socket
/// recovery at bind. Returns `true` if a runner answered `GET /v1/status`.
pub async fn probe_status(socket_path: &Path, timeout: Duration) -> bool {
    matches!(
        request(socket_path, Method::GET, "/v1/status", Bytes::new(), timeout).await,
        Ok((status, _)) if status.is_success()
    )
}

pub async fn get_status(
    socket_path: &Path,
    timeout: Duration,
) -> Result<RunnerStatus, ClientError> {
    let (status, body) = request(socket_path, Method::GET, "/v1/status", Bytes::new(), timeout).await?;
    if !status.is_success() {
        return Err(decode_error(status, &body));
    }
    Ok(serde_json::from_slice(&body)?)
}

pub async fn get_logs(
    socket_path: &Path,
    query: &str,
    timeout: Duration,
) -> Result<ObserveResponse, ClientError> {
    let path_and_query = if query.is_empty() {
        "/v1/logs".to_string()
    } else {
        format!("/v1/logs?{query}")
    };
    let (status, body) = request(socket_path, Method::GET, &path_and_query, Bytes::new(), timeout).await?;
    if !status.is_success() {
        return Err(decode_error(status, &body));
    }
    Ok(serde_json::from_slice(&body)?)
}

pub async fn post_restart(
    socket_path: &Path,
    req: &RestartRequest,
    timeout: Duration,
) -> Result<RestartResponse, ClientError> {
    let body = Bytes::from(serde_json::to_vec(req)?);
    let (status, body) = request(socket_path, Method::POST, "/v1/restart", body, timeout).await?;
    if !status.is_success() {
        return Err(decode_error(status, &body));
    }
    Ok(serde_json::from_slice(&body)?)
}

/// Issues `POST /v1/stop`. A transport-level error following a successful
/// status is the documented benign reset after the runner closes its
/// listener and exits, so it is folded into a successful `StopResponse`.
pub async fn post_stop(
    socket_path: &Path,
    req: &StopRequest,
    timeout: Duration,
) -> Result<StopResponse, ClientError> {
    let body = Bytes::from(serde_json::to_vec(req)?);
    match request(socket_path, Method::POST, "/v1/stop", body, timeout).await {
        Ok((status, body)) if status.is_success() => Ok(serde_json::from_slice(&body)?),
        Ok((status, body)) => Err(decode_error(status, &body)),
        Err(_) => Ok(StopResponse { stopped: true }),
    }
}
