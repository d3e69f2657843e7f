// SPDX-License-Identifier: Apache-2.0

//! Domain error types for each subsystem boundary.

use std::path::PathBuf;

/// Errors raised validating service names and grep patterns, before any
/// filesystem or regex work is attempted.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("name segment '{0}' is empty or longer than 64 characters")]
    SegmentLength(String),
    #[error("name segment '{0}' contains characters outside [A-Za-z0-9_-]")]
    SegmentCharset(String),
    #[error("name '{0}' is longer than 128 characters")]
    NameLength(String),
    #[error("pattern is longer than 200 characters")]
    PatternTooLong,
    #[error("pattern failed to compile: {0}")]
    PatternInvalid(String),
    #[error("pattern '{0}' matches a known catastrophic-backtracking shape")]
    PatternDangerous(String),
}

/// Errors from the child supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn child: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to allocate pty: {0}")]
    Pty(#[source] nix::Error),
    #[error("child has no pid")]
    NoPid,
    #[error("failed to signal child: {0}")]
    Signal(#[source] nix::Error),
}

/// Errors surfaced by the control server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("a responsive runner is already bound at {0}")]
    RunnerExists(PathBuf),
    #[error("request body exceeds the 1 MiB cap")]
    BodyTooLarge,
    #[error("malformed request body: {0}")]
    MalformedBody(String),
    #[error("route not found")]
    NotFound,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// The snake_case code used in `{"error": ..., "message": ...}` bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::RunnerExists(_) => "runner_exists",
            ServerError::BodyTooLarge => "body_too_large",
            ServerError::MalformedBody(_) => "bad_request",
            ServerError::NotFound => "not_found",
            ServerError::Validation(e) => match e {
                ValidationError::SegmentLength(_) | ValidationError::NameLength(_) => {
                    "invalid_name_length"
                }
                ValidationError::SegmentCharset(_) => "invalid_name_charset",
                ValidationError::PatternTooLong => "pattern_too_long",
                ValidationError::PatternInvalid(_) => "pattern_invalid",
                ValidationError::PatternDangerous(_) => "pattern_dangerous",
            },
            ServerError::Supervisor(_) => "internal_error",
            ServerError::Internal(_) => "internal_error",
            ServerError::Io(_) => "internal_error",
        }
    }

    /// The HTTP status code that corresponds to this error.
    pub fn status(&self) -> hyper::StatusCode {
        match self {
            ServerError::RunnerExists(_) => hyper::StatusCode::CONFLICT,
            ServerError::BodyTooLarge => hyper::StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::MalformedBody(_) => hyper::StatusCode::BAD_REQUEST,
            ServerError::NotFound => hyper::StatusCode::NOT_FOUND,
            ServerError::Validation(_) => hyper::StatusCode::BAD_REQUEST,
            ServerError::Supervisor(_) | ServerError::Internal(_) | ServerError::Io(_) => {
                hyper::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Errors from the service locator.
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no runner found for '{0}'")]
    NoRunner(String),
}

/// Errors from the client-side cursor cache.
#[derive(Debug, thiserror::Error)]
pub enum CursorCacheError {
    #[error("could not determine a cache directory for this platform")]
    NoCacheDir,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to a client speaking to a runner.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no runner is listening at {0}")]
    NoRunner(PathBuf),
    #[error("request timed out")]
    Timeout,
    #[error("runner returned {status}: {code} ({message})")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },
    #[error(transparent)]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error(transparent)]
    Http(#[from] hyper::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
