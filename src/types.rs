// SPDX-License-Identifier: Apache-2.0

//! Shared value types that cross the ring buffer / supervisor / server boundary.

use serde::{Deserialize, Serialize};

/// Which stream a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamLabel {
    Combined,
    Stdout,
    Stderr,
}

impl StreamLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamLabel::Combined => "combined",
            StreamLabel::Stdout => "stdout",
            StreamLabel::Stderr => "stderr",
        }
    }
}

impl std::str::FromStr for StreamLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "combined" => Ok(StreamLabel::Combined),
            "stdout" => Ok(StreamLabel::Stdout),
            "stderr" => Ok(StreamLabel::Stderr),
            other => Err(format!("unknown stream '{other}'")),
        }
    }
}

/// One captured line, appended to the ring buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub seq: u64,
    pub ts: u64,
    pub stream: StreamLabel,
    pub text: String,
}

/// The lifecycle phase of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildLifecycle {
    Starting,
    Running,
    Stopped,
    Exited,
    Unknown,
}

/// A value summary of the supervised process, read by the control server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildState {
    pub pid: Option<u32>,
    pub state: ChildLifecycle,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
}

impl Default for ChildState {
    fn default() -> Self {
        ChildState {
            pid: None,
            state: ChildLifecycle::Stopped,
            exit_code: None,
            exit_signal: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStats {
    pub max_lines: usize,
    pub max_bytes: usize,
    pub current_lines: usize,
    pub current_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// The composed view returned by `GET /v1/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub name: String,
    pub runner_pid: u32,
    pub child_pid: Option<u32>,
    pub child_state: ChildLifecycle,
    pub started_at: u64,
    pub uptime_ms: u64,
    pub pty: bool,
    pub forward: bool,
    pub buffer: BufferStats,
    pub last_exit: LastExit,
}

/// A service discovered by the filesystem walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub name: String,
    pub socket_path: std::path::PathBuf,
    pub tap_dir: std::path::PathBuf,
    pub prefix: String,
    pub base_name: String,
}

/// A window selector for `RingBuffer::query`. At most one of these is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WindowSelector {
    #[default]
    None,
    SinceCursor(u64),
    SinceMs(u64),
    Last(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFilter {
    Any,
    Stdout,
    Stderr,
}

impl Default for StreamFilter {
    fn default() -> Self {
        StreamFilter::Any
    }
}

#[derive(Debug, Clone)]
pub struct GrepFilter {
    pub pattern: String,
    pub regex: bool,
    pub case_sensitive: bool,
    pub invert: bool,
}

/// Input to `RingBuffer::query`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub window: WindowSelector,
    pub stream: StreamFilter,
    pub grep: Option<GrepFilter>,
    pub max_lines: Option<usize>,
    pub max_bytes: Option<usize>,
}

pub const DEFAULT_QUERY_MAX_LINES: usize = 80;
pub const DEFAULT_QUERY_MAX_BYTES: usize = 32_768;
pub const DEFAULT_QUERY_LAST: usize = 80;

/// Result of `RingBuffer::query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveResponse {
    pub name: String,
    pub cursor_next: u64,
    pub truncated: bool,
    pub dropped: bool,
    pub events: Vec<LogEvent>,
    pub match_count: usize,
}

/// Result of `RingBuffer::wait_for_match`.
#[derive(Debug, Clone)]
pub struct WaitOutcome {
    pub matched: bool,
    pub match_text: Option<String>,
    pub snippet: Vec<String>,
}

pub const DEFAULT_RING_MAX_LINES: usize = 5000;
pub const DEFAULT_RING_MAX_BYTES: usize = 10_000_000;

/// A readiness pattern supplied to `POST /v1/restart`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyType {
    Substring,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadySpec {
    #[serde(rename = "type")]
    pub kind: ReadyType,
    pub pattern: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

/// Shared default grace period for `restart` and `stop`.
pub const DEFAULT_GRACE_MS: u64 = 2000;
pub const DEFAULT_RESTART_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartRequest {
    pub grace_ms: Option<u64>,
    pub ready: Option<ReadySpec>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub clear_logs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartResponse {
    pub restarted: bool,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_match: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub snippet: Vec<String>,
    pub pid: Option<u32>,
    pub cursor_next: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    pub grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}
