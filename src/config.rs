// SPDX-License-Identifier: Apache-2.0

//! Runner startup configuration: CLI flags overlaid on `TAP_*` environment
//! variables, in the same "env sets defaults, flags override" relationship
//! as the sidecar's own `Config`/`FromEnv` split.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::supervisor::SpawnConfig;
use crate::types::{DEFAULT_RING_MAX_BYTES, DEFAULT_RING_MAX_LINES};

const ENV_MAX_LINES: &str = "TAP_MAX_LINES";
const ENV_MAX_BYTES: &str = "TAP_MAX_BYTES";
const ENV_BASE_DIR: &str = "TAP_BASE_DIR";
const ENV_LOG: &str = "TAP_LOG";

/// The runner's own configuration for one `tap run` invocation.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub name: String,
    pub base_dir: PathBuf,
    pub spawn: SpawnConfig,
    pub max_lines: usize,
    pub max_bytes: usize,
    pub forward: bool,
}

impl RunnerConfig {
    /// `base_dir` falls back to `TAP_BASE_DIR`, then the current directory.
    /// `max_lines`/`max_bytes` fall back to `TAP_MAX_LINES`/`TAP_MAX_BYTES`,
    /// then the ring buffer's own defaults. CLI-supplied values always win.
    pub fn resolve(
        name: String,
        base_dir_flag: Option<PathBuf>,
        max_lines_flag: Option<usize>,
        max_bytes_flag: Option<usize>,
        forward: bool,
        spawn: SpawnConfig,
    ) -> std::io::Result<Self> {
        let base_dir = base_dir_flag
            .or_else(|| std::env::var_os(ENV_BASE_DIR).map(PathBuf::from))
            .map(Ok)
            .unwrap_or_else(std::env::current_dir)?;

        let max_lines = max_lines_flag
            .or_else(|| env_usize(ENV_MAX_LINES))
            .unwrap_or(DEFAULT_RING_MAX_LINES);
        let max_bytes = max_bytes_flag
            .or_else(|| env_usize(ENV_MAX_BYTES))
            .unwrap_or(DEFAULT_RING_MAX_BYTES);

        Ok(RunnerConfig {
            name,
            base_dir,
            spawn,
            max_lines,
            max_bytes,
            forward,
        })
    }

    /// The `tracing_subscriber::EnvFilter` directive: `TAP_LOG`, default `info`.
    pub fn log_directive() -> String {
        std::env::var(ENV_LOG).unwrap_or_else(|_| "info".to_string())
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

/// Parses `KEY=VALUE` lines into an environment override map for the
/// supervised child. `#`-prefixed lines and blank lines are skipped; a
/// repeated key keeps the last occurrence.
pub fn parse_env_file(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = unquote(value.trim());
        map.insert(key.to_string(), value);
    }
    map
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

/// Parses a duration string at the CLI boundary: `"2s"`, `"500ms"`, or a bare
/// integer taken as milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<u64, String> {
    let input = input.trim();
    if let Some(ms) = input.strip_suffix("ms") {
        return ms
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration '{input}'"));
    }
    if let Some(secs) = input.strip_suffix('s') {
        let secs: u64 = secs
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration '{input}'"))?;
        return Ok(secs * 1000);
    }
    input
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_and_milliseconds_and_bare_integer() {
        assert_eq!(parse_duration_ms("2s").unwrap(), 2000);
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("1500").unwrap(), 1500);
    }

    #[test]
    fn rejects_garbage_duration() {
        assert!(parse_duration_ms("two seconds").is_err());
    }

    #[test]
    fn env_file_skips_comments_and_blanks() {
        let parsed = parse_env_file("# comment\n\nFOO=bar\n  \nBAZ=qux\n");
        assert_eq!(parsed.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(parsed.get("BAZ").map(String::as_str), Some("qux"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn env_file_strips_quotes_and_trims() {
        let parsed = parse_env_file("FOO=\"bar baz\"\nQUUX='single'\n  SPACED = value  \n");
        assert_eq!(parsed.get("FOO").map(String::as_str), Some("bar baz"));
        assert_eq!(parsed.get("QUUX").map(String::as_str), Some("single"));
        assert_eq!(parsed.get("SPACED").map(String::as_str), Some("value"));
    }

    #[test]
    fn env_file_duplicate_key_last_wins() {
        let parsed = parse_env_file("FOO=one\nFOO=two\n");
        assert_eq!(parsed.get("FOO").map(String::as_str), Some("two"));
    }
}
