// SPDX-License-Identifier: Apache-2.0

//! `clap`-derive command tree. Parses user input into the structured types
//! the core consumes (`SpawnConfig`, `QueryOptions`, `RestartRequest`);
//! duration strings and env-file lines are parsed here, at the boundary.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::parse_duration_ms;
use crate::types::{GrepFilter, QueryOptions, ReadySpec, ReadyType, RestartRequest, WindowSelector};

#[derive(Parser, Debug)]
#[command(name = "tap", about = "Supervise a child process and tail its output over a local socket")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the runner in the foreground, supervising `command`.
    Run {
        name: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long)]
        env_file: Option<PathBuf>,
        #[arg(long)]
        pty: bool,
        #[arg(long)]
        max_lines: Option<usize>,
        #[arg(long)]
        max_bytes: Option<usize>,
        #[arg(long)]
        forward: bool,
        #[arg(long)]
        base_dir: Option<PathBuf>,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Print a runner's current status.
    Status {
        name: String,
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
    /// Query a runner's captured log events.
    Logs {
        name: String,
        #[arg(long)]
        base_dir: Option<PathBuf>,
        #[arg(long)]
        follow: bool,
        #[arg(long)]
        since_cursor: Option<u64>,
        #[arg(long)]
        since_ms: Option<u64>,
        #[arg(long)]
        last: Option<usize>,
        #[arg(long)]
        stream: Option<String>,
        #[arg(long)]
        grep: Option<String>,
        #[arg(long)]
        regex: bool,
        #[arg(long)]
        case_sensitive: bool,
        #[arg(long)]
        invert: bool,
        #[arg(long)]
        max_lines: Option<usize>,
        #[arg(long)]
        max_bytes: Option<usize>,
    },
    /// Restart a runner's child, optionally waiting for a readiness pattern.
    Restart {
        name: String,
        #[arg(long)]
        base_dir: Option<PathBuf>,
        #[arg(long)]
        grace: Option<String>,
        #[arg(long)]
        ready_substring: Option<String>,
        #[arg(long)]
        ready_regex: Option<String>,
        #[arg(long)]
        ready_case_sensitive: bool,
        #[arg(long)]
        timeout: Option<String>,
        #[arg(long)]
        clear_logs: bool,
    },
    /// Stop a runner's child and the runner itself.
    Stop {
        name: String,
        #[arg(long)]
        base_dir: Option<PathBuf>,
        #[arg(long)]
        grace: Option<String>,
    },
    /// List every service discoverable from a workspace.
    Ps {
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
}

/// Builds a `QueryOptions` from the `logs` subcommand's flags. At most one
/// window selector may be set; later flags win if more than one is given,
/// matching the precedence `since_cursor > since_ms > last`.
#[allow(clippy::too_many_arguments)]
pub fn logs_query_options(
    since_cursor: Option<u64>,
    since_ms: Option<u64>,
    last: Option<usize>,
    stream: Option<&str>,
    grep: Option<String>,
    regex: bool,
    case_sensitive: bool,
    invert: bool,
    max_lines: Option<usize>,
    max_bytes: Option<usize>,
) -> QueryOptions {
    let window = if let Some(c) = since_cursor {
        WindowSelector::SinceCursor(c)
    } else if let Some(ms) = since_ms {
        WindowSelector::SinceMs(ms)
    } else if let Some(n) = last {
        WindowSelector::Last(n)
    } else {
        WindowSelector::None
    };

    let stream = match stream {
        Some("stdout") => crate::types::StreamFilter::Stdout,
        Some("stderr") => crate::types::StreamFilter::Stderr,
        _ => crate::types::StreamFilter::Any,
    };

    let grep = grep.map(|pattern| GrepFilter {
        pattern,
        regex,
        case_sensitive,
        invert,
    });

    QueryOptions {
        window,
        stream,
        grep,
        max_lines,
        max_bytes,
    }
}

/// Builds a `RestartRequest` from the `restart` subcommand's flags.
/// `--ready-substring` and `--ready-regex` are mutually exclusive; the
/// caller is expected to have validated that upstream.
pub fn restart_request(
    grace: Option<&str>,
    ready_substring: Option<String>,
    ready_regex: Option<String>,
    ready_case_sensitive: bool,
    timeout: Option<&str>,
    clear_logs: bool,
) -> Result<RestartRequest, String> {
    let grace_ms = grace.map(parse_duration_ms).transpose()?;
    let timeout_ms = timeout.map(parse_duration_ms).transpose()?;

    let ready = match (ready_substring, ready_regex) {
        (Some(pattern), None) => Some(ReadySpec {
            kind: ReadyType::Substring,
            pattern,
            case_sensitive: ready_case_sensitive,
        }),
        (None, Some(pattern)) => Some(ReadySpec {
            kind: ReadyType::Regex,
            pattern,
            case_sensitive: ready_case_sensitive,
        }),
        (None, None) => None,
        (Some(_), Some(_)) => {
            return Err("--ready-substring and --ready-regex are mutually exclusive".to_string())
        }
    };

    Ok(RestartRequest {
        grace_ms,
        ready,
        timeout_ms,
        clear_logs,
    })
}

/// Serializes a `QueryOptions` back into a query string for the client's
/// `GET /v1/logs` request.
pub fn query_options_to_query_string(opts: &QueryOptions) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();
    match &opts.window {
        WindowSelector::SinceCursor(c) => pairs.push(("since_cursor".into(), c.to_string())),
        WindowSelector::SinceMs(ms) => pairs.push(("since_ms".into(), ms.to_string())),
        WindowSelector::Last(n) => pairs.push(("last".into(), n.to_string())),
        WindowSelector::None => {}
    }
    match opts.stream {
        crate::types::StreamFilter::Stdout => pairs.push(("stream".into(), "stdout".into())),
        crate::types::StreamFilter::Stderr => pairs.push(("stream".into(), "stderr".into())),
        crate::types::StreamFilter::Any => {}
    }
    if let Some(grep) = &opts.grep {
        pairs.push(("grep".into(), grep.pattern.clone()));
        if grep.regex {
            pairs.push(("regex".into(), "1".into()));
        }
        if grep.case_sensitive {
            pairs.push(("case_sensitive".into(), "1".into()));
        }
        if grep.invert {
            pairs.push(("invert".into(), "1".into()));
        }
    }
    if let Some(max_lines) = opts.max_lines {
        pairs.push(("max_lines".into(), max_lines.to_string()));
    }
    if let Some(max_bytes) = opts.max_bytes {
        pairs.push(("max_bytes".into(), max_bytes.to_string()));
    }

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Loads and parses an `--env-file`, if given; otherwise an empty map.
pub fn load_env_file(path: Option<&PathBuf>) -> std::io::Result<HashMap<String, String>> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            Ok(crate::config::parse_env_file(&contents))
        }
        None => Ok(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_request_rejects_both_ready_kinds() {
        let result = restart_request(None, Some("a".into()), Some("b".into()), false, None, false);
        assert!(result.is_err());
    }

    #[test]
    fn restart_request_parses_durations() {
        let req = restart_request(Some("2s"), None, None, false, Some("500ms"), false).unwrap();
        assert_eq!(req.grace_ms, Some(2000));
        assert_eq!(req.timeout_ms, Some(500));
    }

    #[test]
    fn query_string_round_trips_window_and_grep() {
        let opts = logs_query_options(
            Some(5),
            None,
            None,
            Some("stderr"),
            Some("ERROR".to_string()),
            true,
            true,
            false,
            Some(10),
            None,
        );
        let qs = query_options_to_query_string(&opts);
        assert!(qs.contains("since_cursor=5"));
        assert!(qs.contains("stream=stderr"));
        assert!(qs.contains("grep=ERROR"));
        assert!(qs.contains("regex=1"));
    }
}
