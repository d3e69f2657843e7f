// SPDX-License-Identifier: Apache-2.0

//! An in-memory, sequence-numbered log store with dual (line + byte)
//! eviction, an incremental cursor protocol, filtered queries, and a
//! readiness-wait primitive.
//!
//! The buffer is the only piece of shared mutable state in a runner; it is
//! guarded by a plain `Mutex` since query handling is synchronous and never
//! suspends while holding the lock.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::time::Instant;

use crate::types::{
    GrepFilter, LogEvent, QueryOptions, StreamFilter, StreamLabel, WaitOutcome, WindowSelector,
    DEFAULT_QUERY_LAST, DEFAULT_QUERY_MAX_BYTES, DEFAULT_QUERY_MAX_LINES, DEFAULT_RING_MAX_BYTES,
    DEFAULT_RING_MAX_LINES,
};
use crate::validate::compile_safe_regex;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SNIPPET_LEN: usize = 10;

struct Inner {
    events: VecDeque<LogEvent>,
    next_seq: u64,
    lowest_seq: u64,
    total_bytes: usize,
    max_lines: usize,
    max_bytes: usize,
}

impl Inner {
    fn evict(&mut self) {
        while self.events.len() > self.max_lines || self.total_bytes > self.max_bytes {
            match self.events.pop_front() {
                Some(evicted) => self.total_bytes -= evicted.text.len(),
                None => break,
            }
        }
        self.lowest_seq = self
            .events
            .front()
            .map(|e| e.seq)
            .unwrap_or(self.next_seq);
    }
}

/// Current line/byte counts and configured caps, for `RunnerStatus`.
pub struct BufferSnapshot {
    pub max_lines: usize,
    pub max_bytes: usize,
    pub current_lines: usize,
    pub current_bytes: usize,
}

pub struct RingBuffer {
    inner: Mutex<Inner>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RingBuffer {
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        RingBuffer {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                next_seq: 1,
                lowest_seq: 1,
                total_bytes: 0,
                max_lines,
                max_bytes,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_RING_MAX_LINES, DEFAULT_RING_MAX_BYTES)
    }

    /// Assigns the next sequence number, stores the event, runs eviction, and
    /// returns the stored event. Never fails.
    pub fn append(&self, text: impl Into<String>, stream: StreamLabel) -> LogEvent {
        let text = text.into();
        let mut inner = self.inner.lock().expect("ring buffer mutex poisoned");

        let event = LogEvent {
            seq: inner.next_seq,
            ts: now_ms(),
            stream,
            text,
        };
        inner.next_seq += 1;
        inner.total_bytes += event.text.len();
        inner.events.push_back(event.clone());
        inner.evict();
        event
    }

    /// Appends a `combined`-stream marker event, e.g. `--- restart requested ---`.
    pub fn insert_marker(&self, text: impl Into<String>) -> LogEvent {
        self.append(text, StreamLabel::Combined)
    }

    /// Drops all events. `total_bytes` resets to zero and `lowest_seq` resets
    /// to the current `next_seq`; `next_seq` itself is never reset.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("ring buffer mutex poisoned");
        inner.events.clear();
        inner.total_bytes = 0;
        inner.lowest_seq = inner.next_seq;
    }

    /// The value that will be assigned to the next appended event.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().expect("ring buffer mutex poisoned").next_seq
    }

    pub fn snapshot_stats(&self) -> BufferSnapshot {
        let inner = self.inner.lock().expect("ring buffer mutex poisoned");
        BufferSnapshot {
            max_lines: inner.max_lines,
            max_bytes: inner.max_bytes,
            current_lines: inner.events.len(),
            current_bytes: inner.total_bytes,
        }
    }

    fn stream_matches(filter: &StreamFilter, stream: StreamLabel) -> bool {
        match filter {
            StreamFilter::Any => true,
            // `combined` is kept distinct from stdout/stderr: resolving the
            // spec's documented open question in favor of the stricter rule.
            StreamFilter::Stdout => stream == StreamLabel::Stdout,
            StreamFilter::Stderr => stream == StreamLabel::Stderr,
        }
    }

    /// `compiled` is `Some` iff `grep.regex`; compiled once by the caller
    /// before the filter loop rather than per event.
    fn grep_matches(grep: &GrepFilter, compiled: Option<&regex::Regex>, text: &str) -> bool {
        let matched = if let Some(re) = compiled {
            re.is_match(text)
        } else if grep.case_sensitive {
            text.contains(&grep.pattern)
        } else {
            text.to_lowercase().contains(&grep.pattern.to_lowercase())
        };
        matched ^ grep.invert
    }

    /// Runs a query against the currently retained events. Synchronous and
    /// must not suspend.
    pub fn query(
        &self,
        opts: &QueryOptions,
    ) -> Result<crate::types::ObserveResponse, crate::error::ValidationError> {
        let inner = self.inner.lock().expect("ring buffer mutex poisoned");

        let mut dropped = false;
        let windowed: Vec<&LogEvent> = match &opts.window {
            WindowSelector::SinceCursor(cursor) => {
                if *cursor < inner.lowest_seq {
                    dropped = true;
                }
                inner.events.iter().filter(|e| e.seq >= *cursor).collect()
            }
            WindowSelector::SinceMs(d) => {
                let floor = now_ms().saturating_sub(*d);
                inner.events.iter().filter(|e| e.ts >= floor).collect()
            }
            WindowSelector::Last(n) => {
                let len = inner.events.len();
                let skip = len.saturating_sub(*n);
                inner.events.iter().skip(skip).collect()
            }
            WindowSelector::None => inner.events.iter().collect(),
        };

        // Compiled once up front (§4.1: "compile ... via the shared safe-regex
        // validator", not once per candidate event).
        let compiled_grep = match &opts.grep {
            Some(grep) if grep.regex => {
                Some(compile_safe_regex(&grep.pattern, grep.case_sensitive)?)
            }
            _ => None,
        };

        let mut filtered: Vec<&LogEvent> = Vec::with_capacity(windowed.len());
        for event in windowed {
            if !Self::stream_matches(&opts.stream, event.stream) {
                continue;
            }
            if let Some(grep) = &opts.grep {
                if !Self::grep_matches(grep, compiled_grep.as_ref(), &event.text) {
                    continue;
                }
            }
            filtered.push(event);
        }

        let max_lines = opts.max_lines.unwrap_or(DEFAULT_QUERY_MAX_LINES);
        let max_bytes = opts.max_bytes.unwrap_or(DEFAULT_QUERY_MAX_BYTES);
        // `last` with no other window selector additionally trims from the
        // tail before limiting, per the default query window.
        if matches!(opts.window, WindowSelector::None) {
            let skip = filtered.len().saturating_sub(DEFAULT_QUERY_LAST);
            filtered = filtered.split_off(skip);
        }

        let mut events = Vec::new();
        let mut bytes_used = 0usize;
        let mut truncated = false;
        for event in filtered.iter() {
            let next_bytes = bytes_used + event.text.len();
            if !events.is_empty() && (events.len() >= max_lines || next_bytes > max_bytes) {
                truncated = true;
                break;
            }
            bytes_used = next_bytes;
            events.push((*event).clone());
            if events.len() >= max_lines && bytes_used <= max_bytes {
                if events.len() < filtered.len() {
                    truncated = true;
                }
                break;
            }
        }

        let cursor_next = events
            .last()
            .map(|e| e.seq + 1)
            .unwrap_or(inner.next_seq);

        Ok(crate::types::ObserveResponse {
            name: String::new(),
            cursor_next,
            truncated,
            dropped,
            match_count: events.len(),
            events,
        })
    }

    /// Polls for the first event with `seq >= after_cursor` whose text
    /// matches `pattern`. Cancellable via `shutdown`; resolves as a timeout
    /// if `shutdown` fires before the deadline.
    pub async fn wait_for_match(
        &self,
        pattern: &str,
        regex: bool,
        case_sensitive: bool,
        after_cursor: u64,
        timeout_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WaitOutcome, crate::error::ValidationError> {
        let compiled = if regex {
            Some(compile_safe_regex(pattern, case_sensitive)?)
        } else {
            None
        };

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            let (matched_text, snippet) = {
                let inner = self.inner.lock().expect("ring buffer mutex poisoned");
                let mut snippet: VecDeque<String> = VecDeque::with_capacity(SNIPPET_LEN);
                let mut matched_text = None;
                for event in inner.events.iter().filter(|e| e.seq >= after_cursor) {
                    if snippet.len() == SNIPPET_LEN {
                        snippet.pop_front();
                    }
                    snippet.push_back(event.text.clone());

                    if matched_text.is_none() {
                        let is_match = match &compiled {
                            Some(re) => re.is_match(&event.text),
                            None if case_sensitive => event.text.contains(pattern),
                            None => event
                                .text
                                .to_lowercase()
                                .contains(&pattern.to_lowercase()),
                        };
                        if is_match {
                            matched_text = Some(event.text.clone());
                        }
                    }
                }
                (matched_text, snippet.into_iter().collect::<Vec<_>>())
            };

            if let Some(text) = matched_text {
                return Ok(WaitOutcome {
                    matched: true,
                    match_text: Some(text),
                    snippet,
                });
            }

            if Instant::now() >= deadline {
                return Ok(WaitOutcome {
                    matched: false,
                    match_text: None,
                    snippet,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline.min(Instant::now() + WAIT_POLL_INTERVAL)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(WaitOutcome {
                            matched: false,
                            match_text: None,
                            snippet,
                        });
                    }
                }
            }
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::types::QueryOptions;
    use proptest::prelude::*;

    fn lines_strategy() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec("[a-zA-Z0-9 ]{0,40}", 0..60)
    }

    proptest! {
        /// Appended events always get strictly increasing sequence numbers,
        /// regardless of line lengths or how small the caps are.
        #[test]
        fn next_seq_strictly_increases(lines in lines_strategy(), max_lines in 1usize..20, max_bytes in 1usize..200) {
            let buf = RingBuffer::new(max_lines, max_bytes);
            let mut last_seq = 0u64;
            for line in &lines {
                let event = buf.append(line.clone(), StreamLabel::Stdout);
                prop_assert!(event.seq > last_seq);
                last_seq = event.seq;
            }
        }

        /// After every append, both caps hold: the retained line count never
        /// exceeds `max_lines` and retained bytes never exceed `max_bytes`,
        /// unless a single oversize event forces the buffer to keep it alone.
        #[test]
        fn eviction_restores_both_caps(lines in lines_strategy(), max_lines in 1usize..20, max_bytes in 1usize..200) {
            let buf = RingBuffer::new(max_lines, max_bytes);
            for line in &lines {
                buf.append(line.clone(), StreamLabel::Stdout);
            }
            let snapshot = buf.snapshot_stats();
            prop_assert!(snapshot.current_lines <= max_lines);
            if snapshot.current_lines > 1 {
                prop_assert!(snapshot.current_bytes <= max_bytes);
            }
        }

        /// `since_cursor(c)` only ever returns events whose seq is `>= c`.
        #[test]
        fn since_cursor_only_returns_seq_at_or_above_cursor(
            lines in lines_strategy(),
            max_lines in 1usize..20,
            cursor in 0u64..80,
        ) {
            let buf = RingBuffer::new(max_lines, 1_000_000);
            for line in &lines {
                buf.append(line.clone(), StreamLabel::Stdout);
            }
            let resp = buf
                .query(&QueryOptions {
                    window: WindowSelector::SinceCursor(cursor),
                    ..Default::default()
                })
                .unwrap();
            prop_assert!(resp.events.iter().all(|e| e.seq >= cursor));
        }

        /// Querying again with `since_cursor` set to the previous response's
        /// `cursor_next` never re-returns an event already seen.
        #[test]
        fn successive_queries_share_no_events(lines in lines_strategy(), max_lines in 1usize..20) {
            let buf = RingBuffer::new(max_lines, 1_000_000);
            for line in &lines {
                buf.append(line.clone(), StreamLabel::Stdout);
            }
            let first = buf
                .query(&QueryOptions { window: WindowSelector::Last(3), ..Default::default() })
                .unwrap();
            let second = buf
                .query(&QueryOptions {
                    window: WindowSelector::SinceCursor(first.cursor_next),
                    ..Default::default()
                })
                .unwrap();
            let first_seqs: Vec<u64> = first.events.iter().map(|e| e.seq).collect();
            prop_assert!(second.events.iter().all(|e| !first_seqs.contains(&e.seq)));
        }

        /// Requesting a cursor older than the lowest retained seq always
        /// reports `dropped`, once enough events have been evicted past it.
        #[test]
        fn dropped_flag_set_once_cursor_evicted(extra in 0usize..30) {
            let buf = RingBuffer::new(2, 1_000_000);
            for i in 0..(3 + extra) {
                buf.append(format!("line {i}"), StreamLabel::Stdout);
            }
            let resp = buf
                .query(&QueryOptions { window: WindowSelector::SinceCursor(1), ..Default::default() })
                .unwrap();
            prop_assert!(resp.dropped);
        }

        /// `clear` never moves `next_seq` backwards; the next appended event
        /// still gets a seq strictly greater than anything appended before.
        #[test]
        fn clear_preserves_next_seq_monotonicity(before in lines_strategy(), after in lines_strategy()) {
            let buf = RingBuffer::with_defaults();
            let mut max_before = 0u64;
            for line in &before {
                max_before = buf.append(line.clone(), StreamLabel::Stdout).seq;
            }
            buf.clear();
            for line in &after {
                let event = buf.append(line.clone(), StreamLabel::Stdout);
                prop_assert!(event.seq > max_before);
            }
        }
    }
}
