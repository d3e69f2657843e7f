// SPDX-License-Identifier: Apache-2.0

//! Turns a byte stream into `\n`-terminated lines, trimming a trailing `\r`.
//! One framer instance per stream accumulator (pipes keep two; pty keeps one).

#[derive(Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer { partial: Vec::new() }
    }

    /// Feeds a chunk of bytes, returning any complete lines it produced.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        self.partial.extend_from_slice(chunk);

        loop {
            let newline_pos = match self.partial.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => break,
            };
            let mut line: Vec<u8> = self.partial.drain(..=newline_pos).collect();
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        lines
    }

    /// Flushes any non-empty partial line at child exit.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.partial);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines() {
        let mut framer = LineFramer::new();
        let lines = framer.feed(b"line 1\nline 2\n");
        assert_eq!(lines, vec!["line 1".to_string(), "line 2".to_string()]);
    }

    #[test]
    fn trims_trailing_cr() {
        let mut framer = LineFramer::new();
        let lines = framer.feed(b"line 1\r\n");
        assert_eq!(lines, vec!["line 1".to_string()]);
    }

    #[test]
    fn accumulates_partial_across_feeds() {
        let mut framer = LineFramer::new();
        assert!(framer.feed(b"partial").is_empty());
        let lines = framer.feed(b" line\n");
        assert_eq!(lines, vec!["partial line".to_string()]);
    }

    #[test]
    fn flush_emits_trailing_partial() {
        let mut framer = LineFramer::new();
        framer.feed(b"no newline yet");
        assert_eq!(framer.flush().as_deref(), Some("no newline yet"));
        assert_eq!(framer.flush(), None);
    }
}
