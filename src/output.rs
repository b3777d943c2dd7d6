//! Output handling and buffering for process logs.
//!
//! This module provides the per-process ring buffer (`LogBuffer`), the group-wide
//! buffer that interleaves every member in arrival order (`TimelineBuffer`), text
//! sanitization, and detection of output that signals an unrecoverable failure.

use std::collections::VecDeque;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use strip_ansi_escapes::strip;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
    /// Lines written by devrack itself (spawn, exit notices).
    System,
}

/// A single captured line of output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub stream: StreamKind,
    /// ANSI-stripped text, prefixed with the process label when one is set.
    pub message: String,
    /// Text exactly as the process wrote it.
    pub raw: String,
}

impl OutputLine {
    pub fn new(stream: StreamKind, raw: String, label: Option<&str>) -> Self {
        let plain = sanitize_text(&raw, true);
        let message = match label {
            Some(label) => format!("[{}] {}", label, plain),
            None => plain,
        };
        Self {
            timestamp: Utc::now(),
            stream,
            message,
            raw,
        }
    }
}

/// An entry in the group-wide output buffer.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    /// Role of the process that produced the line.
    pub role: String,
    pub line: OutputLine,
}

/// A fixed-capacity ring buffer for a single process's output.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<OutputLine>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: OutputLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    /// Returns the most recent `limit` lines, oldest first; all lines if `limit` is `None`.
    pub fn tail(&self, limit: Option<usize>) -> Vec<OutputLine> {
        let skip = limit
            .map(|limit| self.lines.len().saturating_sub(limit))
            .unwrap_or(0);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// A fixed-capacity ring buffer for a whole group's output.
#[derive(Debug, Clone)]
pub struct TimelineBuffer {
    max_lines: usize,
    entries: VecDeque<TimelineEntry>,
}

impl TimelineBuffer {
    /// Creates a new `TimelineBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            entries: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds an entry to the buffer.
    ///
    /// Returns `true` if an old entry was dropped to make room.
    pub fn push(&mut self, entry: TimelineEntry) -> bool {
        let mut dropped = false;
        self.entries.push_back(entry);
        while self.entries.len() > self.max_lines {
            self.entries.pop_front();
            dropped = true;
        }
        dropped
    }

    /// Returns the most recent `limit` lines, oldest first; all lines if `limit` is `None`.
    pub fn tail(&self, limit: Option<usize>) -> Vec<OutputLine> {
        let skip = limit
            .map(|limit| self.entries.len().saturating_sub(limit))
            .unwrap_or(0);
        self.entries
            .iter()
            .skip(skip)
            .map(|entry| entry.line.clone())
            .collect()
    }
}

/// Sanitizes text for display, optionally stripping ANSI escape codes.
///
/// If `strip_ansi` is true, ANSI codes are removed. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Output patterns that mean the process is unlikely to recover on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalPattern {
    AddressInUse,
    ConnectionRefused,
    PermissionDenied,
    CommandFailed,
}

impl CriticalPattern {
    pub fn description(&self) -> &'static str {
        match self {
            CriticalPattern::AddressInUse => "port already in use",
            CriticalPattern::ConnectionRefused => "connection refused",
            CriticalPattern::PermissionDenied => "permission denied",
            CriticalPattern::CommandFailed => "command failed",
        }
    }
}

fn critical_patterns() -> &'static [(Regex, CriticalPattern)] {
    static PATTERNS: OnceLock<Vec<(Regex, CriticalPattern)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                r"(?i)EADDRINUSE|address already in use",
                CriticalPattern::AddressInUse,
            ),
            (
                r"(?i)ECONNREFUSED|connection refused",
                CriticalPattern::ConnectionRefused,
            ),
            (
                r"(?i)EACCES|permission denied",
                CriticalPattern::PermissionDenied,
            ),
            (
                r"(?i)command failed|command not found",
                CriticalPattern::CommandFailed,
            ),
        ]
        .into_iter()
        .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
        .collect()
    })
}

/// Matches plain (ANSI-stripped) text against the critical output patterns.
///
/// Ordinary compiler or runtime errors return `None`; they stay in the output stream only.
pub fn classify_critical(plain: &str) -> Option<CriticalPattern> {
    critical_patterns()
        .iter()
        .find(|(re, _)| re.is_match(plain))
        .map(|(_, kind)| *kind)
}
