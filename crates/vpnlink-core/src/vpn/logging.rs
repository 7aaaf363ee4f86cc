//! Structured log capture for the core, the engine console and the
//! management channel, plus helpers for command redaction and mapping
//! known engine failures onto user-facing messages.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Per-source ring buffer capacity.
pub const MAX_LOG_ENTRIES: usize = 1024;

// Engine `machine-readable-output` flag bits.
const M_FATAL: u32 = 1 << 4;
const M_NONFATAL: u32 = 1 << 5;
const M_WARN: u32 = 1 << 6;
const M_DEBUG: u32 = 1 << 7;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Log entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Verbose,
}

impl LogLevel {
    /// Map a management `>LOG:` level code.
    pub fn from_mgmt_code(code: &str) -> Self {
        match code {
            "I" => Self::Info,
            "W" => Self::Warning,
            "D" => Self::Debug,
            "F" => Self::Error,
            _ => Self::Debug,
        }
    }

    /// Map engine machine-readable flag bits.
    pub fn from_engine_flags(flags: u32) -> Self {
        if flags & M_FATAL != 0 {
            Self::Error
        } else if flags & (M_NONFATAL | M_WARN) != 0 {
            Self::Warning
        } else if flags & M_DEBUG != 0 {
            Self::Debug
        } else {
            Self::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warning => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
        }
    }

    /// Forward to the `log` facade at the closest level.
    pub fn emit(&self, source: LogSource, message: &str) {
        match self {
            Self::Error => log::error!("[{:?}] {}", source, message),
            Self::Warning => log::warn!("[{:?}] {}", source, message),
            Self::Info => log::info!("[{:?}] {}", source, message),
            Self::Debug => log::debug!("[{:?}] {}", source, message),
            Self::Verbose => log::trace!("[{:?}] {}", source, message),
        }
    }
}

/// Where the log line originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// This core.
    Front,
    /// Engine stdout.
    Console,
    /// Engine `>LOG:` notifications.
    Management,
}

impl LogSource {
    pub const ALL: [LogSource; 3] = [Self::Front, Self::Console, Self::Management];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
}

impl LogEntry {
    pub fn new(source: LogSource, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source,
            message: message.into(),
        }
    }

    pub fn front(level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(LogSource::Front, level, message)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Log buffer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounded buffer; the oldest entry is dropped once full.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(MAX_LOG_ENTRIES)
    }
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_entries.min(MAX_LOG_ENTRIES)),
            max_entries,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> &VecDeque<LogEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Get the last N entries.
    pub fn tail(&self, n: usize) -> Vec<&LogEntry> {
        let start = self.entries.len().saturating_sub(n);
        self.entries.range(start..).collect()
    }

    /// Entries at `level` or more severe.
    pub fn filter_level(&self, level: LogLevel) -> Vec<&LogEntry> {
        self.entries.iter().filter(|e| e.level <= level).collect()
    }

    /// Case-insensitive substring search.
    pub fn search(&self, query: &str) -> Vec<&LogEntry> {
        let lower = query.to_lowercase();
        self.entries
            .iter()
            .filter(|e| e.message.to_lowercase().contains(&lower))
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Engine line parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse the argument of a `>LOG:` notification: `unixTime,code,message`.
///
/// The message itself may contain commas.
pub fn parse_mgmt_log(arg: &str) -> Option<LogEntry> {
    let mut parts = arg.splitn(3, ',');
    let time = parts.next()?;
    let code = parts.next()?;
    let message = parts.next()?;

    let timestamp = time
        .parse::<i64>()
        .ok()
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    Some(
        LogEntry::new(LogSource::Management, LogLevel::from_mgmt_code(code), message)
            .with_timestamp(timestamp),
    )
}

lazy_static! {
    static ref MACHINE_READABLE: Option<Regex> =
        Regex::new(r"^(\d+)\.(\d+) ([0-9a-f]+) (.*)$").ok();
}

/// Parse an engine stdout line. Machine-readable lines carry hex flags
/// that decide the level; anything else is logged at info.
pub fn parse_console_line(line: &str) -> LogEntry {
    let caps = MACHINE_READABLE.as_ref().and_then(|re| re.captures(line));
    match caps {
        Some(caps) => {
            let flags = u32::from_str_radix(&caps[3], 16).unwrap_or(0);
            LogEntry::new(LogSource::Console, LogLevel::from_engine_flags(flags), &caps[4])
        }
        None => LogEntry::new(LogSource::Console, LogLevel::Info, line),
    }
}

lazy_static! {
    static ref ERROR_HINTS: Vec<(Regex, &'static str)> = [
        (
            r"TLS\s+Error:\s+TLS\s+start\s+hello\s+failed",
            "TLS handshake with the server did not start",
        ),
        (
            r"can't\s+ask\s+for\s+'?Enter\s+Client\s+certificate",
            "The server asked for a client certificate that is not configured",
        ),
        (
            r"TLS\s+Error:\s+TLS\s+key\s+negotiation\s+failed",
            "TLS key negotiation with the server failed",
        ),
        (
            r"Failed\s+to\s+negotiat\w*\s+tunnel",
            "Could not negotiate tunnel options with the server",
        ),
        (
            r"certificate\s+is\s+not\s+yet\s+valid",
            "A certificate is not yet valid",
        ),
        (
            r"certificate\s+has\s+expired:",
            "The server certificate has expired",
        ),
        (
            r"self\s+signed\s+certificate\s+in\s+certificate\s+chain",
            "The server certificate could not be verified",
        ),
        (
            r"alert\s+certificate\s+revoked",
            "The client certificate has been revoked",
        ),
        (
            r"alert\s+certificate\s+expired",
            "The client certificate has expired",
        ),
        (
            r"alert\s+unknown\s+ca",
            "The server does not trust the client certificate",
        ),
        (
            r"(Unsupported|unknown)\s+cipher",
            "The configured cipher is not supported",
        ),
        (
            r"RESOLVE:\s+Cannot\s+resolve\s+host",
            "The server host name could not be resolved",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, hint)| Regex::new(pattern).ok().map(|re| (re, hint)))
    .collect();
}

/// Human message for a known fatal engine log line.
pub fn engine_error_hint(line: &str) -> Option<&'static str> {
    ERROR_HINTS
        .iter()
        .find(|(re, _)| re.is_match(line))
        .map(|(_, hint)| *hint)
}

/// Form of an outbound command safe to write to the log.
///
/// `password` commands keep everything up to the last space and replace
/// the secret, unless `reveal` is set.
pub fn redact_command(cmd: &str, reveal: bool) -> String {
    if reveal || !cmd.starts_with("password") {
        return cmd.to_string();
    }
    match cmd.rfind(' ') {
        Some(idx) => format!("{}  ********", &cmd[..idx]),
        None => "password  ********".to_string(),
    }
}
