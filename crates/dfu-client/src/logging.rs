//! Structured download logging.
//!
//! The engine reports lifecycle steps and protocol anomalies as
//! [`DownloadLog`] entries. The default [`TracingLogger`] forwards them to
//! `tracing`; callers can plug in their own sink or discard everything.

use std::fmt;

/// Structured log entry for one download session.
#[derive(Debug, Clone)]
pub struct DownloadLog<'a> {
    pub component: &'static str,
    pub host: &'a str,
    pub resource: &'a str,
    pub entry: LogEntry,
}

/// Things the engine reports while downloading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Transport connection established
    Connected { reconnect: bool },
    /// Range request written to the socket
    RequestSent { start: u64, end: u64, bytes: usize },
    /// Total size learned from the first Content-Range
    SizeLearned { firmware_size: u64 },
    /// Content-Range start differs from the requested offset
    RangeStartMismatch { requested: u64, served: u64 },
    /// Declared length is neither a full fragment nor the exact remainder
    LengthDeviation {
        declared: u64,
        max_fragment: usize,
        remaining: Option<u64>,
    },
    /// The response can never fit the response buffer
    ResponseTooLarge { needed: usize, capacity: usize },
    /// Non-2xx status on a range response
    UnexpectedStatus { status: u16 },
    /// Headers parsed, payload still arriving
    AwaitingPayload { received: usize, declared: u64 },
    /// Server announced `Connection: close`
    ResumeRequired { offset: u64 },
    /// Consumer accepted a fragment
    FragmentAccepted { offset: u64, len: u64 },
    /// Consumer rejected a fragment; download halted
    FragmentRejected { offset: u64, reason: String },
    /// Consumer rejected completion; last fragment will be fetched again
    CompletionRejected { offset: u64, reason: String },
    /// All bytes delivered and accepted
    DownloadComplete { firmware_size: u64 },
    /// Total size changed mid-download
    SizeMismatch { expected: u64, actual: u64 },
    /// Transfer failed
    Error { message: String },
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected { reconnect } => {
                write!(f, "connected reconnect={}", reconnect)
            }
            Self::RequestSent { start, end, bytes } => {
                write!(f, "request_sent range={}-{} bytes={}", start, end, bytes)
            }
            Self::SizeLearned { firmware_size } => {
                write!(f, "size_learned firmware_size={}", firmware_size)
            }
            Self::RangeStartMismatch { requested, served } => {
                write!(f, "range_start_mismatch requested={} served={}", requested, served)
            }
            Self::LengthDeviation { declared, max_fragment, remaining } => match remaining {
                Some(remaining) => write!(
                    f,
                    "length_deviation declared={} max_fragment={} remaining={}, waiting",
                    declared, max_fragment, remaining
                ),
                None => write!(
                    f,
                    "length_deviation declared={} max_fragment={} remaining=unknown, waiting",
                    declared, max_fragment
                ),
            },
            Self::ResponseTooLarge { needed, capacity } => {
                write!(f, "response_too_large needed={} capacity={}", needed, capacity)
            }
            Self::UnexpectedStatus { status } => {
                write!(f, "unexpected_status status={}", status)
            }
            Self::AwaitingPayload { received, declared } => {
                write!(f, "awaiting_payload received={} declared={}", received, declared)
            }
            Self::ResumeRequired { offset } => {
                write!(f, "resume_required offset={}", offset)
            }
            Self::FragmentAccepted { offset, len } => {
                write!(f, "fragment_accepted offset={} len={}", offset, len)
            }
            Self::FragmentRejected { offset, reason } => {
                write!(f, "fragment_rejected offset={} reason={}", offset, reason)
            }
            Self::CompletionRejected { offset, reason } => {
                write!(f, "completion_rejected offset={} reason={}", offset, reason)
            }
            Self::DownloadComplete { firmware_size } => {
                write!(f, "download_complete firmware_size={}", firmware_size)
            }
            Self::SizeMismatch { expected, actual } => {
                write!(f, "size_mismatch expected={} actual={}", expected, actual)
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

/// Sink for download log entries.
pub trait DownloadLogger: Send + Sync {
    fn log(&self, entry: DownloadLog<'_>);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl DownloadLogger for TracingLogger {
    fn log(&self, log: DownloadLog<'_>) {
        match &log.entry {
            LogEntry::LengthDeviation { .. }
            | LogEntry::ResponseTooLarge { .. }
            | LogEntry::UnexpectedStatus { .. }
            | LogEntry::RangeStartMismatch { .. }
            | LogEntry::FragmentRejected { .. }
            | LogEntry::CompletionRejected { .. }
            | LogEntry::SizeMismatch { .. }
            | LogEntry::Error { .. } => {
                tracing::warn!(
                    component = log.component,
                    host = log.host,
                    resource = log.resource,
                    "{}",
                    log.entry,
                );
            }
            LogEntry::Connected { .. }
            | LogEntry::SizeLearned { .. }
            | LogEntry::ResumeRequired { .. }
            | LogEntry::DownloadComplete { .. } => {
                tracing::info!(
                    component = log.component,
                    host = log.host,
                    resource = log.resource,
                    "{}",
                    log.entry,
                );
            }
            // Per-fragment chatter
            _ => {
                tracing::debug!(
                    component = log.component,
                    host = log.host,
                    resource = log.resource,
                    "{}",
                    log.entry,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl DownloadLogger for NullLogger {
    fn log(&self, _entry: DownloadLog<'_>) {}
}
