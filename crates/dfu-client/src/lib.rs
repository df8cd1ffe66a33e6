/// DFU client: resumable firmware download over HTTP/1.1 byte ranges.
///
/// Provides a polled, single-connection download engine with:
/// - Fixed-size `Range` requests, one outstanding at a time
/// - Non-destructive peeks so responses may arrive in any number of pieces
/// - Total size learned from `Content-Range` and checked on every response
/// - Reconnect-and-resume when the server sends `Connection: close`
/// - Consumer veto per fragment (halt) and on completion (refetch last fragment)
/// - Pluggable structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod request;
pub mod response;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mock;

// Re-export key types for convenience.
pub use config::{
    DEFAULT_MAX_FRAGMENT_SIZE, DEFAULT_MAX_REQUEST_SIZE, DEFAULT_MAX_RESPONSE_SIZE, DEFAULT_PORT,
    DfuConfig,
};
pub use error::{DfuError, DfuResult};
pub use logging::{DownloadLog, DownloadLogger, LogEntry, NullLogger, TracingLogger};
pub use request::RangeRequest;
pub use response::{ContentRange, ParseError, ResponseHead};
pub use session::{DownloadEvent, DownloadStatus, EventHandler, Progress, Session};
pub use transport::{Connection, Connector, TcpConnection, TcpConnector};
