//! Download engine: one resumable ranged download over a polled connection.
//!
//! A [`Session`] fetches `resource` from `host` in fragments of at most
//! `max_fragment_size` bytes, one outstanding range request at a time. The
//! caller drives it:
//!
//! ```text
//! connect() -> start_download() -> advance() ... advance() -> Complete
//! ```
//!
//! Each `advance` peeks whatever the socket has buffered, without consuming
//! it. Nothing is consumed until a whole fragment (headers plus exactly
//! `Content-Length` payload bytes) is visible and the handler has seen it;
//! the response is then drained and the next range is requested. A response
//! can therefore arrive in any number of pieces.

use std::mem::{self, Discriminant};
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::config::DfuConfig;
use crate::error::{DfuError, DfuResult};
use crate::logging::{DownloadLog, DownloadLogger, LogEntry, TracingLogger};
use crate::request::RangeRequest;
use crate::response::{ParseError, ResponseHead};
use crate::transport::{Connection, Connector, TcpConnector};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Idle,
    Connected,
    DownloadInProgress,
    DownloadComplete,
    /// The handler rejected a fragment. Nothing is retried.
    Halted,
    Error,
}

/// Notification delivered to the session's handler.
#[derive(Debug)]
pub enum DownloadEvent<'a> {
    /// The download failed. The handler's verdict is ignored.
    Error(&'a DfuError),
    /// A complete fragment. `data` is only valid for the duration of the call;
    /// returning `Err` halts the download.
    Fragment {
        offset: u64,
        data: &'a [u8],
        firmware_size: Option<u64>,
    },
    /// Every byte has been delivered. Returning `Err` rolls back the last
    /// fragment and requests it again.
    Complete { firmware_size: u64 },
}

/// Handler invoked synchronously from inside `advance`.
pub type EventHandler = Box<dyn FnMut(DownloadEvent<'_>) -> anyhow::Result<()> + Send>;

/// Outcome of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing to act on yet.
    Pending,
    /// A fragment of `len` bytes was accepted and the next one requested.
    Fragment { len: u64 },
    /// Completion was rejected; the last fragment is being fetched again.
    Retrying,
    Complete,
    Halted,
    /// An error event was emitted and the session is in `Error`.
    Failed,
}

/// A single firmware download.
pub struct Session<C: Connector = TcpConnector> {
    host: String,
    resource: String,
    config: DfuConfig,
    connector: C,
    connection: Option<C::Connection>,
    status: DownloadStatus,
    downloaded_bytes: u64,
    firmware_size: Option<u64>,
    request_buf: BytesMut,
    response_buf: BytesMut,
    handler: EventHandler,
    logger: Arc<dyn DownloadLogger>,
    /// Anomalies already reported for the outstanding request.
    reported: Vec<Discriminant<LogEntry>>,
}

impl Session<TcpConnector> {
    /// Build a session that connects over TCP.
    pub fn new(
        host: impl Into<String>,
        resource: impl Into<String>,
        handler: EventHandler,
        config: DfuConfig,
    ) -> DfuResult<Self> {
        let connector = TcpConnector::new().with_connect_timeout(config.connect_timeout);
        Self::with_connector(host, resource, handler, config, connector)
    }
}

impl<C: Connector> Session<C> {
    /// Build a session that opens connections through `connector`.
    pub fn with_connector(
        host: impl Into<String>,
        resource: impl Into<String>,
        handler: EventHandler,
        config: DfuConfig,
        connector: C,
    ) -> DfuResult<Self> {
        let host = host.into();
        let resource = resource.into();
        if host.trim().is_empty() {
            return Err(DfuError::MissingField("host"));
        }
        if resource.trim().is_empty() {
            return Err(DfuError::MissingField("resource"));
        }
        config.validate()?;

        Ok(Self {
            request_buf: BytesMut::with_capacity(config.max_request_size),
            response_buf: BytesMut::zeroed(config.max_response_size),
            host,
            resource,
            config,
            connector,
            connection: None,
            status: DownloadStatus::Idle,
            downloaded_bytes: 0,
            firmware_size: None,
            handler,
            logger: Arc::new(TracingLogger),
            reported: Vec::new(),
        })
    }

    /// Replace the default tracing logger.
    pub fn with_logger(mut self, logger: Arc<dyn DownloadLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    /// Total size, once a response has announced it.
    pub fn firmware_size(&self) -> Option<u64> {
        self.firmware_size
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn config(&self) -> &DfuConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Bytes of the most recently built request.
    pub fn last_request(&self) -> &[u8] {
        &self.request_buf
    }

    /// Open a connection. A no-op while already connected.
    ///
    /// On failure the session is left as it was and no event is emitted.
    pub fn connect(&mut self) -> DfuResult<()> {
        if self.status == DownloadStatus::Connected && self.connection.is_some() {
            debug!(host = %self.host, "already connected");
            return Ok(());
        }

        let connection = self.connector.connect(&self.host, self.config.port)?;
        if let Some(stale) = self.connection.replace(connection) {
            stale.close();
        }
        self.status = DownloadStatus::Connected;
        self.log(LogEntry::Connected { reconnect: false });
        Ok(())
    }

    /// Request the fragment at the current offset.
    pub fn start_download(&mut self) -> DfuResult<()> {
        self.expect_status(DownloadStatus::Connected)?;
        if self.connection.is_none() {
            return Err(DfuError::NotConnected);
        }

        self.firmware_size = None;
        self.request_fragment(false, false)
    }

    /// Poll the connection once and act on whatever has arrived.
    pub fn advance(&mut self) -> DfuResult<Progress> {
        self.expect_status(DownloadStatus::DownloadInProgress)?;
        let Some(connection) = self.connection.as_mut() else {
            return Ok(self.fail(DfuError::NotConnected));
        };

        self.response_buf.fill(0);
        let received = match connection.peek(&mut self.response_buf) {
            Ok(0) => return Ok(self.fail(DfuError::ConnectionClosed)),
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(Progress::Pending);
            }
            Err(e) => return Ok(self.fail(DfuError::Transport(e))),
        };

        let head = match ResponseHead::parse(&self.response_buf[..received]) {
            Ok(head) => head,
            Err(ParseError::Incomplete) => return Ok(Progress::Pending),
            Err(e) => {
                debug!(received, error = %e, "response head not usable yet");
                return Ok(Progress::Pending);
            }
        };

        if !head.is_success() {
            self.report(LogEntry::UnexpectedStatus {
                status: head.status,
            });
        }

        if let Some(total) = head.content_range.total {
            match self.firmware_size {
                None if self.downloaded_bytes > total => {
                    return Ok(self.fail(DfuError::OffsetBeyondSize {
                        offset: self.downloaded_bytes,
                        firmware_size: total,
                    }));
                }
                None => {
                    self.firmware_size = Some(total);
                    self.log(LogEntry::SizeLearned {
                        firmware_size: total,
                    });
                }
                Some(known) if known != total => {
                    self.log(LogEntry::SizeMismatch {
                        expected: known,
                        actual: total,
                    });
                    return Ok(self.fail(DfuError::SizeMismatch {
                        expected: known,
                        actual: total,
                    }));
                }
                Some(_) => {}
            }
        }

        if head.content_range.start != self.downloaded_bytes {
            self.report(LogEntry::RangeStartMismatch {
                requested: self.downloaded_bytes,
                served: head.content_range.start,
            });
        }

        let declared = head.content_length;
        let needed = (head.header_len as u64).checked_add(declared);
        let Some(needed) = needed.filter(|_| self.is_whole_fragment(declared)) else {
            self.report(LogEntry::LengthDeviation {
                declared,
                max_fragment: self.config.max_fragment_size,
                remaining: self
                    .firmware_size
                    .map(|size| size.saturating_sub(self.downloaded_bytes)),
            });
            return Ok(Progress::Pending);
        };

        if needed > self.response_buf.len() as u64 {
            self.report(LogEntry::ResponseTooLarge {
                needed: needed as usize,
                capacity: self.response_buf.len(),
            });
            return Ok(Progress::Pending);
        }
        if (received as u64) < needed {
            self.log(LogEntry::AwaitingPayload {
                received: received - head.header_len,
                declared,
            });
            return Ok(Progress::Pending);
        }

        let resume = head.connection_close;
        let offset = self.downloaded_bytes;
        if resume {
            self.log(LogEntry::ResumeRequired {
                offset: offset + declared,
            });
        }

        let payload = head.header_len..needed as usize;
        let verdict = (self.handler)(DownloadEvent::Fragment {
            offset,
            data: &self.response_buf[payload],
            firmware_size: self.firmware_size,
        });
        if let Err(reason) = verdict {
            self.status = DownloadStatus::Halted;
            self.log(LogEntry::FragmentRejected {
                offset,
                reason: format!("{:#}", reason),
            });
            return Ok(Progress::Halted);
        }

        self.downloaded_bytes += declared;
        self.log(LogEntry::FragmentAccepted {
            offset,
            len: declared,
        });

        if self.firmware_size != Some(self.downloaded_bytes) {
            return self.follow_up(resume, Progress::Fragment { len: declared });
        }

        let firmware_size = self.downloaded_bytes;
        self.status = DownloadStatus::DownloadComplete;
        match (self.handler)(DownloadEvent::Complete { firmware_size }) {
            Ok(()) => {
                self.log(LogEntry::DownloadComplete { firmware_size });
                if let Err(e) = self.flush() {
                    warn!(error = %e, "draining after completion failed");
                }
                Ok(Progress::Complete)
            }
            Err(reason) => {
                self.downloaded_bytes -= declared;
                self.log(LogEntry::CompletionRejected {
                    offset,
                    reason: format!("{:#}", reason),
                });
                self.follow_up(resume, Progress::Retrying)
            }
        }
    }

    /// Close any connection and return to `Idle`. Progress is kept.
    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.status = DownloadStatus::Idle;
        self.reported.clear();
    }

    /// Continue from a previously persisted offset on the next `start_download`.
    pub fn resume_from(&mut self, offset: u64) -> DfuResult<()> {
        self.reject_in_progress()?;
        self.downloaded_bytes = offset;
        Ok(())
    }

    /// Forget all progress so the next `start_download` begins at byte zero.
    pub fn reset_progress(&mut self) -> DfuResult<()> {
        self.reject_in_progress()?;
        self.downloaded_bytes = 0;
        self.firmware_size = None;
        Ok(())
    }

    /// A declared length completes the outstanding request only if it is a
    /// full fragment or exactly the remainder of a known size.
    fn is_whole_fragment(&self, declared: u64) -> bool {
        let Some(end) = self.downloaded_bytes.checked_add(declared) else {
            return false;
        };
        match self.firmware_size {
            Some(size) if end > size => false,
            Some(size) if end == size => true,
            _ => declared == self.config.max_fragment_size as u64,
        }
    }

    /// Drain the answered response and issue the next request.
    fn follow_up(&mut self, resume: bool, progress: Progress) -> DfuResult<Progress> {
        match self.request_fragment(true, resume) {
            Ok(()) => Ok(progress),
            Err(e @ DfuError::RequestTooLarge { .. }) => {
                self.status = DownloadStatus::Error;
                self.log(LogEntry::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
            Err(e) => Ok(self.fail(e)),
        }
    }

    /// Send the range request for the current offset.
    ///
    /// `flush` drains the previous response first. `resume` replaces the
    /// connection before sending because the server is closing it.
    fn request_fragment(&mut self, flush: bool, resume: bool) -> DfuResult<()> {
        if flush {
            self.flush()?;
        }

        if resume {
            if let Some(stale) = self.connection.take() {
                stale.close();
            }
            let connection = self.connector.connect(&self.host, self.config.port)?;
            self.connection = Some(connection);
            self.log(LogEntry::Connected { reconnect: true });
        }

        let request = RangeRequest::for_fragment(
            &self.host,
            &self.resource,
            self.downloaded_bytes,
            self.config.max_fragment_size,
            self.firmware_size,
        );
        let len = request.encode_into(&mut self.request_buf, self.config.max_request_size)?;

        let connection = self.connection.as_mut().ok_or(DfuError::NotConnected)?;
        connection.send(&self.request_buf[..len])?;

        self.status = DownloadStatus::DownloadInProgress;
        self.reported.clear();
        self.log(LogEntry::RequestSent {
            start: request.start,
            end: request.end,
            bytes: len,
        });
        Ok(())
    }

    /// Consume everything buffered on the connection.
    fn flush(&mut self) -> DfuResult<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };

        let mut drained = 0;
        loop {
            match connection.recv(&mut self.response_buf) {
                // Peer closed; whoever sends next finds out.
                Ok(0) => break,
                Ok(n) => drained += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.response_buf.fill(0);
        debug!(drained, "drained response");
        Ok(())
    }

    /// Enter `Error` and tell the handler.
    fn fail(&mut self, error: DfuError) -> Progress {
        self.status = DownloadStatus::Error;
        self.log(LogEntry::Error {
            message: error.to_string(),
        });
        if let Err(e) = (self.handler)(DownloadEvent::Error(&error)) {
            debug!(error = %e, "handler failed on error event");
        }
        Progress::Failed
    }

    fn expect_status(&self, expected: DownloadStatus) -> DfuResult<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(DfuError::InvalidState {
                expected,
                actual: self.status,
            })
        }
    }

    fn reject_in_progress(&self) -> DfuResult<()> {
        if self.status == DownloadStatus::DownloadInProgress {
            return Err(DfuError::InvalidState {
                expected: DownloadStatus::Idle,
                actual: self.status,
            });
        }
        Ok(())
    }

    /// Log an anomaly once per outstanding request.
    fn report(&mut self, entry: LogEntry) {
        let kind = mem::discriminant(&entry);
        if !self.reported.contains(&kind) {
            self.reported.push(kind);
            self.log(entry);
        }
    }

    fn log(&self, entry: LogEntry) {
        self.logger.log(DownloadLog {
            component: "session",
            host: &self.host,
            resource: &self.resource,
            entry,
        });
    }
}
