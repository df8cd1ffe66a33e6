//! Scripted range server for engine tests.
//!
//! `MockServer` answers every range request written to a `MockConnection`
//! from an in-memory firmware image. Individual responses can be bent
//! (different total, different length, `Connection: close`), trickled out a
//! few bytes per peek, or withheld so a test can inject raw bytes itself.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{DfuError, DfuResult};
use crate::session::{DownloadEvent, EventHandler};
use crate::transport::{Connection, Connector};

#[derive(Default)]
struct ConnState {
    inbound: Vec<u8>,
    visible: usize,
    eof_when_drained: bool,
    read_error: Option<io::ErrorKind>,
    closed: bool,
}

#[derive(Default)]
struct ServerState {
    firmware: Vec<u8>,
    conns: Vec<ConnState>,
    requests: Vec<String>,
    refuse_connects: usize,
    silent: bool,
    trickle: Option<usize>,
    close_after: HashSet<usize>,
    total_override: HashMap<usize, u64>,
    length_override: HashMap<usize, usize>,
}

impl ServerState {
    fn respond(&mut self, conn_id: usize, request: &str) {
        let index = self.requests.len() - 1;
        let Some((start, end)) = parse_range(request) else {
            return;
        };

        let total = self.firmware.len() as u64;
        let start = start as usize;
        let end = (end as usize).min(self.firmware.len().saturating_sub(1));
        let mut payload = if start < self.firmware.len() {
            self.firmware[start..=end].to_vec()
        } else {
            Vec::new()
        };
        if let Some(&len) = self.length_override.get(&index) {
            payload.resize(len, 0xAA);
        }

        let advertised_total = self.total_override.get(&index).copied().unwrap_or(total);
        let close = self.close_after.contains(&index);
        let mut response = format!(
            "HTTP/1.1 206 Partial Content\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Range: bytes {}-{}/{}\r\n\
             Content-Length: {}\r\n",
            start,
            start + payload.len().saturating_sub(1),
            advertised_total,
            payload.len()
        );
        if close {
            response.push_str("Connection: close\r\n");
        }
        response.push_str("\r\n");

        let trickle = self.trickle;
        let conn = &mut self.conns[conn_id];
        conn.inbound.extend_from_slice(response.as_bytes());
        conn.inbound.extend_from_slice(&payload);
        conn.eof_when_drained |= close;
        conn.visible = match trickle {
            Some(step) => (conn.visible + step).min(conn.inbound.len()),
            None => conn.inbound.len(),
        };
    }
}

fn parse_range(request: &str) -> Option<(u64, u64)> {
    let line = request
        .split("\r\n")
        .find(|line| line.starts_with("Range: bytes="))?;
    let (start, end) = line["Range: bytes=".len()..].split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Shared handle on the scripted server; clones observe the same state.
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn new(firmware: Vec<u8>) -> Self {
        let server = Self::default();
        server.lock().firmware = firmware;
        server
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            server: self.clone(),
        }
    }

    /// Do not answer requests; tests push bytes by hand.
    pub fn silent(self) -> Self {
        self.lock().silent = true;
        self
    }

    /// Release at most `step` more response bytes per peek.
    pub fn trickle(self, step: usize) -> Self {
        self.lock().trickle = Some(step);
        self
    }

    /// Answer request `index` (0-based) with `Connection: close`, then EOF.
    pub fn close_after(self, index: usize) -> Self {
        self.lock().close_after.insert(index);
        self
    }

    pub fn total_override(self, index: usize, total: u64) -> Self {
        self.lock().total_override.insert(index, total);
        self
    }

    pub fn length_override(self, index: usize, len: usize) -> Self {
        self.lock().length_override.insert(index, len);
        self
    }

    pub fn refuse_connects(&self, count: usize) {
        self.lock().refuse_connects = count;
    }

    /// Append raw bytes to the newest connection.
    pub fn push(&self, bytes: &[u8]) {
        let mut state = self.lock();
        let conn = state.conns.last_mut().expect("no connection");
        conn.inbound.extend_from_slice(bytes);
        conn.visible = conn.inbound.len();
    }

    /// Peer closes the newest connection once it is drained.
    pub fn hang_up(&self) {
        self.lock().conns.last_mut().expect("no connection").eof_when_drained = true;
    }

    pub fn fail_reads(&self, kind: io::ErrorKind) {
        self.lock().conns.last_mut().expect("no connection").read_error = Some(kind);
    }

    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    pub fn ranges(&self) -> Vec<(u64, u64)> {
        self.lock()
            .requests
            .iter()
            .filter_map(|r| parse_range(r))
            .collect()
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().conns.len()
    }

    pub fn connections_closed(&self) -> usize {
        self.lock().conns.iter().filter(|c| c.closed).count()
    }
}

pub struct MockConnector {
    server: MockServer,
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    fn connect(&self, host: &str, _port: u16) -> DfuResult<MockConnection> {
        let mut state = self.server.lock();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(DfuError::Connect {
                host: host.to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            });
        }
        state.conns.push(ConnState::default());
        Ok(MockConnection {
            server: self.server.clone(),
            id: state.conns.len() - 1,
        })
    }
}

pub struct MockConnection {
    server: MockServer,
    id: usize,
}

impl Connection for MockConnection {
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.server.lock();
        let trickle = state.trickle;
        let conn = &mut state.conns[self.id];
        if let Some(kind) = conn.read_error {
            return Err(io::Error::from(kind));
        }
        if conn.visible == 0 {
            return if conn.eof_when_drained && conn.inbound.is_empty() {
                Ok(0)
            } else {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            };
        }

        let n = conn.visible.min(buf.len());
        buf[..n].copy_from_slice(&conn.inbound[..n]);
        if let Some(step) = trickle {
            conn.visible = (conn.visible + step).min(conn.inbound.len());
        }
        Ok(n)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.server.lock();
        let conn = &mut state.conns[self.id];
        if let Some(kind) = conn.read_error {
            return Err(io::Error::from(kind));
        }
        if conn.visible == 0 {
            return if conn.eof_when_drained && conn.inbound.is_empty() {
                Ok(0)
            } else {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            };
        }

        let n = conn.visible.min(buf.len());
        buf[..n].copy_from_slice(&conn.inbound[..n]);
        conn.inbound.drain(..n);
        conn.visible -= n;
        Ok(n)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.server.lock();
        if state.conns[self.id].closed || state.conns[self.id].eof_when_drained {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let request = String::from_utf8_lossy(data).into_owned();
        state.requests.push(request.clone());
        if !state.silent {
            state.respond(self.id, &request);
        }
        Ok(())
    }

    fn close(self) {
        self.server.lock().conns[self.id].closed = true;
    }
}

/// What a recording handler saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Fragment { offset: u64, len: usize },
    Complete { firmware_size: u64 },
    Error(String),
}

/// Handler that records events and reassembles fragment bytes.
#[derive(Clone, Default)]
pub struct Recorder {
    pub seen: Arc<Mutex<Vec<Seen>>>,
    pub data: Arc<Mutex<Vec<u8>>>,
    reject_fragment_at: Option<u64>,
    reject_completions: Arc<Mutex<usize>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the fragment delivered at `offset`.
    pub fn reject_fragment_at(mut self, offset: u64) -> Self {
        self.reject_fragment_at = Some(offset);
        self
    }

    /// Fail the next `count` completion events.
    pub fn reject_completions(self, count: usize) -> Self {
        *self.reject_completions.lock().unwrap() = count;
        self
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn fragment_lens(&self) -> Vec<usize> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Fragment { len, .. } => Some(len),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.seen()
            .iter()
            .filter(|s| matches!(s, Seen::Complete { .. }))
            .count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.seen()
            .into_iter()
            .filter_map(|s| match s {
                Seen::Error(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn handler(&self) -> EventHandler {
        let recorder = self.clone();
        Box::new(move |event| {
            match event {
                DownloadEvent::Fragment { offset, data, .. } => {
                    recorder.seen.lock().unwrap().push(Seen::Fragment {
                        offset,
                        len: data.len(),
                    });
                    if recorder.reject_fragment_at == Some(offset) {
                        anyhow::bail!("flash write failed at {}", offset);
                    }
                    let mut image = recorder.data.lock().unwrap();
                    image.truncate(offset as usize);
                    image.extend_from_slice(data);
                }
                DownloadEvent::Complete { firmware_size } => {
                    recorder
                        .seen
                        .lock()
                        .unwrap()
                        .push(Seen::Complete { firmware_size });
                    let mut remaining = recorder.reject_completions.lock().unwrap();
                    if *remaining > 0 {
                        *remaining -= 1;
                        anyhow::bail!("image could not be applied");
                    }
                }
                DownloadEvent::Error(error) => {
                    recorder
                        .seen
                        .lock()
                        .unwrap()
                        .push(Seen::Error(error.to_string()));
                }
            }
            Ok(())
        })
    }
}

/// Deterministic test image.
pub fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
