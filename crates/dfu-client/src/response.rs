//! Response head parsing for range responses.
//!
//! Only the pieces the engine acts on are extracted: status code,
//! `Content-Range`, `Content-Length` and a `close` token in `Connection`.
//! Header names match case-insensitively.

use thiserror::Error;

/// Blank line separating the header block from the payload.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Why a buffer does not (yet) hold a usable response head.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// No blank line seen yet.
    #[error("header block incomplete")]
    Incomplete,

    #[error("malformed status line")]
    BadStatusLine,

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("malformed {0} header")]
    MalformedHeader(&'static str),
}

/// `Content-Range: bytes <start>-<end>/<total>`. A total of `*` is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parse a header value such as `bytes 0-1023/2500`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let unit = value.get(..5)?;
        if !unit.eq_ignore_ascii_case("bytes") {
            return None;
        }

        let (range, total) = value[5..].trim_start().split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let start: u64 = start.trim().parse().ok()?;
        let end: u64 = end.trim().parse().ok()?;
        if end < start {
            return None;
        }

        let total = match total.trim() {
            "*" => None,
            digits => Some(digits.parse().ok()?),
        };

        Some(Self { start, end, total })
    }
}

/// Parsed head of one range response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_range: ContentRange,
    pub content_length: u64,
    /// Server will close the connection after this response.
    pub connection_close: bool,
    /// Bytes from the start of the buffer up to and including the blank line.
    pub header_len: usize,
}

impl ResponseHead {
    /// Parse the head at the front of `buf`.
    ///
    /// Returns [`ParseError::Incomplete`] until the blank line has arrived.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let end = find_terminator(buf).ok_or(ParseError::Incomplete)?;
        let head = String::from_utf8_lossy(&buf[..end]);
        let mut lines = head.split("\r\n");

        let status = lines
            .next()
            .and_then(parse_status_line)
            .ok_or(ParseError::BadStatusLine)?;

        let mut content_range = None;
        let mut content_length = None;
        let mut connection_close = false;

        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();

            if name.eq_ignore_ascii_case("content-range") {
                content_range = Some(
                    ContentRange::parse(value)
                        .ok_or(ParseError::MalformedHeader("Content-Range"))?,
                );
            } else if name.eq_ignore_ascii_case("content-length") {
                content_length = Some(
                    value
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| ParseError::MalformedHeader("Content-Length"))?,
                );
            } else if name.eq_ignore_ascii_case("connection") {
                connection_close |= value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"));
            }
        }

        Ok(Self {
            status,
            content_range: content_range.ok_or(ParseError::MissingHeader("Content-Range"))?,
            content_length: content_length.ok_or(ParseError::MissingHeader("Content-Length"))?,
            connection_close,
            header_len: end + HEADER_TERMINATOR.len(),
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Offset of the header terminator in `buf`, if present.
pub fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    let code = parts.next()?;
    if code.len() != 3 {
        return None;
    }
    code.parse().ok()
}
