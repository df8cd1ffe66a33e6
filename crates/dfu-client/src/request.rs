//! Range request construction.
//!
//! ```text
//! GET <resource> HTTP/1.1\r\n
//! Host: <host>\r\n
//! Connection: keep-alive\r\n
//! Range: bytes=<start>-<end>\r\n
//! \r\n
//! ```

use std::fmt::Write as _;

use bytes::BytesMut;

use crate::error::{DfuError, DfuResult};

/// One fragment request: an inclusive byte range of `resource` on `host`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest<'a> {
    pub host: &'a str,
    pub resource: &'a str,
    pub start: u64,
    pub end: u64,
}

impl<'a> RangeRequest<'a> {
    /// Request the fragment starting at `offset`.
    ///
    /// The range spans `max_fragment_size` bytes, cut short at the last byte
    /// of the object once its size is known.
    pub fn for_fragment(
        host: &'a str,
        resource: &'a str,
        offset: u64,
        max_fragment_size: usize,
        firmware_size: Option<u64>,
    ) -> Self {
        let mut end = offset.saturating_add((max_fragment_size as u64).saturating_sub(1));
        if let Some(size) = firmware_size {
            if size > offset {
                end = end.min(size - 1);
            }
        }
        Self {
            host,
            resource,
            start: offset,
            end,
        }
    }

    /// Scrub `buf` and write the request into it. Fails without touching the
    /// wire if the request would not fit in `capacity` bytes.
    pub fn encode_into(&self, buf: &mut BytesMut, capacity: usize) -> DfuResult<usize> {
        let mut text = String::with_capacity(capacity);
        // Writing into a String cannot fail.
        let _ = write!(
            text,
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\nRange: bytes={}-{}\r\n\r\n",
            self.resource, self.host, self.start, self.end
        );

        buf.clear();
        if text.len() > capacity {
            return Err(DfuError::RequestTooLarge {
                needed: text.len(),
                capacity,
            });
        }

        buf.extend_from_slice(text.as_bytes());
        Ok(text.len())
    }
}
