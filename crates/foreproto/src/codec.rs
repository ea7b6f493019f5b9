//! Incremental frame reader.
//!
//! One `FrameReader` per connection. The connection task feeds it raw
//! slices as they arrive and drains events after every push; the reader
//! never touches a socket, which is what makes the framing laws testable
//! byte-at-a-time.
//!
//! The 8-byte header is always examined in place (peeked) before anything
//! is consumed, so a grow-or-drop decision never strands a partial frame.
//! A frame declaring more than `recv_buffer_size_limit` bytes is drained
//! to a null sink and reported as dropped; the connection stays usable.

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::frame::{self, Frame, FrameError, HEADER_LEN};
use crate::http::HttpRequest;

/// Default `recv_buffer_size` in header units.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 3;

/// Default hard ceiling for a single binary frame, in bytes.
pub const DEFAULT_RECV_BUFFER_SIZE_LIMIT: usize = 1024;

/// What the reader produced for the dispatcher.
#[derive(Debug, PartialEq)]
pub enum Event {
    /// A complete binary frame.
    Frame(Frame),
    /// A complete HTTP request.
    Http(HttpRequest),
    /// A frame that was skipped: oversize, or an unknown cipher.
    Dropped { cipher: u32, declared: usize },
}

enum Mode {
    /// Waiting for a full header to classify.
    Detect,
    /// Draining a skipped frame's declared length.
    Skip {
        cipher: u32,
        declared: usize,
        remaining: usize,
    },
    /// Mid-request HTTP accumulation.
    Http,
}

pub struct FrameReader {
    buf: BytesMut,
    /// Current logical buffer size; grows per-frame up to `limit`.
    capacity: usize,
    limit: usize,
    mode: Mode,
}

impl FrameReader {
    /// `recv_buffer_size` is in header units (bytes = size × 8);
    /// `recv_buffer_size_limit` is the per-frame byte ceiling.
    pub fn new(recv_buffer_size: usize, recv_buffer_size_limit: usize) -> Self {
        let capacity = recv_buffer_size.max(1) * HEADER_LEN;
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            limit: recv_buffer_size_limit,
            mode: Mode::Detect,
        }
    }

    /// Append received bytes. Call [`FrameReader::next`] until it returns
    /// `None` after every push.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Produce the next event, or `None` when more bytes are needed.
    /// An error is a framing violation; the connection must be closed.
    pub fn next(&mut self) -> Result<Option<Event>, FrameError> {
        loop {
            match &mut self.mode {
                Mode::Skip {
                    cipher,
                    declared,
                    remaining,
                } => {
                    let take = (*remaining).min(self.buf.len());
                    self.buf.advance(take);
                    *remaining -= take;
                    if *remaining > 0 {
                        return Ok(None);
                    }
                    let event = Event::Dropped {
                        cipher: *cipher,
                        declared: *declared,
                    };
                    self.mode = Mode::Detect;
                    return Ok(Some(event));
                }
                Mode::Http => match HttpRequest::parse(&mut self.buf)? {
                    Some(request) => {
                        self.mode = Mode::Detect;
                        return Ok(Some(Event::Http(request)));
                    }
                    None => return Ok(None),
                },
                Mode::Detect => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    // Peek only: nothing is consumed until the whole frame
                    // is handled.
                    let header: [u8; HEADER_LEN] = self.buf[..HEADER_LEN].try_into().unwrap();
                    let cipher = u32::from_le_bytes(header[0..4].try_into().unwrap());

                    if frame::is_binary_cipher(cipher) {
                        let declared = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
                        if declared < HEADER_LEN {
                            return Err(FrameError::LengthBelowHeader(declared));
                        }
                        if declared > self.limit {
                            self.mode = Mode::Skip {
                                cipher,
                                declared,
                                remaining: declared,
                            };
                            continue;
                        }
                        if declared > self.capacity {
                            trace!(from = self.capacity, to = declared, "growing recv buffer");
                            self.capacity = declared;
                        }
                        if self.buf.len() < declared {
                            return Ok(None);
                        }
                        let mut whole = self.buf.split_to(declared);
                        whole.advance(HEADER_LEN);
                        return Ok(Some(Event::Frame(Frame::new(cipher, whole.freeze()))));
                    }

                    if frame::looks_like_text(&header) {
                        self.mode = Mode::Http;
                        continue;
                    }

                    // Unknown cipher: drain its declared length and move on.
                    let declared = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
                    if declared < HEADER_LEN {
                        return Err(FrameError::LengthBelowHeader(declared));
                    }
                    self.mode = Mode::Skip {
                        cipher,
                        declared,
                        remaining: declared,
                    };
                }
            }
        }
    }
}
