//! Incremental decoder for the post-handshake RFB message stream.
//!
//! [`Decoder::decode`] is pure: it looks at an accumulated byte window and
//! reports which complete messages it contains, how many bytes they span,
//! and how many more bytes the first incomplete message needs. The caller
//! keeps the unconsumed tail and retries once more bytes arrive.

use bytes::Bytes;

use crate::message::{Direction, Message, ParsedMessage};

/// Default cap on any declared message length.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 32 * 1024 * 1024;

/// Upper bound of the framebuffer-update length approximation.
const FRAMEBUFFER_UPDATE_SPAN: usize = 1024;

// ---------------------------------------------------------------------------
// Errors and outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message tag {tag} declares {declared} bytes, limit is {max}")]
    Oversized { tag: u8, declared: usize, max: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub messages: Vec<ParsedMessage>,
    /// Bytes from the start of the window covered by `messages`.
    pub consumed: usize,
    /// More bytes required to complete the message starting at `consumed`.
    pub needed: Option<usize>,
}

/// Result of framing a single message at the start of a slice.
enum Frame {
    Complete(Message, usize),
    Incomplete(usize),
    Unrecognised,
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    max_message_len: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl Decoder {
    pub fn new(max_message_len: usize) -> Self {
        Self { max_message_len }
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// Decode as many complete messages from `buf` as possible.
    ///
    /// Consecutive unrecognised bytes are coalesced into one
    /// [`Message::Unknown`]. A declared length above the limit is an error on
    /// the client stream; on the server stream the tag byte is treated as
    /// unrecognised.
    pub fn decode(&self, buf: &[u8], direction: Direction) -> Result<DecodeOutcome, DecodeError> {
        let mut outcome = DecodeOutcome::default();
        let mut pos = 0;
        let mut unknown_start: Option<usize> = None;

        while pos < buf.len() {
            let frame = match direction {
                Direction::ClientToServer => self.frame_client(&buf[pos..])?,
                Direction::ServerToClient => match self.frame_server(&buf[pos..]) {
                    Ok(frame) => frame,
                    Err(DecodeError::Oversized { tag, declared, .. }) => {
                        tracing::debug!(tag, declared, "oversized server message treated as opaque");
                        Frame::Unrecognised
                    }
                },
            };

            match frame {
                Frame::Unrecognised => {
                    unknown_start.get_or_insert(pos);
                    pos += 1;
                }
                Frame::Complete(message, len) => {
                    flush_unknown(buf, &mut unknown_start, pos, &mut outcome.messages);
                    outcome.messages.push(ParsedMessage {
                        message,
                        offset: pos,
                        len,
                    });
                    pos += len;
                }
                Frame::Incomplete(needed) => {
                    flush_unknown(buf, &mut unknown_start, pos, &mut outcome.messages);
                    outcome.needed = Some(needed);
                    break;
                }
            }
        }

        flush_unknown(buf, &mut unknown_start, pos, &mut outcome.messages);
        outcome.consumed = pos;
        Ok(outcome)
    }

    /// Whether an incomplete server tail must wait for the rest of its
    /// message instead of being flushed unparsed.
    ///
    /// Cut text and file responses carry content that has to be inspected,
    /// so a tail opening with either tag is held while its declared length
    /// is within the limit. Anything else may be false framing inside pixel
    /// data.
    pub fn holds_server_tail(&self, tail: &[u8]) -> bool {
        match tail.first().copied() {
            Some(3) | Some(7) => {
                tail.len() < 8 || 8usize.saturating_add(be_u32(tail, 4) as usize) <= self.max_message_len
            }
            _ => false,
        }
    }

    fn frame_client(&self, b: &[u8]) -> Result<Frame, DecodeError> {
        let frame = match b[0] {
            0 => fixed(b, 20, |_| Message::SetPixelFormat),
            2 => {
                if b.len() < 4 {
                    return Ok(Frame::Incomplete(4 - b.len()));
                }
                let count = be_u16(b, 2);
                let total = 4 + 4 * count as usize;
                self.check_len(b[0], total)?;
                fixed(b, total, |_| Message::SetEncodings { count })
            }
            3 => fixed(b, 10, |m| Message::FramebufferUpdateRequest {
                incremental: m[1] != 0,
                x: be_u16(m, 2),
                y: be_u16(m, 4),
                width: be_u16(m, 6),
                height: be_u16(m, 8),
            }),
            4 => fixed(b, 8, |m| Message::KeyEvent {
                down: m[1] != 0,
                key: be_u32(m, 4),
            }),
            5 => fixed(b, 6, |m| Message::PointerEvent {
                buttons: m[1],
                x: be_u16(m, 2),
                y: be_u16(m, 4),
            }),
            6 => self.cut_text(b, |text| Message::ClientCutText { text })?,
            7 => self.file_request(b)?,
            _ => Frame::Unrecognised,
        };
        Ok(frame)
    }

    fn frame_server(&self, b: &[u8]) -> Result<Frame, DecodeError> {
        let frame = match b[0] {
            0 => {
                if b.len() < 4 {
                    return Ok(Frame::Incomplete(4 - b.len()));
                }
                let approx_len = b.len().min(FRAMEBUFFER_UPDATE_SPAN);
                Frame::Complete(
                    Message::FramebufferUpdate {
                        rectangle_count: be_u16(b, 2),
                        approx_len,
                    },
                    approx_len,
                )
            }
            1 => {
                if b.len() < 6 {
                    return Ok(Frame::Incomplete(6 - b.len()));
                }
                let first_colour = be_u16(b, 2);
                let count = be_u16(b, 4);
                let total = 6 + 6 * count as usize;
                self.check_len(b[0], total)?;
                fixed(b, total, |_| Message::SetColourMapEntries {
                    first_colour,
                    count,
                })
            }
            2 => Frame::Complete(Message::Bell, 1),
            3 => self.cut_text(b, |text| Message::ServerCutText { text })?,
            7 => {
                if b.len() < 8 {
                    return Ok(Frame::Incomplete(8 - b.len()));
                }
                let size = be_u32(b, 4);
                let total = 8usize.saturating_add(size as usize);
                self.check_len(b[0], total)?;
                fixed(b, total, |m| Message::FileTransferResponse {
                    size,
                    payload: Bytes::copy_from_slice(&m[8..]),
                })
            }
            _ => Frame::Unrecognised,
        };
        Ok(frame)
    }

    /// `[tag][3 pad][u32 len][len bytes Latin-1]`
    fn cut_text(&self, b: &[u8], build: impl FnOnce(String) -> Message) -> Result<Frame, DecodeError> {
        if b.len() < 8 {
            return Ok(Frame::Incomplete(8 - b.len()));
        }
        let total = 8usize.saturating_add(be_u32(b, 4) as usize);
        self.check_len(b[0], total)?;
        Ok(fixed(b, total, |m| build(latin1(&m[8..]))))
    }

    /// `[7][3 pad][u32 name_len][name][u32 size][payload]`
    fn file_request(&self, b: &[u8]) -> Result<Frame, DecodeError> {
        if b.len() < 8 {
            return Ok(Frame::Incomplete(8 - b.len()));
        }
        let name_len = be_u32(b, 4) as usize;
        let size_at = 8usize.saturating_add(name_len);
        self.check_len(b[0], size_at.saturating_add(4))?;
        if b.len() < size_at + 4 {
            return Ok(Frame::Incomplete(size_at + 4 - b.len()));
        }
        let size = be_u32(b, size_at);
        let total = (size_at + 4).saturating_add(size as usize);
        self.check_len(b[0], total)?;
        Ok(fixed(b, total, |m| Message::FileTransferRequest {
            file_name: String::from_utf8_lossy(&m[8..size_at]).into_owned(),
            size,
            payload: Bytes::copy_from_slice(&m[size_at + 4..]),
        }))
    }

    fn check_len(&self, tag: u8, declared: usize) -> Result<(), DecodeError> {
        if declared > self.max_message_len {
            return Err(DecodeError::Oversized {
                tag,
                declared,
                max: self.max_message_len,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Frame a message of known total length, building it from exactly `len` bytes.
fn fixed(b: &[u8], len: usize, build: impl FnOnce(&[u8]) -> Message) -> Frame {
    if b.len() < len {
        Frame::Incomplete(len - b.len())
    } else {
        Frame::Complete(build(&b[..len]), len)
    }
}

fn flush_unknown(
    buf: &[u8],
    start: &mut Option<usize>,
    end: usize,
    out: &mut Vec<ParsedMessage>,
) {
    if let Some(start) = start.take() {
        out.push(ParsedMessage {
            message: Message::Unknown {
                tag: buf[start],
                len: end - start,
            },
            offset: start,
            len: end - start,
        });
    }
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
