//! Framing: fixed big-endian header (message id, optional session discriminator) + UTF-8 content.

/// Default datagram budget in bytes, header included. Well within the MTU of old cellular links.
pub const DEFAULT_BUFFER_SIZE: usize = 800;

/// Header layout. One layout per deployment; the two are not wire compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderLayout {
    /// `message_id:u16 | discriminator:u16`. Discriminator 0 means "none assigned".
    #[default]
    Session,
    /// `message_id:u16` only.
    Legacy,
}

impl HeaderLayout {
    pub fn header_len(self) -> usize {
        match self {
            HeaderLayout::Session => 4,
            HeaderLayout::Legacy => 2,
        }
    }
}

/// One decoded datagram body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u16,
    pub discriminator: Option<u16>,
    pub content: String,
}

/// Encoded frame plus the number of content bytes that did not fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub unsent: usize,
}

impl Encoded {
    /// The part of `content` that was cut off (empty when everything fit). Empty as well when
    /// `content` is not the string this frame was encoded from and the cut does not line up.
    pub fn remainder<'a>(&self, content: &'a str) -> &'a str {
        content
            .len()
            .checked_sub(self.unsent)
            .and_then(|start| content.get(start..))
            .unwrap_or("")
    }
}

/// Encoder/decoder bound to a header layout and a datagram budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadCodec {
    layout: HeaderLayout,
    buffer_size: usize,
}

impl PayloadCodec {
    pub fn new(layout: HeaderLayout, buffer_size: usize) -> Result<Self, CodecError> {
        if buffer_size <= layout.header_len() {
            return Err(CodecError::BufferTooSmall {
                buffer_size,
                header_len: layout.header_len(),
            });
        }
        Ok(Self {
            layout,
            buffer_size,
        })
    }

    pub fn layout(&self) -> HeaderLayout {
        self.layout
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Write header then content. Content is cut on a character boundary so the frame never
    /// exceeds the budget; `unsent` tells the caller how much was left behind.
    pub fn encode(&self, message_id: u16, discriminator: Option<u16>, content: &str) -> Encoded {
        let header_len = self.layout.header_len();
        let room = self.buffer_size - header_len;
        let mut cut = content.len().min(room);
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }

        let mut bytes = Vec::with_capacity(header_len + cut);
        bytes.extend_from_slice(&message_id.to_be_bytes());
        if self.layout == HeaderLayout::Session {
            bytes.extend_from_slice(&discriminator.unwrap_or(0).to_be_bytes());
        }
        bytes.extend_from_slice(&content.as_bytes()[..cut]);
        Encoded {
            bytes,
            unsent: content.len() - cut,
        }
    }

    /// Decode one datagram. Invalid UTF-8 in the content is replaced, not rejected.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
        let header_len = self.layout.header_len();
        if bytes.len() < header_len {
            return Err(FrameDecodeError::Malformed {
                len: bytes.len(),
                header_len,
            });
        }
        let message_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let discriminator = match self.layout {
            HeaderLayout::Session => match u16::from_be_bytes([bytes[2], bytes[3]]) {
                0 => None,
                d => Some(d),
            },
            HeaderLayout::Legacy => None,
        };
        let content = String::from_utf8_lossy(&bytes[header_len..]).into_owned();
        Ok(Frame {
            message_id,
            discriminator,
            content,
        })
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self {
            layout: HeaderLayout::Session,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("buffer size {buffer_size} cannot hold a {header_len}-byte header and content")]
    BufferTooSmall { buffer_size: usize, header_len: usize },
}

/// Error decoding a datagram.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("malformed frame: {len} bytes, header needs {header_len}")]
    Malformed { len: usize, header_len: usize },
}
