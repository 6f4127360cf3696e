//! Binary peer-to-peer message framing
//!
//! Four single-byte-tagged message variants travel between peers. All
//! multi-byte integers are little-endian; no runtime negotiation is ever
//! performed. Layouts:
//!
//! ```text
//! BlockContent:  tag(1) total_size(8) block_n(1) block_size(2) file_id(16) content(..)
//! BlockRequest:  tag(1) block_n(1) file_id(16) path_size(2) path(path_size)
//! IndexContent:  tag(1) total_size(8) json(..)
//! IndexRequest:  tag(1)
//! ```
//!
//! `total_size` covers every byte from the tag inclusive. `block_size`
//! declares an upper bound on the block payload in KiB; the actual payload
//! length is `total_size` minus the fixed header.

use crate::index::Index;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

const TAG_BLOCK_CONTENT: u8 = 0;
const TAG_BLOCK_REQUEST: u8 = 1;
const TAG_INDEX_CONTENT: u8 = 2;
const TAG_INDEX_REQUEST: u8 = 3;

const SIZE_TAG: usize = 1;
const SIZE_TOTAL: usize = 8;
const SIZE_BLOCK_N: usize = 1;
const SIZE_BLOCK_SIZE: usize = 2;
const SIZE_FILE_ID: usize = 16;
const SIZE_PATH_SIZE: usize = 2;

/// Fixed header bytes preceding a BlockContent payload.
const BLOCK_CONTENT_HEADER: usize =
    SIZE_TAG + SIZE_TOTAL + SIZE_BLOCK_N + SIZE_BLOCK_SIZE + SIZE_FILE_ID;
/// Fixed header bytes preceding a BlockRequest path.
const BLOCK_REQUEST_HEADER: usize = SIZE_TAG + SIZE_BLOCK_N + SIZE_FILE_ID + SIZE_PATH_SIZE;
/// Fixed header bytes preceding an IndexContent JSON body.
const INDEX_CONTENT_HEADER: usize = SIZE_TAG + SIZE_TOTAL;

/// Largest admissible BlockContent payload: the declared bound is a u16
/// count of KiB.
const MAX_BLOCK_PAYLOAD: usize = u16::MAX as usize * 1024;

/// Largest admissible IndexContent JSON body.
const MAX_INDEX_PAYLOAD: usize = 256 * 1024 * 1024;

const RECV_CHUNK_SIZE: usize = 64 * 1024;

/// Errors from decoding a single frame.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("message of {0} bytes is shorter than its fixed header")]
    Short(usize),

    #[error("unknown message tag {0:#04x}")]
    WrongTag(u8),

    #[error("declared size {declared} disagrees with frame of {actual} bytes")]
    LengthMismatch { declared: u64, actual: usize },

    #[error("declared block payload of {0} bytes exceeds the maximum")]
    OversizedBlock(usize),

    #[error("declared index payload of {0} bytes exceeds the maximum")]
    OversizedIndex(usize),

    #[error("malformed index payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors from the stream receive loop.
#[derive(Error, Debug)]
pub enum RecvError {
    #[error("stream closed mid-message")]
    Disconnected,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One peer-to-peer message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// One block's bytes plus its coordinates within a file.
    BlockContent {
        file_id: Uuid,
        block_n: u8,
        /// Declared upper bound on the payload, in KiB.
        block_size: u16,
        content: Vec<u8>,
    },
    /// Ask the peer for a specific block of a file under its root.
    BlockRequest {
        file_id: Uuid,
        block_n: u8,
        path: PathBuf,
    },
    /// The peer's full index, JSON-encoded.
    IndexContent(Index),
    /// Ask the peer for its current index.
    IndexRequest,
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::BlockContent { .. } => TAG_BLOCK_CONTENT,
            Message::BlockRequest { .. } => TAG_BLOCK_REQUEST,
            Message::IndexContent(_) => TAG_INDEX_CONTENT,
            Message::IndexRequest => TAG_INDEX_REQUEST,
        }
    }

    /// Serialize to the wire layout.
    pub fn dump(&self) -> Vec<u8> {
        match self {
            Message::BlockContent { file_id, block_n, block_size, content } => {
                let total = (BLOCK_CONTENT_HEADER + content.len()) as u64;
                let mut raw = Vec::with_capacity(total as usize);
                raw.push(TAG_BLOCK_CONTENT);
                raw.extend_from_slice(&total.to_le_bytes());
                raw.push(*block_n);
                raw.extend_from_slice(&block_size.to_le_bytes());
                raw.extend_from_slice(file_id.as_bytes());
                raw.extend_from_slice(content);
                raw
            }
            Message::BlockRequest { file_id, block_n, path } => {
                let path_bytes = path.to_string_lossy().into_owned().into_bytes();
                let mut raw = Vec::with_capacity(BLOCK_REQUEST_HEADER + path_bytes.len());
                raw.push(TAG_BLOCK_REQUEST);
                raw.push(*block_n);
                raw.extend_from_slice(file_id.as_bytes());
                raw.extend_from_slice(&(path_bytes.len() as u16).to_le_bytes());
                raw.extend_from_slice(&path_bytes);
                raw
            }
            Message::IndexContent(index) => {
                let json = serde_json::to_vec(index).expect("index JSON encoding");
                let total = (INDEX_CONTENT_HEADER + json.len()) as u64;
                let mut raw = Vec::with_capacity(total as usize);
                raw.push(TAG_INDEX_CONTENT);
                raw.extend_from_slice(&total.to_le_bytes());
                raw.extend_from_slice(&json);
                raw
            }
            Message::IndexRequest => vec![TAG_INDEX_REQUEST],
        }
    }

    /// Parse one complete frame.
    pub fn load(raw: &[u8]) -> Result<Message, FrameError> {
        match *raw.first().ok_or(FrameError::Short(0))? {
            TAG_BLOCK_CONTENT => load_block_content(raw),
            TAG_BLOCK_REQUEST => load_block_request(raw),
            TAG_INDEX_CONTENT => load_index_content(raw),
            TAG_INDEX_REQUEST => {
                if raw.len() != 1 {
                    return Err(FrameError::LengthMismatch { declared: 1, actual: raw.len() });
                }
                Ok(Message::IndexRequest)
            }
            tag => Err(FrameError::WrongTag(tag)),
        }
    }
}

fn load_block_content(raw: &[u8]) -> Result<Message, FrameError> {
    if raw.len() < BLOCK_CONTENT_HEADER {
        return Err(FrameError::Short(raw.len()));
    }
    let declared = u64::from_le_bytes(raw[1..9].try_into().expect("8-byte slice"));
    // Reject hostile headers before trusting the declared length
    let payload = declared.saturating_sub(BLOCK_CONTENT_HEADER as u64);
    if payload > MAX_BLOCK_PAYLOAD as u64 {
        return Err(FrameError::OversizedBlock(payload as usize));
    }
    if declared != raw.len() as u64 {
        return Err(FrameError::LengthMismatch { declared, actual: raw.len() });
    }
    Ok(Message::BlockContent {
        block_n: raw[9],
        block_size: u16::from_le_bytes(raw[10..12].try_into().expect("2-byte slice")),
        file_id: Uuid::from_bytes(raw[12..28].try_into().expect("16-byte slice")),
        content: raw[BLOCK_CONTENT_HEADER..].to_vec(),
    })
}

fn load_block_request(raw: &[u8]) -> Result<Message, FrameError> {
    if raw.len() < BLOCK_REQUEST_HEADER {
        return Err(FrameError::Short(raw.len()));
    }
    let path_size = u16::from_le_bytes(raw[18..20].try_into().expect("2-byte slice"));
    let declared = (BLOCK_REQUEST_HEADER + path_size as usize) as u64;
    if declared != raw.len() as u64 {
        return Err(FrameError::LengthMismatch { declared, actual: raw.len() });
    }
    let path = String::from_utf8_lossy(&raw[BLOCK_REQUEST_HEADER..]).into_owned();
    Ok(Message::BlockRequest {
        block_n: raw[1],
        file_id: Uuid::from_bytes(raw[2..18].try_into().expect("16-byte slice")),
        path: PathBuf::from(path),
    })
}

fn load_index_content(raw: &[u8]) -> Result<Message, FrameError> {
    if raw.len() < INDEX_CONTENT_HEADER {
        return Err(FrameError::Short(raw.len()));
    }
    let declared = u64::from_le_bytes(raw[1..9].try_into().expect("8-byte slice"));
    let payload = declared.saturating_sub(INDEX_CONTENT_HEADER as u64);
    if payload > MAX_INDEX_PAYLOAD as u64 {
        return Err(FrameError::OversizedIndex(payload as usize));
    }
    if declared != raw.len() as u64 {
        return Err(FrameError::LengthMismatch { declared, actual: raw.len() });
    }
    let index = serde_json::from_slice(&raw[INDEX_CONTENT_HEADER..])?;
    Ok(Message::IndexContent(index))
}

/// Bytes the frame starting in `buf` occupies, once enough of its header
/// has arrived to tell. `Ok(None)` means more header bytes are needed.
fn frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };
    match tag {
        TAG_INDEX_REQUEST => Ok(Some(1)),
        TAG_BLOCK_REQUEST => {
            if buf.len() < BLOCK_REQUEST_HEADER {
                return Ok(None);
            }
            let path_size = u16::from_le_bytes(buf[18..20].try_into().expect("2-byte slice"));
            Ok(Some(BLOCK_REQUEST_HEADER + path_size as usize))
        }
        TAG_BLOCK_CONTENT | TAG_INDEX_CONTENT => {
            if buf.len() < SIZE_TAG + SIZE_TOTAL {
                return Ok(None);
            }
            let declared = u64::from_le_bytes(buf[1..9].try_into().expect("8-byte slice"));
            if tag == TAG_BLOCK_CONTENT {
                let payload = declared.saturating_sub(BLOCK_CONTENT_HEADER as u64);
                if payload > MAX_BLOCK_PAYLOAD as u64 {
                    return Err(FrameError::OversizedBlock(payload as usize));
                }
            } else {
                let payload = declared.saturating_sub(INDEX_CONTENT_HEADER as u64);
                if payload > MAX_INDEX_PAYLOAD as u64 {
                    return Err(FrameError::OversizedIndex(payload as usize));
                }
            }
            Ok(Some(declared as usize))
        }
        tag => Err(FrameError::WrongTag(tag)),
    }
}

/// Length-prefixed receive loop over a byte stream.
///
/// Reads until a complete frame is buffered, then parses exactly that
/// frame. Surplus bytes belong to the next message and stay buffered for
/// the following [`recv`](MessageReader::recv) call.
pub struct MessageReader<R> {
    stream: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(stream: R) -> Self {
        Self { stream, buf: Vec::new() }
    }

    /// Next complete message, or `None` on a clean end of stream.
    ///
    /// End of stream in the middle of a frame is
    /// [`RecvError::Disconnected`].
    pub async fn recv(&mut self) -> Result<Option<Message>, RecvError> {
        let mut chunk = vec![0u8; RECV_CHUNK_SIZE];
        loop {
            if let Some(target) = frame_len(&self.buf)? {
                if self.buf.len() >= target {
                    let frame: Vec<u8> = self.buf.drain(..target).collect();
                    return Ok(Some(Message::load(&frame)?));
                }
            }
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RecvError::Disconnected);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.stream
    }

    pub fn into_inner(self) -> R {
        self.stream
    }
}

/// Write one message to a stream.
pub async fn send<W: AsyncWrite + Unpin>(stream: &mut W, message: &Message) -> io::Result<()> {
    stream.write_all(&message.dump()).await?;
    stream.flush().await
}
