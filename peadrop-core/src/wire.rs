//! Framing: JSON header + 2-byte delimiter, optionally followed by `header.size` raw bytes.

use crate::protocol::Header;

/// Terminates every header. Compact JSON never contains a raw CR or LF.
pub const FRAME_DELIMITER: &[u8; 2] = b"\r\n";
/// Undelimited bytes beyond this are a protocol violation.
pub const MAX_HEADER_LEN: usize = 10_000;
/// Largest chunk payload a peer may announce. Senders never cut chunks above this.
pub const MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024;

/// Encode a header into a frame: JSON + delimiter. Payload (if any) is appended by the caller.
pub fn encode_frame(header: &Header) -> Result<Vec<u8>, FrameEncodeError> {
    let json = serde_json::to_vec(header).map_err(FrameEncodeError::Encode)?;
    if json.len() > MAX_HEADER_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(json.len() + FRAME_DELIMITER.len());
    out.extend_from_slice(&json);
    out.extend_from_slice(FRAME_DELIMITER);
    Ok(out)
}

/// Encode a chunk frame: `{class: ok, size}` header immediately followed by `payload`.
pub fn encode_chunk(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let mut out = encode_frame(&Header::chunk(payload.len() as u64))?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a header (serde or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("header too large")]
    TooLarge,
}

/// Split one header off the front of `bytes`. Returns the header and the number of
/// bytes consumed (header + delimiter); the remainder starts at that offset.
/// Call with a partial buffer; `NeedMore` means retry after more data arrives.
pub fn split_frame(bytes: &[u8]) -> Result<(Header, usize), FrameDecodeError> {
    let Some(end) = find_delimiter(bytes) else {
        if bytes.len() > MAX_HEADER_LEN {
            return Err(FrameDecodeError::TooLarge);
        }
        return Err(FrameDecodeError::NeedMore);
    };
    let header: Header =
        serde_json::from_slice(&bytes[..end]).map_err(FrameDecodeError::Decode)?;
    Ok((header, end + FRAME_DELIMITER.len()))
}

fn find_delimiter(bytes: &[u8]) -> Option<usize> {
    let scan = bytes.len().min(MAX_HEADER_LEN + FRAME_DELIMITER.len());
    bytes[..scan]
        .windows(FRAME_DELIMITER.len())
        .position(|w| w == FRAME_DELIMITER)
}

/// Error decoding a frame (need more bytes, too large, or malformed header).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// One complete frame: header plus the payload it announced (empty for control headers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Accumulates stream deliveries and yields whole frames. A chunk payload may span
/// any number of deliveries; the header is only returned once its payload is complete.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pending: Option<(Header, usize)>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameDecodeError> {
        if self.pending.is_none() {
            match split_frame(&self.buf) {
                Ok((header, consumed)) => {
                    if header.payload_len() > MAX_PAYLOAD_LEN {
                        return Err(FrameDecodeError::TooLarge);
                    }
                    self.buf.drain(..consumed);
                    let len = usize::try_from(header.payload_len())
                        .map_err(|_| FrameDecodeError::TooLarge)?;
                    self.pending = Some((header, len));
                }
                Err(FrameDecodeError::NeedMore) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        let Some((_, len)) = &self.pending else {
            return Ok(None);
        };
        let len = *len;
        if self.buf.len() < len {
            return Ok(None);
        }
        let payload: Vec<u8> = self.buf.drain(..len).collect();
        let (header, _) = self.pending.take().ok_or(FrameDecodeError::NeedMore)?;
        Ok(Some(Frame { header, payload }))
    }
}
