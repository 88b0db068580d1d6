//! Framing: 2-byte header, extended big-endian lengths, XOR masking.

use std::io::{self, Read};

/// Cap on a single frame's payload. A peer claiming more in the length field
/// is rejected before any allocation happens.
pub const MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024; // 16 MiB

/// Frame opcode (4-bit header field). Only the codes the bridge exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Parse the low 4 bits of the first header byte, or `None` for reserved codes.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }
}

/// One decoded frame. Payload is already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Error decoding a frame (reserved opcode, size limit, or I/O failure
/// mid-stream).
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("reserved opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("frame too large ({0} bytes)")]
    TooLarge(u64),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Read one frame from `r`. Returns `Ok(None)` when the stream ends before or
/// inside a frame (peer closed the connection); callers treat that as "no more
/// messages", not as a failure.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<Frame>, FrameError> {
    let mut head = [0u8; 2];
    if !read_exact_or_eof(r, &mut head)? {
        return Ok(None);
    }
    let fin = head[0] & 0x80 != 0;
    let bits = head[0] & 0x0F;
    let opcode = Opcode::from_bits(bits).ok_or(FrameError::UnknownOpcode(bits))?;
    let masked = head[1] & 0x80 != 0;

    let mut len = u64::from(head[1] & 0x7F);
    if len == 126 {
        let mut ext = [0u8; 2];
        if !read_exact_or_eof(r, &mut ext)? {
            return Ok(None);
        }
        len = u64::from(u16::from_be_bytes(ext));
    } else if len == 127 {
        let mut ext = [0u8; 8];
        if !read_exact_or_eof(r, &mut ext)? {
            return Ok(None);
        }
        len = u64::from_be_bytes(ext);
    }
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        if !read_exact_or_eof(r, &mut key)? {
            return Ok(None);
        }
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    if len > 0 && !read_exact_or_eof(r, &mut payload)? {
        return Ok(None);
    }
    if let Some(key) = mask {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }
    Ok(Some(Frame {
        fin,
        opcode,
        payload,
    }))
}

/// Encode a single unmasked frame with FIN set. Server-originated frames are
/// never masked.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode.bits());
    push_length(&mut out, payload.len(), false);
    out.extend_from_slice(payload);
    out
}

/// Encode a single masked frame with FIN set. Client-originated frames must be
/// masked; the caller supplies the 4-byte key.
pub fn encode_masked_frame(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | opcode.bits());
    push_length(&mut out, payload.len(), true);
    out.extend_from_slice(&key);
    out.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4]),
    );
    out
}

fn push_length(out: &mut Vec<u8>, len: usize, masked: bool) {
    let mask_bit = if masked { 0x80 } else { 0x00 };
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len < 65536 {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, FrameError> {
    match r.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
