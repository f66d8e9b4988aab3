//! Frame codec.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! ```

use crate::{errors::Error, websocket::CloseCode};
use std::io::{self, BufRead};

/// Control frames carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    const fn from_bits(bits: u8) -> Option<OpCode> {
        Some(match bits {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            _ => return None,
        })
    }

    const fn bits(&self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub const fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// Which end of the connection is decoding.
///
/// Client-to-server frames must be masked and server-to-client frames must
/// not be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// One unmasked frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            fin,
            opcode,
            payload,
        }
    }

    /// A Close frame with `code` and a reason cut to fit a control frame.
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.as_u16().to_be_bytes());

        let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        payload.extend_from_slice(&reason.as_bytes()[..end]);

        Frame::new(true, OpCode::Close, payload)
    }

    /// Serializes the frame, masking the payload with `mask` when given.
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        let len = self.payload.len();
        let mut out = Vec::with_capacity(len + 14);

        out.push((self.fin as u8) << 7 | self.opcode.bits());

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        match len {
            0..=125 => out.push(mask_bit | len as u8),
            126..=0xFFFF => {
                out.push(mask_bit | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            _ => {
                out.push(mask_bit | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }

        match mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(&self.payload),
        }

        out
    }
}

/// XORs `data` with the repeating 4-byte `key`. Applying it twice restores the input.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first byte
/// of a frame. Frames whose payload exceeds `max_payload` fail with `1009`
/// before the payload is read; framing violations fail with `1002`.
pub fn read_frame<R: BufRead>(
    reader: &mut R,
    role: Role,
    max_payload: usize,
) -> Result<Option<Frame>, Error> {
    if reader.fill_buf()?.is_empty() {
        return Ok(None);
    }

    let mut head = [0u8; 2];
    reader.read_exact(&mut head)?;

    let fin = head[0] & 0x80 != 0;
    if head[0] & 0x70 != 0 {
        return Err(Error::ws(CloseCode::ProtocolError, "reserved bits set"));
    }
    let opcode = OpCode::from_bits(head[0] & 0x0F)
        .ok_or(Error::ws(CloseCode::ProtocolError, "reserved opcode"))?;

    let masked = head[1] & 0x80 != 0;
    match (role, masked) {
        (Role::Server, false) => {
            return Err(Error::ws(CloseCode::ProtocolError, "unmasked client frame"))
        }
        (Role::Client, true) => {
            return Err(Error::ws(CloseCode::ProtocolError, "masked server frame"))
        }
        _ => {}
    }

    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext)?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext)?;
            let len = u64::from_be_bytes(ext);
            if len >> 63 != 0 {
                return Err(Error::ws(CloseCode::ProtocolError, "payload length overflow"));
            }
            len
        }
        short => short as u64,
    };

    if opcode.is_control() {
        if !fin {
            return Err(Error::ws(CloseCode::ProtocolError, "fragmented control frame"));
        }
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::ws(CloseCode::ProtocolError, "control frame too long"));
        }
    } else if len > max_payload as u64 {
        return Err(Error::ws(CloseCode::TooBig, "message too big"));
    }

    let key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key)?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).map_err(truncated)?;
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame::new(fin, opcode, payload)))
}

fn truncated(err: io::Error) -> io::Error {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => io::Error::new(err.kind(), "connection closed inside a frame"),
        _ => err,
    }
}

/// Splits a Close payload into its code and reason.
///
/// An empty payload has no code. A one-byte payload, a code that must not
/// appear on the wire and a non-UTF-8 reason are errors.
pub(crate) fn parse_close(payload: &[u8]) -> Result<Option<(CloseCode, String)>, Error> {
    match payload {
        [] => Ok(None),
        [_] => Err(Error::ws(CloseCode::ProtocolError, "truncated close code")),
        [hi, lo, reason @ ..] => {
            let code = CloseCode::from_wire(u16::from_be_bytes([*hi, *lo]))
                .ok_or(Error::ws(CloseCode::ProtocolError, "invalid close code"))?;
            let reason = simdutf8::basic::from_utf8(reason)
                .map_err(|_| Error::ws(CloseCode::InvalidPayload, "close reason is not UTF-8"))?;
            Ok(Some((code, reason.to_owned())))
        }
    }
}
