//! WebSocket framing (RFC 6455 §5). Client-originated frames carry a random
//! 32-bit mask; server frames are sent in the clear. Fragmentation is
//! reassembled above the codec, in the protocol modules.

use crate::buffer::ChunkedBuffer;
use lumen::shared::{NetworkError, NetworkResult, ProtocolError};

/// Close status codes this toolkit emits (RFC 6455 §7.4.1).
pub mod status {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const INVALID_DATA: u16 = 1003;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
}

const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u4(raw: u8) -> NetworkResult<Opcode> {
        Ok(match raw {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => return Err(NetworkError::protocol(ProtocolError::BadOpcode)),
        })
    }

    #[inline]
    pub fn is_control(self) -> bool {
        self as u8 & 0x8 != 0
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WebSocketFrame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl WebSocketFrame {
    #[inline]
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> WebSocketFrame {
        WebSocketFrame {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload,
        }
    }

    #[inline]
    pub fn text(text: &str) -> WebSocketFrame {
        Self::new(Opcode::Text, text.as_bytes().to_vec())
    }

    #[inline]
    pub fn binary(payload: Vec<u8>) -> WebSocketFrame {
        Self::new(Opcode::Binary, payload)
    }

    #[inline]
    pub fn ping(payload: Vec<u8>) -> WebSocketFrame {
        Self::new(Opcode::Ping, payload)
    }

    #[inline]
    pub fn pong(payload: Vec<u8>) -> WebSocketFrame {
        Self::new(Opcode::Pong, payload)
    }

    /// A close frame with an optional status code and UTF-8 reason.
    pub fn close(status: Option<(u16, &str)>) -> WebSocketFrame {
        let payload = match status {
            Some((code, reason)) => {
                let mut bytes = code.to_be_bytes().to_vec();
                bytes.extend_from_slice(reason.as_bytes());
                bytes
            }
            None => Vec::new(),
        };

        Self::new(Opcode::Close, payload)
    }

    /// Payload as UTF-8 text, if it is valid.
    #[inline]
    pub fn text_payload(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Status code and reason carried by a close frame.
    pub fn close_status(&self) -> NetworkResult<Option<(u16, String)>> {
        if self.payload.is_empty() {
            return Ok(None);
        }

        if self.payload.len() < 2 {
            return Err(NetworkError::protocol(ProtocolError::Malformed));
        }

        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8(self.payload[2..].to_vec())
            .map_err(|_| NetworkError::protocol(ProtocolError::Malformed))?;

        Ok(Some((code, reason)))
    }

    /// Parse one frame off the buffer, rewinding on underflow.
    pub fn parse(buffer: &mut ChunkedBuffer, max_frame_size: usize) -> NetworkResult<WebSocketFrame> {
        let mark = buffer.read_position();

        match Self::parse_inner(buffer, max_frame_size) {
            Ok(frame) => Ok(frame),
            Err(NetworkError::Incomplete) => {
                buffer.set_read_position(mark)?;
                Err(NetworkError::Incomplete)
            }
            Err(error) => Err(error),
        }
    }

    fn parse_inner(buffer: &mut ChunkedBuffer, max_frame_size: usize) -> NetworkResult<WebSocketFrame> {
        if buffer.available() < 2 {
            return Err(NetworkError::Incomplete);
        }

        let mut head = [0u8; 2];
        buffer.read_into(&mut head)?;

        let fin = head[0] & 0x80 != 0;
        let rsv1 = head[0] & 0x40 != 0;
        let rsv2 = head[0] & 0x20 != 0;
        let rsv3 = head[0] & 0x10 != 0;
        let opcode = Opcode::from_u4(head[0] & 0x0F)?;

        let masked = head[1] & 0x80 != 0;
        let length = match head[1] & 0x7F {
            126 => {
                if buffer.available() < 2 {
                    return Err(NetworkError::Incomplete);
                }
                let mut ext = [0u8; 2];
                buffer.read_into(&mut ext)?;
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                if buffer.available() < 8 {
                    return Err(NetworkError::Incomplete);
                }
                let mut ext = [0u8; 8];
                buffer.read_into(&mut ext)?;
                let length = u64::from_be_bytes(ext);
                if length > usize::max_value() as u64 {
                    return Err(NetworkError::protocol(ProtocolError::FrameSize));
                }
                length as usize
            }
            direct => direct as usize,
        };

        if length > max_frame_size {
            return Err(NetworkError::protocol(ProtocolError::FrameSize));
        }

        if opcode.is_control() && (length > MAX_CONTROL_PAYLOAD || !fin) {
            return Err(NetworkError::protocol(ProtocolError::FrameSize));
        }

        let mask = if masked {
            if buffer.available() < 4 {
                return Err(NetworkError::Incomplete);
            }
            let mut key = [0u8; 4];
            buffer.read_into(&mut key)?;
            Some(key)
        } else {
            None
        };

        if buffer.available() < length {
            return Err(NetworkError::Incomplete);
        }

        let mut payload = buffer.read(length)?;
        if let Some(key) = mask {
            mask_bytes(key, &mut payload);
        }

        Ok(WebSocketFrame {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            payload,
        })
    }

    /// Serialize the frame. `mask` must be supplied on the client side and
    /// omitted on the server side.
    pub fn serialize(&self, buffer: &mut ChunkedBuffer, mask: Option<[u8; 4]>) -> NetworkResult<()> {
        if self.opcode.is_control() && self.payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(NetworkError::protocol(ProtocolError::FrameSize));
        }

        let mut first = self.opcode as u8;
        if self.fin {
            first |= 0x80;
        }
        if self.rsv1 {
            first |= 0x40;
        }
        if self.rsv2 {
            first |= 0x20;
        }
        if self.rsv3 {
            first |= 0x10;
        }

        let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
        let mut head = vec![first];

        match self.payload.len() {
            length if length <= 125 => head.push(mask_bit | length as u8),
            length if length <= u16::max_value() as usize => {
                head.push(mask_bit | 126);
                head.extend_from_slice(&(length as u16).to_be_bytes());
            }
            length => {
                head.push(mask_bit | 127);
                head.extend_from_slice(&(length as u64).to_be_bytes());
            }
        }

        buffer.write(&head)?;

        match mask {
            Some(key) => {
                buffer.write(&key)?;
                let mut masked = self.payload.clone();
                mask_bytes(key, &mut masked);
                buffer.write(&masked)?;
            }
            None => buffer.write(&self.payload)?,
        }

        Ok(())
    }
}

/// XOR the payload with the repeating 4-octet mask key. Involutive, so the
/// same call both masks and unmasks.
pub fn mask_bytes(key: [u8; 4], data: &mut [u8]) {
    for (index, byte) in data.iter_mut().enumerate() {
        *byte ^= key[index & 3];
    }
}
