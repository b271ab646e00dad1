//! Gds framing: stream-scoped messages carrying a header map and a body,
//! chunked on the wire and reassembled per channel. Wire layout:
//!
//! ```text
//! varint  stream id
//! u8      frame type
//! u8      flags (bit 0 = complete)
//! varint  header count, then per header: varint name len, name,
//!         varint value len, value
//! varint  body length, body octets
//! ```
//!
//! Varints are LEB128, low bits first, at most ten octets.

use crate::buffer::{ChunkPool, ChunkedBuffer};
use hashbrown::HashMap;
use lumen::shared::{NetworkError, NetworkResult, ProtocolError};
use std::sync::Arc;

const FLAG_COMPLETE: u8 = 0x1;
const MAX_HEADER_COUNT: usize = 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GdsFrameType {
    HeadersOnly = 0,
    BodyOnly = 1,
    Full = 2,
    Ping = 3,
    Pong = 4,
    Close = 5,
}

impl GdsFrameType {
    pub fn from_u8(raw: u8) -> NetworkResult<GdsFrameType> {
        Ok(match raw {
            0 => GdsFrameType::HeadersOnly,
            1 => GdsFrameType::BodyOnly,
            2 => GdsFrameType::Full,
            3 => GdsFrameType::Ping,
            4 => GdsFrameType::Pong,
            5 => GdsFrameType::Close,
            _ => return Err(NetworkError::protocol(ProtocolError::BadOpcode)),
        })
    }

    /// Ping, pong and close frames bypass reassembly.
    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, GdsFrameType::Ping | GdsFrameType::Pong | GdsFrameType::Close)
    }
}

#[derive(Debug)]
pub struct GdsFrame {
    pub stream_id: u64,
    pub frame_type: GdsFrameType,
    pub is_complete: bool,
    pub headers: HashMap<String, Vec<u8>>,
    pub body: ChunkedBuffer,
}

impl GdsFrame {
    pub fn new(pool: &Arc<ChunkPool>, stream_id: u64, frame_type: GdsFrameType) -> GdsFrame {
        GdsFrame {
            stream_id,
            frame_type,
            is_complete: true,
            headers: HashMap::new(),
            body: ChunkedBuffer::new(pool),
        }
    }

    pub fn with_header(mut self, name: &str, value: &[u8]) -> GdsFrame {
        self.headers.insert(name.to_string(), value.to_vec());
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> NetworkResult<GdsFrame> {
        self.body.write(body)?;
        Ok(self)
    }

    /// Parse one frame off the buffer, rewinding on underflow.
    pub fn parse(
        buffer: &mut ChunkedBuffer,
        pool: &Arc<ChunkPool>,
        max_frame_size: usize,
    ) -> NetworkResult<GdsFrame> {
        let mark = buffer.read_position();

        match Self::parse_inner(buffer, pool, max_frame_size) {
            Ok(frame) => Ok(frame),
            Err(NetworkError::Incomplete) => {
                buffer.set_read_position(mark)?;
                Err(NetworkError::Incomplete)
            }
            Err(error) => Err(error),
        }
    }

    fn parse_inner(
        buffer: &mut ChunkedBuffer,
        pool: &Arc<ChunkPool>,
        max_frame_size: usize,
    ) -> NetworkResult<GdsFrame> {
        let stream_id = read_varint(buffer)?;

        let mut head = [0u8; 2];
        if buffer.available() < head.len() {
            return Err(NetworkError::Incomplete);
        }
        buffer.read_into(&mut head)?;

        let frame_type = GdsFrameType::from_u8(head[0])?;
        let is_complete = head[1] & FLAG_COMPLETE != 0;

        let header_count = read_varint(buffer)? as usize;
        if header_count > MAX_HEADER_COUNT {
            return Err(NetworkError::protocol(ProtocolError::Malformed));
        }

        let mut headers = HashMap::with_capacity(header_count);
        for _ in 0..header_count {
            let name = read_chunk(buffer, max_frame_size)?;
            let name = String::from_utf8(name)
                .map_err(|_| NetworkError::protocol(ProtocolError::Malformed))?;
            let value = read_chunk(buffer, max_frame_size)?;
            headers.insert(name, value);
        }

        let body_length = read_varint(buffer)? as usize;
        if body_length > max_frame_size {
            return Err(NetworkError::protocol(ProtocolError::FrameSize));
        }
        if buffer.available() < body_length {
            return Err(NetworkError::Incomplete);
        }

        let mut body = ChunkedBuffer::new(pool);
        body.write(&buffer.read(body_length)?)?;

        Ok(GdsFrame {
            stream_id,
            frame_type,
            is_complete,
            headers,
            body,
        })
    }

    /// Serialize the frame, draining its body.
    pub fn serialize(&mut self, buffer: &mut ChunkedBuffer) -> NetworkResult<()> {
        write_varint(buffer, self.stream_id)?;

        let flags = if self.is_complete { FLAG_COMPLETE } else { 0 };
        buffer.write(&[self.frame_type as u8, flags])?;

        write_varint(buffer, self.headers.len() as u64)?;
        for (name, value) in &self.headers {
            write_varint(buffer, name.len() as u64)?;
            buffer.write(name.as_bytes())?;
            write_varint(buffer, value.len() as u64)?;
            buffer.write(value)?;
        }

        write_varint(buffer, self.body.available() as u64)?;
        self.body.drain_to(buffer)?;

        Ok(())
    }

    /// Fold `update` into this accumulating frame: headers unite with the
    /// newer frame winning collisions, bodies concatenate, and a
    /// headers-only plus body-only pairing promotes to a full frame.
    pub fn merge(&mut self, mut update: GdsFrame) -> NetworkResult<()> {
        for (name, value) in update.headers.drain() {
            self.headers.insert(name, value);
        }

        update.body.drain_to(&mut self.body)?;

        if self.frame_type != update.frame_type {
            self.frame_type = GdsFrameType::Full;
        }

        self.is_complete = update.is_complete;

        Ok(())
    }
}

fn read_varint(buffer: &mut ChunkedBuffer) -> NetworkResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;

    loop {
        let mut octet = [0u8; 1];
        if buffer.available() < 1 {
            return Err(NetworkError::Incomplete);
        }
        buffer.read_into(&mut octet)?;

        if shift >= 64 {
            return Err(NetworkError::protocol(ProtocolError::Malformed));
        }

        value |= u64::from(octet[0] & 0x7F) << shift;
        shift += 7;

        if octet[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn write_varint(buffer: &mut ChunkedBuffer, mut value: u64) -> NetworkResult<()> {
    loop {
        let octet = (value & 0x7F) as u8;
        value >>= 7;

        if value == 0 {
            return buffer.write(&[octet]);
        }

        buffer.write(&[octet | 0x80])?;
    }
}

fn read_chunk(buffer: &mut ChunkedBuffer, max: usize) -> NetworkResult<Vec<u8>> {
    let length = read_varint(buffer)? as usize;

    if length > max {
        return Err(NetworkError::protocol(ProtocolError::FrameSize));
    }
    if buffer.available() < length {
        return Err(NetworkError::Incomplete);
    }

    buffer.read(length)
}
