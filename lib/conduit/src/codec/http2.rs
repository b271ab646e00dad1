//! HTTP/2 binary framing (RFC 7540 §4, §6). Parses the 9-octet frame header
//! plus a typed payload out of a `ChunkedBuffer`, rewinding and signalling
//! `Incomplete` while the frame is only partially buffered.

use crate::buffer::ChunkedBuffer;
use byteorder::{BigEndian, WriteBytesExt};
use lumen::shared::{NetworkError, NetworkResult, ProtocolError};

/// Client connection preface sent before the first frame.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub mod frame_type {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

pub mod flags {
    pub const ACK: u8 = 0x1;
    pub const END_STREAM: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

pub mod settings_id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

const HEADER_SIZE: usize = 9;
const MAX_LENGTH: usize = (1 << 24) - 1;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Http2Payload {
    Data(Vec<u8>),
    Headers {
        priority: Option<Priority>,
        fragment: Vec<u8>,
    },
    Priority(Priority),
    RstStream(u32),
    Settings(Vec<(u16, u32)>),
    PushPromise {
        promised_stream_id: u32,
        fragment: Vec<u8>,
    },
    Ping([u8; 8]),
    GoAway {
        last_stream_id: u32,
        error_code: u32,
        debug: Vec<u8>,
    },
    WindowUpdate(u32),
    Continuation(Vec<u8>),
    /// Frame types this endpoint does not know are carried opaquely.
    Unknown { frame_type: u8, payload: Vec<u8> },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Http2Frame {
    pub stream_id: u32,
    pub flags: u8,
    pub payload: Http2Payload,
}

impl Http2Frame {
    #[inline]
    pub fn new(stream_id: u32, flags: u8, payload: Http2Payload) -> Http2Frame {
        Http2Frame {
            stream_id,
            flags,
            payload,
        }
    }

    #[inline]
    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    #[inline]
    pub fn is_end_headers(&self) -> bool {
        self.flags & flags::END_HEADERS != 0
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    pub fn frame_type(&self) -> u8 {
        match &self.payload {
            Http2Payload::Data(_) => frame_type::DATA,
            Http2Payload::Headers { .. } => frame_type::HEADERS,
            Http2Payload::Priority(_) => frame_type::PRIORITY,
            Http2Payload::RstStream(_) => frame_type::RST_STREAM,
            Http2Payload::Settings(_) => frame_type::SETTINGS,
            Http2Payload::PushPromise { .. } => frame_type::PUSH_PROMISE,
            Http2Payload::Ping(_) => frame_type::PING,
            Http2Payload::GoAway { .. } => frame_type::GOAWAY,
            Http2Payload::WindowUpdate(_) => frame_type::WINDOW_UPDATE,
            Http2Payload::Continuation(_) => frame_type::CONTINUATION,
            Http2Payload::Unknown { frame_type, .. } => *frame_type,
        }
    }

    /// Parse one frame off the buffer. While fewer than `9 + length` octets
    /// are buffered the read cursor is rewound and `Incomplete` returned.
    pub fn parse(buffer: &mut ChunkedBuffer, max_frame_size: usize) -> NetworkResult<Http2Frame> {
        let mark = buffer.read_position();

        if buffer.available() < HEADER_SIZE {
            return Err(NetworkError::Incomplete);
        }

        let mut header = [0u8; HEADER_SIZE];
        buffer.read_into(&mut header)?;

        let length = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
        let frame_type = header[3];
        let frame_flags = header[4];
        let stream_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7FFF_FFFF;

        if length > max_frame_size {
            return Err(NetworkError::protocol(ProtocolError::FrameSize));
        }

        if buffer.available() < length {
            buffer.set_read_position(mark)?;
            return Err(NetworkError::Incomplete);
        }

        let raw = buffer.read(length)?;
        let (payload, flags) = Self::parse_payload(frame_type, frame_flags, raw)?;

        Ok(Http2Frame {
            stream_id,
            flags,
            payload,
        })
    }

    fn parse_payload(
        frame_type: u8,
        frame_flags: u8,
        raw: Vec<u8>,
    ) -> NetworkResult<(Http2Payload, u8)> {
        let mut flags = frame_flags;

        let payload = match frame_type {
            frame_type::DATA => {
                let data = strip_padding(frame_flags, raw)?;
                flags &= !flags::PADDED;
                Http2Payload::Data(data)
            }
            frame_type::HEADERS => {
                let mut fragment = strip_padding(frame_flags, raw)?;
                flags &= !flags::PADDED;

                let priority = if frame_flags & flags::PRIORITY != 0 {
                    if fragment.len() < 5 {
                        return Err(NetworkError::protocol(ProtocolError::FrameSize));
                    }
                    let priority = read_priority(&fragment[..5]);
                    fragment.drain(..5);
                    flags &= !flags::PRIORITY;
                    Some(priority)
                } else {
                    None
                };

                Http2Payload::Headers { priority, fragment }
            }
            frame_type::PRIORITY => {
                if raw.len() != 5 {
                    return Err(NetworkError::protocol(ProtocolError::FrameSize));
                }
                Http2Payload::Priority(read_priority(&raw))
            }
            frame_type::RST_STREAM => {
                if raw.len() != 4 {
                    return Err(NetworkError::protocol(ProtocolError::FrameSize));
                }
                Http2Payload::RstStream(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
            }
            frame_type::SETTINGS => {
                if raw.len() % 6 != 0 {
                    return Err(NetworkError::protocol(ProtocolError::FrameSize));
                }

                let settings = raw
                    .chunks(6)
                    .map(|pair| {
                        (
                            u16::from_be_bytes([pair[0], pair[1]]),
                            u32::from_be_bytes([pair[2], pair[3], pair[4], pair[5]]),
                        )
                    })
                    .collect();
                Http2Payload::Settings(settings)
            }
            frame_type::PUSH_PROMISE => {
                let mut fragment = strip_padding(frame_flags, raw)?;
                flags &= !flags::PADDED;

                if fragment.len() < 4 {
                    return Err(NetworkError::protocol(ProtocolError::FrameSize));
                }
                let promised_stream_id =
                    u32::from_be_bytes([fragment[0], fragment[1], fragment[2], fragment[3]])
                        & 0x7FFF_FFFF;
                fragment.drain(..4);

                Http2Payload::PushPromise {
                    promised_stream_id,
                    fragment,
                }
            }
            frame_type::PING => {
                if raw.len() != 8 {
                    return Err(NetworkError::protocol(ProtocolError::FrameSize));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&raw);
                Http2Payload::Ping(data)
            }
            frame_type::GOAWAY => {
                if raw.len() < 8 {
                    return Err(NetworkError::protocol(ProtocolError::FrameSize));
                }
                Http2Payload::GoAway {
                    last_stream_id: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
                        & 0x7FFF_FFFF,
                    error_code: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
                    debug: raw[8..].to_vec(),
                }
            }
            frame_type::WINDOW_UPDATE => {
                if raw.len() != 4 {
                    return Err(NetworkError::protocol(ProtocolError::FrameSize));
                }
                Http2Payload::WindowUpdate(
                    u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) & 0x7FFF_FFFF,
                )
            }
            frame_type::CONTINUATION => Http2Payload::Continuation(raw),
            _ => Http2Payload::Unknown {
                frame_type,
                payload: raw,
            },
        };

        Ok((payload, flags))
    }

    /// Serialize the frame into the buffer. The inverse of `parse` for every
    /// well-formed frame.
    pub fn serialize(&self, buffer: &mut ChunkedBuffer) -> NetworkResult<()> {
        let mut body = Vec::new();
        let mut flags = self.flags;

        match &self.payload {
            Http2Payload::Data(data) => body.extend_from_slice(data),
            Http2Payload::Headers { priority, fragment } => {
                if let Some(priority) = priority {
                    flags |= flags::PRIORITY;
                    write_priority(&mut body, priority);
                }
                body.extend_from_slice(fragment);
            }
            Http2Payload::Priority(priority) => write_priority(&mut body, priority),
            Http2Payload::RstStream(error_code) => {
                body.extend_from_slice(&error_code.to_be_bytes())
            }
            Http2Payload::Settings(settings) => {
                for (id, value) in settings {
                    body.extend_from_slice(&id.to_be_bytes());
                    body.extend_from_slice(&value.to_be_bytes());
                }
            }
            Http2Payload::PushPromise {
                promised_stream_id,
                fragment,
            } => {
                body.extend_from_slice(&(promised_stream_id & 0x7FFF_FFFF).to_be_bytes());
                body.extend_from_slice(fragment);
            }
            Http2Payload::Ping(data) => body.extend_from_slice(data),
            Http2Payload::GoAway {
                last_stream_id,
                error_code,
                debug,
            } => {
                body.extend_from_slice(&(last_stream_id & 0x7FFF_FFFF).to_be_bytes());
                body.extend_from_slice(&error_code.to_be_bytes());
                body.extend_from_slice(debug);
            }
            Http2Payload::WindowUpdate(increment) => {
                body.extend_from_slice(&(increment & 0x7FFF_FFFF).to_be_bytes())
            }
            Http2Payload::Continuation(fragment) => body.extend_from_slice(fragment),
            Http2Payload::Unknown { payload, .. } => body.extend_from_slice(payload),
        }

        if body.len() > MAX_LENGTH {
            return Err(NetworkError::protocol(ProtocolError::FrameSize));
        }

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.push((body.len() >> 16) as u8);
        header.push((body.len() >> 8) as u8);
        header.push(body.len() as u8);
        header.push(self.frame_type());
        header.push(flags);
        header
            .write_u32::<BigEndian>(self.stream_id & 0x7FFF_FFFF)
            .map_err(NetworkError::from)?;

        buffer.write(&header)?;
        buffer.write(&body)?;

        Ok(())
    }
}

fn read_priority(raw: &[u8]) -> Priority {
    let dependency = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);

    Priority {
        exclusive: dependency & 0x8000_0000 != 0,
        dependency: dependency & 0x7FFF_FFFF,
        weight: raw[4],
    }
}

fn write_priority(body: &mut Vec<u8>, priority: &Priority) {
    let mut dependency = priority.dependency & 0x7FFF_FFFF;
    if priority.exclusive {
        dependency |= 0x8000_0000;
    }
    body.extend_from_slice(&dependency.to_be_bytes());
    body.push(priority.weight);
}

fn strip_padding(frame_flags: u8, mut raw: Vec<u8>) -> NetworkResult<Vec<u8>> {
    if frame_flags & flags::PADDED == 0 {
        return Ok(raw);
    }

    if raw.is_empty() {
        return Err(NetworkError::protocol(ProtocolError::FrameSize));
    }

    let pad_length = raw[0] as usize;
    if pad_length >= raw.len() {
        return Err(NetworkError::protocol(ProtocolError::FrameSize));
    }

    raw.truncate(raw.len() - pad_length);
    raw.remove(0);

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChunkPool;
    use std::sync::Arc;

    const MAX_FRAME: usize = 1 << 20;

    fn buffer() -> ChunkedBuffer {
        ChunkedBuffer::new(&Arc::new(ChunkPool::new(64)))
    }

    fn roundtrip(frame: Http2Frame) {
        let mut wire = buffer();
        frame.serialize(&mut wire).unwrap();

        let parsed = Http2Frame::parse(&mut wire, MAX_FRAME).unwrap();

        assert_eq!(parsed, frame);
        assert_eq!(wire.available(), 0);
    }

    #[test]
    fn test_roundtrip_all_types() {
        roundtrip(Http2Frame::new(1, flags::END_STREAM, Http2Payload::Data(vec![1, 2, 3])));
        roundtrip(Http2Frame::new(
            3,
            flags::END_HEADERS,
            Http2Payload::Headers {
                priority: None,
                fragment: vec![0x82, 0x86],
            },
        ));
        roundtrip(Http2Frame::new(
            3,
            0,
            Http2Payload::Headers {
                priority: Some(Priority {
                    exclusive: true,
                    dependency: 11,
                    weight: 200,
                }),
                fragment: vec![0x82],
            },
        ));
        roundtrip(Http2Frame::new(
            5,
            0,
            Http2Payload::Priority(Priority {
                exclusive: false,
                dependency: 3,
                weight: 16,
            }),
        ));
        roundtrip(Http2Frame::new(5, 0, Http2Payload::RstStream(0x8)));
        roundtrip(Http2Frame::new(
            0,
            0,
            Http2Payload::Settings(vec![
                (settings_id::HEADER_TABLE_SIZE, 4096),
                (settings_id::INITIAL_WINDOW_SIZE, 65535),
            ]),
        ));
        roundtrip(Http2Frame::new(
            7,
            flags::END_HEADERS,
            Http2Payload::PushPromise {
                promised_stream_id: 8,
                fragment: vec![0x82],
            },
        ));
        roundtrip(Http2Frame::new(0, flags::ACK, Http2Payload::Ping(*b"pingpong")));
        roundtrip(Http2Frame::new(
            0,
            0,
            Http2Payload::GoAway {
                last_stream_id: 9,
                error_code: 2,
                debug: b"bye".to_vec(),
            },
        ));
        roundtrip(Http2Frame::new(0, 0, Http2Payload::WindowUpdate(0x1000)));
        roundtrip(Http2Frame::new(3, 0, Http2Payload::Continuation(vec![0x84])));
        roundtrip(Http2Frame::new(
            0,
            0x7,
            Http2Payload::Unknown {
                frame_type: 0xAB,
                payload: vec![9, 9, 9],
            },
        ));
    }

    #[test]
    fn test_partial_header_rewinds() {
        let mut wire = buffer();
        let frame = Http2Frame::new(1, 0, Http2Payload::Ping(*b"12345678"));
        frame.serialize(&mut wire).unwrap();

        // Feed only the first 6 octets of the 9-octet frame header.
        let mut partial = buffer();
        partial.write(&wire.read(6).unwrap()).unwrap();

        let mark = partial.read_position();
        assert_eq!(
            Http2Frame::parse(&mut partial, MAX_FRAME).unwrap_err(),
            NetworkError::Incomplete
        );
        assert_eq!(partial.read_position(), mark);

        // The remaining header octets plus the payload complete the frame.
        partial.write(&wire.read(usize::max_value()).unwrap()).unwrap();

        let parsed = Http2Frame::parse(&mut partial, MAX_FRAME).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_partial_payload_rewinds() {
        let mut wire = buffer();
        Http2Frame::new(1, 0, Http2Payload::Data(vec![7; 32]))
            .serialize(&mut wire)
            .unwrap();

        let mut partial = buffer();
        partial.write(&wire.read(9 + 16).unwrap()).unwrap();

        let mark = partial.read_position();
        assert_eq!(
            Http2Frame::parse(&mut partial, MAX_FRAME).unwrap_err(),
            NetworkError::Incomplete
        );
        assert_eq!(partial.read_position(), mark);
    }

    #[test]
    fn test_settings_length_must_be_multiple_of_six() {
        let mut wire = buffer();
        wire.write(&[0, 0, 5, frame_type::SETTINGS, 0, 0, 0, 0, 0]).unwrap();
        wire.write(&[0; 5]).unwrap();

        assert_eq!(
            Http2Frame::parse(&mut wire, MAX_FRAME).unwrap_err(),
            NetworkError::protocol(ProtocolError::FrameSize)
        );
    }

    #[test]
    fn test_ping_length_must_be_eight() {
        let mut wire = buffer();
        wire.write(&[0, 0, 4, frame_type::PING, 0, 0, 0, 0, 0]).unwrap();
        wire.write(&[0; 4]).unwrap();

        assert_eq!(
            Http2Frame::parse(&mut wire, MAX_FRAME).unwrap_err(),
            NetworkError::protocol(ProtocolError::FrameSize)
        );
    }

    #[test]
    fn test_padded_data_is_stripped() {
        let mut wire = buffer();
        // length 8: pad length octet + 4 data octets + 3 pad octets.
        wire.write(&[0, 0, 8, frame_type::DATA, flags::PADDED, 0, 0, 0, 1]).unwrap();
        wire.write(&[3, 10, 11, 12, 13, 0, 0, 0]).unwrap();

        let frame = Http2Frame::parse(&mut wire, MAX_FRAME).unwrap();

        assert_eq!(frame.payload, Http2Payload::Data(vec![10, 11, 12, 13]));
        assert_eq!(frame.flags & flags::PADDED, 0);
    }

    #[test]
    fn test_padding_longer_than_payload_fails() {
        let mut wire = buffer();
        wire.write(&[0, 0, 3, frame_type::DATA, flags::PADDED, 0, 0, 0, 1]).unwrap();
        wire.write(&[7, 1, 2]).unwrap();

        assert_eq!(
            Http2Frame::parse(&mut wire, MAX_FRAME).unwrap_err(),
            NetworkError::protocol(ProtocolError::FrameSize)
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut wire = buffer();
        wire.write(&[0xFF, 0xFF, 0xFF, frame_type::DATA, 0, 0, 0, 0, 1]).unwrap();

        assert_eq!(
            Http2Frame::parse(&mut wire, 1 << 14).unwrap_err(),
            NetworkError::protocol(ProtocolError::FrameSize)
        );
    }

    #[test]
    fn test_reserved_stream_bit_cleared() {
        let mut wire = buffer();
        wire.write(&[0, 0, 0, frame_type::DATA, 0, 0x80, 0, 0, 1]).unwrap();

        let frame = Http2Frame::parse(&mut wire, MAX_FRAME).unwrap();

        assert_eq!(frame.stream_id, 1);
    }
}
