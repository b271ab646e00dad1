//! HTTP/2 protocol module: connection preface, SETTINGS exchange, PING
//! acknowledgement, and HEADERS ⇄ HPACK translation. DATA and the other
//! stream-level frames are handed to the application as `Http2Frame`s; flow
//! -control accounting is left to the peer.

use crate::buffer::ChunkedBuffer;
use crate::channel::Channel;
use crate::codec::hpack::{Decoder, Encoder, Header};
use crate::codec::http2::{flags, settings_id, Http2Frame, Http2Payload, CONNECTION_PREFACE};
use crate::module::Module;
use crate::pipeline::HandlerId;
use lumen::shared::{NetworkError, NetworkResult, ProtocolError};
use std::cell::RefCell;
use std::rc::Rc;

/// A decoded header block delivered to (or sent by) the application.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Http2Headers {
    pub stream_id: u32,
    pub headers: Vec<Header>,
    pub end_stream: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Http2Mode {
    Client,
    Server,
}

pub struct Http2Module {
    mode: Http2Mode,
    incoming: Vec<HandlerId>,
    outgoing: Vec<HandlerId>,
}

impl Http2Module {
    pub fn new(mode: Http2Mode) -> Http2Module {
        Http2Module {
            mode,
            incoming: Vec::new(),
            outgoing: Vec::new(),
        }
    }
}

impl Module for Http2Module {
    fn name(&self) -> &'static str {
        "http2"
    }

    fn install(&mut self, channel: &mut Channel) -> NetworkResult<()> {
        let table_size = channel.config().header_table_size;
        let max_header_size = channel.config().max_header_size;
        let max_frame_size = channel.config().max_frame_size;

        let encoder = Rc::new(RefCell::new(Encoder::new(table_size)));
        let decoder = Rc::new(RefCell::new(Decoder::new(table_size, max_header_size)));

        // Bytes -> frames. The server side eats the connection preface first.
        let mut need_preface = self.mode == Http2Mode::Server;
        let id = channel.add_incoming_last::<ChunkedBuffer, _>(move |channel, item| {
            let mut buffer = match item.take::<ChunkedBuffer>() {
                Some(buffer) => buffer,
                None => return Ok(()),
            };

            if need_preface {
                if buffer.available() < CONNECTION_PREFACE.len() {
                    item.put(buffer);
                    return Ok(());
                }

                let preface = buffer.read(CONNECTION_PREFACE.len())?;
                if preface != CONNECTION_PREFACE {
                    channel.restore_inbound(buffer);
                    return Err(NetworkError::protocol(ProtocolError::Handshake));
                }

                need_preface = false;
            }

            match Http2Frame::parse(&mut buffer, max_frame_size) {
                Ok(frame) => {
                    channel.restore_inbound(buffer);
                    item.put(frame);
                    Ok(())
                }
                Err(NetworkError::Incomplete) => {
                    item.put(buffer);
                    Ok(())
                }
                Err(error) => {
                    channel.restore_inbound(buffer);
                    Err(error)
                }
            }
        });
        self.incoming.push(id);

        // Connection housekeeping plus HEADERS decoding.
        let peer_encoder = encoder.clone();
        let block_decoder = decoder.clone();
        let mut pending_headers: Option<(u32, bool, Vec<u8>)> = None;

        let id = channel.add_incoming_last::<Http2Frame, _>(move |channel, item| {
            let frame = match item.take::<Http2Frame>() {
                Some(frame) => frame,
                None => return Ok(()),
            };

            let stream_id = frame.stream_id;
            let frame_flags = frame.flags;
            let ack = frame.is_ack();
            let end_headers = frame.is_end_headers();
            let end_stream = frame.is_end_stream();

            match frame.payload {
                Http2Payload::Settings(settings) if !ack => {
                    for (id, value) in &settings {
                        if *id == settings_id::HEADER_TABLE_SIZE {
                            peer_encoder.borrow_mut().set_max_table_size(*value as usize);
                        }
                    }

                    channel.send(Http2Frame::new(0, flags::ACK, Http2Payload::Settings(Vec::new())))?;
                    Ok(())
                }
                Http2Payload::Settings(_) => Ok(()),
                Http2Payload::Ping(data) if !ack => {
                    channel.send(Http2Frame::new(0, flags::ACK, Http2Payload::Ping(data)))?;
                    Ok(())
                }
                Http2Payload::Headers { fragment, .. } => {
                    if end_headers {
                        let headers = decode_block(&block_decoder, &fragment)?;
                        item.put(Http2Headers {
                            stream_id,
                            headers,
                            end_stream,
                        });
                    } else {
                        pending_headers = Some((stream_id, end_stream, fragment));
                    }
                    Ok(())
                }
                Http2Payload::Continuation(tail) => {
                    let (pending_stream, pending_end, mut fragment) = match pending_headers.take() {
                        Some(pending) => pending,
                        None => return Err(NetworkError::protocol(ProtocolError::Malformed)),
                    };

                    if pending_stream != stream_id {
                        return Err(NetworkError::protocol(ProtocolError::Malformed));
                    }

                    fragment.extend_from_slice(&tail);

                    if end_headers {
                        let headers = decode_block(&block_decoder, &fragment)?;
                        item.put(Http2Headers {
                            stream_id: pending_stream,
                            headers,
                            end_stream: pending_end,
                        });
                    } else {
                        pending_headers = Some((pending_stream, pending_end, fragment));
                    }
                    Ok(())
                }
                payload => {
                    // Everything else is the application's business.
                    item.put(Http2Frame {
                        stream_id,
                        flags: frame_flags,
                        payload,
                    });
                    Ok(())
                }
            }
        });
        self.incoming.push(id);

        // Application header blocks -> HEADERS frames.
        let block_encoder = encoder.clone();
        let id = channel.add_outgoing_last::<Http2Headers, _>(move |_, item| {
            let block = match item.take::<Http2Headers>() {
                Some(block) => block,
                None => return Ok(()),
            };

            let fragment = block_encoder.borrow_mut().encode(&block.headers);

            let mut frame_flags = flags::END_HEADERS;
            if block.end_stream {
                frame_flags |= flags::END_STREAM;
            }

            item.put(Http2Frame::new(
                block.stream_id,
                frame_flags,
                Http2Payload::Headers {
                    priority: None,
                    fragment,
                },
            ));

            Ok(())
        });
        self.outgoing.push(id);

        // Frames -> bytes.
        let id = channel.add_outgoing_last::<Http2Frame, _>(move |channel, item| {
            let frame = match item.take::<Http2Frame>() {
                Some(frame) => frame,
                None => return Ok(()),
            };

            let mut buffer = ChunkedBuffer::new(channel.pool());
            frame.serialize(&mut buffer)?;
            item.put(buffer);

            Ok(())
        });
        self.outgoing.push(id);

        // Open the conversation.
        if self.mode == Http2Mode::Client {
            channel.send(CONNECTION_PREFACE.to_vec())?;
        }
        channel.send(Http2Frame::new(
            0,
            0,
            Http2Payload::Settings(vec![(settings_id::HEADER_TABLE_SIZE, table_size as u32)]),
        ))?;

        Ok(())
    }

    fn uninstall(&mut self, channel: &mut Channel) -> NetworkResult<()> {
        for id in self.incoming.drain(..) {
            channel.remove_incoming(id);
        }
        for id in self.outgoing.drain(..) {
            channel.remove_outgoing(id);
        }

        Ok(())
    }
}

fn decode_block(decoder: &Rc<RefCell<Decoder>>, fragment: &[u8]) -> NetworkResult<Vec<Header>> {
    let mut decoder = decoder.borrow_mut();
    let mut headers = Vec::new();

    decoder.decode(fragment, |header| headers.push(header))?;
    decoder.end_header_block()?;

    Ok(headers)
}
