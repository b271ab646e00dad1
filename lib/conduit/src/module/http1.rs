//! Plain HTTP/1.1 module: translates between buffered bytes and
//! `HttpRequest`/`HttpResponse` frames in both directions.

use crate::buffer::ChunkedBuffer;
use crate::channel::Channel;
use crate::codec::http1::{HttpRequest, HttpResponse};
use crate::module::Module;
use crate::pipeline::HandlerId;
use lumen::shared::{NetworkError, NetworkResult};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Http1Mode {
    Client,
    Server,
}

pub struct Http1Module {
    mode: Http1Mode,
    incoming: Option<HandlerId>,
    outgoing: Option<HandlerId>,
}

impl Http1Module {
    pub fn new(mode: Http1Mode) -> Http1Module {
        Http1Module {
            mode,
            incoming: None,
            outgoing: None,
        }
    }
}

impl Module for Http1Module {
    fn name(&self) -> &'static str {
        "http1"
    }

    fn install(&mut self, channel: &mut Channel) -> NetworkResult<()> {
        match self.mode {
            Http1Mode::Client => {
                self.incoming = Some(channel.add_incoming_last::<ChunkedBuffer, _>(|channel, item| {
                    let mut buffer = match item.take::<ChunkedBuffer>() {
                        Some(buffer) => buffer,
                        None => return Ok(()),
                    };

                    match HttpResponse::parse(&mut buffer) {
                        Ok(response) => {
                            channel.restore_inbound(buffer);
                            item.put(response);
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
                }));

                self.outgoing = Some(channel.add_outgoing_last::<HttpRequest, _>(|channel, item| {
                    let request = match item.take::<HttpRequest>() {
                        Some(request) => request,
                        None => return Ok(()),
                    };

                    let mut buffer = ChunkedBuffer::new(channel.pool());
                    request.serialize(&mut buffer)?;
                    item.put(buffer);

                    Ok(())
                }));
            }
            Http1Mode::Server => {
                self.incoming = Some(channel.add_incoming_last::<ChunkedBuffer, _>(|channel, item| {
                    let mut buffer = match item.take::<ChunkedBuffer>() {
                        Some(buffer) => buffer,
                        None => return Ok(()),
                    };

                    match HttpRequest::parse(&mut buffer) {
                        Ok(request) => {
                            channel.restore_inbound(buffer);
                            item.put(request);
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
                }));

                self.outgoing = Some(channel.add_outgoing_last::<HttpResponse, _>(|channel, item| {
                    let response = match item.take::<HttpResponse>() {
                        Some(response) => response,
                        None => return Ok(()),
                    };

                    let mut buffer = ChunkedBuffer::new(channel.pool());
                    response.serialize(&mut buffer)?;
                    item.put(buffer);

                    Ok(())
                }));
            }
        }

        Ok(())
    }

    fn uninstall(&mut self, channel: &mut Channel) -> NetworkResult<()> {
        if let Some(id) = self.incoming.take() {
            channel.remove_incoming(id);
        }
        if let Some(id) = self.outgoing.take() {
            channel.remove_outgoing(id);
        }

        Ok(())
    }
}
