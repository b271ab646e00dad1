//! WebSocket protocol modules (RFC 6455). On install the client sends the
//! upgrade request and parks a handshake handler on the incoming chain; once
//! the peer's `101` arrives the handler swaps itself out for the frame codec
//! handlers, mid-dispatch. The server module mirrors the exchange.

use crate::buffer::ChunkedBuffer;
use crate::channel::Channel;
use crate::codec::http1::{HttpRequest, HttpResponse};
use crate::codec::websocket::{Opcode, WebSocketFrame};
use crate::module::Module;
use crate::pipeline::HandlerId;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lumen::shared::{NetworkError, NetworkResult, ProtocolError};
use rand::Rng;
use sha1::{Digest, Sha1};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` digest for a handshake key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());

    BASE64.encode(hasher.finalize())
}

#[derive(Default)]
struct Installed {
    incoming: Vec<HandlerId>,
    outgoing: Vec<HandlerId>,
}

impl Installed {
    fn remove_all(&mut self, channel: &mut Channel) {
        for id in self.incoming.drain(..) {
            channel.remove_incoming(id);
        }
        for id in self.outgoing.drain(..) {
            channel.remove_outgoing(id);
        }
    }
}

/// Frame codec handlers shared by both sides once the upgrade completes.
/// `mask_frames` is set on the client, which must mask what it sends.
fn install_frame_handlers(channel: &mut Channel, installed: &Rc<RefCell<Installed>>, mask_frames: bool) {
    let mut pending: Option<(Opcode, Vec<u8>)> = None;

    // The handshake already ran with application handlers in place, so the
    // decoder goes to the wire end of the chain, ahead of them.
    let id = channel.add_incoming_first::<ChunkedBuffer, _>(move |channel, item| {
        let max_frame_size = channel.config().max_frame_size;

        let mut buffer = match item.take::<ChunkedBuffer>() {
            Some(buffer) => buffer,
            None => return Ok(()),
        };

        let frame = match WebSocketFrame::parse(&mut buffer, max_frame_size) {
            Ok(frame) => {
                channel.restore_inbound(buffer);
                frame
            }
            Err(NetworkError::Incomplete) => {
                item.put(buffer);
                return Ok(());
            }
            Err(error) => {
                channel.restore_inbound(buffer);
                return Err(error);
            }
        };

        // Control frames slip past fragmentation entirely.
        if frame.opcode.is_control() {
            item.put(frame);
            return Ok(());
        }

        if frame.opcode == Opcode::Continuation {
            let (opcode, mut payload) = match pending.take() {
                Some(fragmented) => fragmented,
                None => return Err(NetworkError::protocol(ProtocolError::BadOpcode)),
            };

            payload.extend_from_slice(&frame.payload);

            if frame.fin {
                let mut complete = WebSocketFrame::new(opcode, payload);
                complete.rsv1 = frame.rsv1;
                item.put(complete);
            } else {
                pending = Some((opcode, payload));
            }

            return Ok(());
        }

        if pending.is_some() {
            // A new data message may not start while one is in flight.
            return Err(NetworkError::protocol(ProtocolError::BadOpcode));
        }

        if frame.fin {
            item.put(frame);
        } else {
            pending = Some((frame.opcode, frame.payload));
        }

        Ok(())
    });
    installed.borrow_mut().incoming.push(id);

    let id = channel.add_outgoing_last::<WebSocketFrame, _>(move |channel, item| {
        let frame = match item.take::<WebSocketFrame>() {
            Some(frame) => frame,
            None => return Ok(()),
        };

        let mask = if mask_frames {
            Some(rand::thread_rng().gen::<[u8; 4]>())
        } else {
            None
        };

        let mut buffer = ChunkedBuffer::new(channel.pool());
        frame.serialize(&mut buffer, mask)?;
        item.put(buffer);

        Ok(())
    });
    installed.borrow_mut().outgoing.push(id);
}

pub struct WebSocketClientModule {
    host: String,
    path: String,
    installed: Rc<RefCell<Installed>>,
}

impl WebSocketClientModule {
    pub fn new(host: &str, path: &str) -> WebSocketClientModule {
        WebSocketClientModule {
            host: host.to_string(),
            path: path.to_string(),
            installed: Rc::new(RefCell::new(Installed::default())),
        }
    }
}

impl Module for WebSocketClientModule {
    fn name(&self) -> &'static str {
        "websocket-client"
    }

    fn install(&mut self, channel: &mut Channel) -> NetworkResult<()> {
        let nonce: [u8; 16] = rand::thread_rng().gen();
        let key = BASE64.encode(nonce);
        let expected = accept_key(&key);

        let request = HttpRequest::new("GET", &self.path)
            .with_header("Host", &self.host)
            .with_header("Upgrade", "websocket")
            .with_header("Connection", "Upgrade")
            .with_header("Sec-WebSocket-Key", &key)
            .with_header("Sec-WebSocket-Version", "13");

        let mut upgrade = ChunkedBuffer::new(channel.pool());
        request.serialize(&mut upgrade)?;
        channel.send(upgrade)?;

        let installed = self.installed.clone();
        let own_id: Rc<Cell<Option<HandlerId>>> = Rc::new(Cell::new(None));
        let own_slot = own_id.clone();

        let id = channel.add_incoming_last::<ChunkedBuffer, _>(move |channel, item| {
            let mut buffer = match item.take::<ChunkedBuffer>() {
                Some(buffer) => buffer,
                None => return Ok(()),
            };

            let response = match HttpResponse::parse(&mut buffer) {
                Ok(response) => {
                    channel.restore_inbound(buffer);
                    response
                }
                Err(NetworkError::Incomplete) => {
                    item.put(buffer);
                    return Ok(());
                }
                Err(error) => {
                    channel.restore_inbound(buffer);
                    return Err(error);
                }
            };

            if response.status != 101
                || response.header("sec-websocket-accept") != Some(expected.as_str())
            {
                return Err(NetworkError::protocol(ProtocolError::Handshake));
            }

            // Upgrade done: this handler retires and the frame codec takes
            // its place, within the same pass.
            if let Some(id) = own_slot.get() {
                channel.remove_incoming(id);
                installed.borrow_mut().incoming.retain(|handler| *handler != id);
            }

            install_frame_handlers(channel, &installed, true);
            channel.notify_handshake_complete();

            Ok(())
        });

        own_id.set(Some(id));
        self.installed.borrow_mut().incoming.push(id);

        Ok(())
    }

    fn uninstall(&mut self, channel: &mut Channel) -> NetworkResult<()> {
        self.installed.borrow_mut().remove_all(channel);
        Ok(())
    }
}

pub struct WebSocketServerModule {
    installed: Rc<RefCell<Installed>>,
}

impl WebSocketServerModule {
    pub fn new() -> WebSocketServerModule {
        WebSocketServerModule {
            installed: Rc::new(RefCell::new(Installed::default())),
        }
    }
}

impl Module for WebSocketServerModule {
    fn name(&self) -> &'static str {
        "websocket-server"
    }

    fn install(&mut self, channel: &mut Channel) -> NetworkResult<()> {
        let installed = self.installed.clone();
        let own_id: Rc<Cell<Option<HandlerId>>> = Rc::new(Cell::new(None));
        let own_slot = own_id.clone();

        let id = channel.add_incoming_last::<ChunkedBuffer, _>(move |channel, item| {
            let mut buffer = match item.take::<ChunkedBuffer>() {
                Some(buffer) => buffer,
                None => return Ok(()),
            };

            let request = match HttpRequest::parse(&mut buffer) {
                Ok(request) => {
                    channel.restore_inbound(buffer);
                    request
                }
                Err(NetworkError::Incomplete) => {
                    item.put(buffer);
                    return Ok(());
                }
                Err(error) => {
                    channel.restore_inbound(buffer);
                    return Err(error);
                }
            };

            let upgrade_requested = request
                .header("upgrade")
                .map_or(false, |value| value.eq_ignore_ascii_case("websocket"));

            let key = match (upgrade_requested, request.header("sec-websocket-key")) {
                (true, Some(key)) => key.to_string(),
                _ => return Err(NetworkError::protocol(ProtocolError::Handshake)),
            };

            let response = HttpResponse::new(101, "Switching Protocols")
                .with_header("Upgrade", "websocket")
                .with_header("Connection", "Upgrade")
                .with_header("Sec-WebSocket-Accept", &accept_key(&key));

            let mut accepted = ChunkedBuffer::new(channel.pool());
            response.serialize(&mut accepted)?;
            channel.send(accepted)?;

            if let Some(id) = own_slot.get() {
                channel.remove_incoming(id);
                installed.borrow_mut().incoming.retain(|handler| *handler != id);
            }

            install_frame_handlers(channel, &installed, false);
            channel.notify_handshake_complete();

            Ok(())
        });

        own_id.set(Some(id));
        self.installed.borrow_mut().incoming.push(id);

        Ok(())
    }

    fn uninstall(&mut self, channel: &mut Channel) -> NetworkResult<()> {
        self.installed.borrow_mut().remove_all(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChunkPool;
    use crate::channel::ChannelState;
    use crate::config::ChannelConfig;
    use mio::net::TcpStream;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Duration;

    const TICK: Option<Duration> = Some(Duration::from_millis(20));

    #[test]
    fn test_accept_key_rfc_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    struct WsHarness {
        client: Channel,
        server: Channel,
    }

    impl WsHarness {
        fn connect() -> WsHarness {
            let pool = Arc::new(ChunkPool::new(1024));
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let address = listener.local_addr().unwrap();

            let mut client = Channel::new(&pool, ChannelConfig::default(), None);
            client.add_module(WebSocketClientModule::new("localhost", "/chat"));
            client.connect(&address.to_string()).unwrap();

            let (socket, _) = listener.accept().unwrap();
            socket.set_nonblocking(true).unwrap();
            let mut server = Channel::accept(
                &pool,
                ChannelConfig::default(),
                TcpStream::from_std(socket),
                None,
            );
            server.add_module(WebSocketServerModule::new());

            WsHarness { client, server }
        }

        fn pump<F: Fn(&WsHarness) -> bool>(&mut self, done: F) {
            for _ in 0..300 {
                if done(self) {
                    return;
                }
                if self.client.state() == ChannelState::Connected {
                    drop(self.client.service(TICK));
                }
                if self.server.state() == ChannelState::Connected {
                    drop(self.server.drive(true, true));
                }
            }

            panic!("Condition not reached in time");
        }
    }

    #[test]
    fn test_handshake_and_text_echo() {
        let mut harness = WsHarness::connect();

        // Server application: echo every data frame.
        harness.server.add_incoming_last::<WebSocketFrame, _>(|channel, item| {
            if let Some(frame) = item.take::<WebSocketFrame>() {
                channel.send(frame)?;
            }
            Ok(())
        });

        let received: Rc<RefCell<Option<WebSocketFrame>>> = Rc::new(RefCell::new(None));
        let sink = received.clone();
        harness.client.add_incoming_last::<WebSocketFrame, _>(move |_, item| {
            *sink.borrow_mut() = item.take::<WebSocketFrame>();
            Ok(())
        });

        let ready = Rc::new(Cell::new(false));
        let flag = ready.clone();
        harness.client.on_handshake_complete(move |_| flag.set(true));

        let probe = ready.clone();
        harness.pump(move |_| probe.get());

        harness.client.send(WebSocketFrame::text("some test")).unwrap();

        let probe = received.clone();
        harness.pump(move |_| probe.borrow().is_some());

        let frame = received.borrow_mut().take().unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.text_payload(), Some("some test"));
    }

    #[test]
    fn test_fragmented_message_reassembles() {
        let mut harness = WsHarness::connect();

        let received: Rc<RefCell<Option<WebSocketFrame>>> = Rc::new(RefCell::new(None));
        let sink = received.clone();
        harness.server.add_incoming_last::<WebSocketFrame, _>(move |_, item| {
            *sink.borrow_mut() = item.take::<WebSocketFrame>();
            Ok(())
        });

        let ready = Rc::new(Cell::new(false));
        let flag = ready.clone();
        harness.client.on_handshake_complete(move |_| flag.set(true));
        let probe = ready.clone();
        harness.pump(move |_| probe.get());

        // Text message split over three frames.
        let mut first = WebSocketFrame::text("frag");
        first.fin = false;
        harness.client.send(first).unwrap();

        let mut middle = WebSocketFrame::new(Opcode::Continuation, b"ment".to_vec());
        middle.fin = false;
        harness.client.send(middle).unwrap();

        let last = WebSocketFrame::new(Opcode::Continuation, b"ed".to_vec());
        harness.client.send(last).unwrap();

        let probe = received.clone();
        harness.pump(move |_| probe.borrow().is_some());

        let frame = received.borrow_mut().take().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.text_payload(), Some("fragmented"));
    }

    #[test]
    fn test_ping_passes_through_fragmentation() {
        let mut harness = WsHarness::connect();

        let received: Rc<RefCell<Vec<WebSocketFrame>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = received.clone();
        harness.server.add_incoming_last::<WebSocketFrame, _>(move |_, item| {
            if let Some(frame) = item.take::<WebSocketFrame>() {
                sink.borrow_mut().push(frame);
            }
            Ok(())
        });

        let ready = Rc::new(Cell::new(false));
        let flag = ready.clone();
        harness.client.on_handshake_complete(move |_| flag.set(true));
        let probe = ready.clone();
        harness.pump(move |_| probe.get());

        // Ping lands between two halves of a fragmented message.
        let mut first = WebSocketFrame::text("he");
        first.fin = false;
        harness.client.send(first).unwrap();
        harness.client.send(WebSocketFrame::ping(b"now".to_vec())).unwrap();
        harness.client.send(WebSocketFrame::new(Opcode::Continuation, b"llo".to_vec())).unwrap();

        let probe = received.clone();
        harness.pump(move |_| probe.borrow().len() == 2);

        let frames = received.borrow();
        assert_eq!(frames[0].opcode, Opcode::Ping);
        assert_eq!(frames[1].text_payload(), Some("hello"));
    }
}
