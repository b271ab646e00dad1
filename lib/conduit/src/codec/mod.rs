//! Wire codecs. Each codec translates between `ChunkedBuffer` bytes and a
//! typed frame, signalling `Incomplete` (after rewinding the read cursor)
//! when a frame is only partially buffered.

pub mod gds;
pub mod hpack;
pub mod http1;
pub mod http2;
pub mod websocket;
