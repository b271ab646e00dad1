//! `conduit` is a client/server TCP toolkit built around a typed,
//! bidirectional processing pipeline over pooled byte buffers. Channels move
//! frames of arbitrary types; protocol modules installed on a channel
//! transform raw bytes into frames on the way in and frames back into bytes
//! on the way out.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod module;
pub mod pipeline;
pub mod tls;

pub use lumen::shared::{ErrorType, ErrorUtils, NetworkError, NetworkResult, ProtocolError};
