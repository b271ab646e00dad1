//! Pooled byte buffering. A `ChunkPool` hands out fixed-size chunks, and a
//! `ChunkedBuffer` strings borrowed chunks into one logical byte stream with
//! independent read and write cursors.

pub mod chunk;
pub mod chunked;
pub mod pool;

pub use self::chunk::Chunk;
pub use self::chunked::ChunkedBuffer;
pub use self::pool::ChunkPool;

/// Default chunk size used when a configuration does not override it.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;
