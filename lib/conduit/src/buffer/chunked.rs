use crate::buffer::chunk::Chunk;
use crate::buffer::pool::ChunkPool;
use lumen::shared::{ErrorType, NetworkError, NetworkResult};
use std::cmp::min;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

/// A logical byte stream over a sequence of pooled chunks with independent
/// read and write cursors. Positions are absolute offsets into the stream;
/// fully-consumed chunks are released back to the pool by `compact`, after
/// which positions below the retained range are no longer addressable.
///
/// The read cursor may be rewound within the retained range, which is what
/// the protocol codecs use to back out of a partially-received frame.
#[derive(Debug)]
pub struct ChunkedBuffer {
    pool: Arc<ChunkPool>,
    chunks: VecDeque<Chunk>,
    // Absolute position of the first retained byte.
    head_offset: usize,
    read_pos: usize,
    write_pos: usize,
    // Absolute end of retained data. Equals `write_pos` unless the write
    // cursor has been rewound for in-place patching.
    end: usize,
    writer_closed: bool,
    disposed: bool,
}

impl ChunkedBuffer {
    #[inline]
    pub fn new(pool: &Arc<ChunkPool>) -> ChunkedBuffer {
        ChunkedBuffer {
            pool: pool.clone(),
            chunks: VecDeque::new(),
            head_offset: 0,
            read_pos: 0,
            write_pos: 0,
            end: 0,
            writer_closed: false,
            disposed: false,
        }
    }

    /// Number of bytes currently readable.
    #[inline]
    pub fn available(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Logical length of the stream so far.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn write_position(&self) -> usize {
        self.write_pos
    }

    /// True once the writer is closed and all bytes have been consumed. This
    /// is distinct from "no bytes available right now".
    #[inline]
    pub fn is_end_of_stream(&self) -> bool {
        self.writer_closed && self.available() == 0
    }

    #[inline]
    pub fn writer_closed(&self) -> bool {
        self.writer_closed
    }

    /// Marks the end of the stream. Reads past this point signal end-of-stream
    /// rather than "wait for more".
    #[inline]
    pub fn close_writer(&mut self) {
        self.writer_closed = true;
    }

    /// Move the read cursor. Rewinding is allowed within the retained chunk
    /// range; anything outside `[first retained byte, write position]` fails.
    pub fn set_read_position(&mut self, pos: usize) -> NetworkResult<()> {
        self.check_live()?;

        if pos < self.head_offset || pos > self.write_pos {
            return Err(NetworkError::Fatal(ErrorType::OutOfRange));
        }

        self.read_pos = pos;
        Ok(())
    }

    /// Move the write cursor. Rewinding makes subsequent writes overwrite
    /// retained bytes in place before extending the stream again.
    pub fn set_write_position(&mut self, pos: usize) -> NetworkResult<()> {
        self.check_live()?;

        if pos < self.read_pos || pos > self.end {
            return Err(NetworkError::Fatal(ErrorType::OutOfRange));
        }

        self.write_pos = pos;
        Ok(())
    }

    /// Append (or overwrite, if the write cursor was rewound) the supplied
    /// bytes, borrowing chunks from the pool as needed.
    pub fn write(&mut self, mut bytes: &[u8]) -> NetworkResult<()> {
        self.check_live()?;

        while !bytes.is_empty() {
            if self.write_pos == self.end {
                // Append path: fill the tail chunk, borrowing a fresh one
                // when it is full.
                if self.chunks.back().map_or(true, |chunk| chunk.free() == 0) {
                    self.chunks.push_back(self.pool.borrow());
                }

                let chunk = match self.chunks.back_mut() {
                    Some(chunk) => chunk,
                    None => unreachable!(),
                };

                let take = min(bytes.len(), chunk.free());
                chunk.write(&bytes[..take]);
                self.write_pos += take;
                self.end += take;
                bytes = &bytes[take..];
            } else {
                // Overwrite path: patch retained bytes in place.
                let (index, offset) = self.locate(self.write_pos);
                let chunk = &mut self.chunks[index];
                let take = min(bytes.len(), chunk.len() - offset);
                chunk.overwrite(offset, &bytes[..take]);
                self.write_pos += take;
                bytes = &bytes[take..];
            }
        }

        Ok(())
    }

    /// Consume up to `count` bytes from the read cursor. Returns fewer bytes
    /// than requested when the stream has no more to give; use
    /// `is_end_of_stream` to tell exhaustion apart from starvation.
    pub fn read(&mut self, count: usize) -> NetworkResult<Vec<u8>> {
        self.check_live()?;

        let take = min(count, self.available());
        let mut out = vec![0u8; take];
        self.copy_out(self.read_pos, &mut out);
        self.read_pos += take;

        Ok(out)
    }

    /// Consume bytes into the supplied slice, returning the number copied.
    pub fn read_into(&mut self, out: &mut [u8]) -> NetworkResult<usize> {
        self.check_live()?;

        let take = min(out.len(), self.available());
        self.copy_out(self.read_pos, &mut out[..take]);
        self.read_pos += take;

        Ok(take)
    }

    /// Copy everything between the read and write cursors into `sink`,
    /// consuming it from this buffer.
    pub fn drain_to(&mut self, sink: &mut ChunkedBuffer) -> NetworkResult<usize> {
        self.check_live()?;

        let mut total = 0;

        while self.available() > 0 {
            let (index, offset) = self.locate(self.read_pos);
            let extent = min(self.chunks[index].len() - offset, self.available());
            // The borrow of the source chunk ends before the sink write.
            let mut staging = [0u8; 512];
            let take = min(extent, staging.len());
            staging[..take].copy_from_slice(&self.chunks[index].filled()[offset..offset + take]);
            sink.write(&staging[..take])?;
            self.read_pos += take;
            total += take;
        }

        Ok(total)
    }

    /// Release fully-consumed chunks back to the pool. After compaction the
    /// read cursor can no longer be rewound past the released range.
    pub fn compact(&mut self) {
        while let Some(chunk) = self.chunks.front() {
            let chunk_end = self.head_offset + chunk.len();

            // The tail chunk stays put while it still has free capacity.
            if chunk_end > self.read_pos || (self.chunks.len() == 1 && chunk.free() > 0) {
                break;
            }

            let chunk = match self.chunks.pop_front() {
                Some(chunk) => chunk,
                None => unreachable!(),
            };

            self.head_offset = chunk_end;
            drop(self.pool.reclaim(chunk));
        }
    }

    /// Return every chunk to the pool and poison the buffer. All operations
    /// after this fail with `Disposed`.
    pub fn dispose(&mut self) -> NetworkResult<()> {
        self.check_live()?;

        self.release_chunks();
        self.disposed = true;

        Ok(())
    }

    /// Read from `reader` into the tail of the buffer until it would block.
    /// Returns the byte count and whether the reader signalled end-of-input.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> NetworkResult<(usize, bool)> {
        self.check_live()?;

        let mut total = 0;

        loop {
            if self.chunks.back().map_or(true, |chunk| chunk.free() == 0) {
                self.chunks.push_back(self.pool.borrow());
            }

            let chunk = match self.chunks.back_mut() {
                Some(chunk) => chunk,
                None => unreachable!(),
            };

            match reader.read(chunk.free_slice_mut()) {
                Ok(0) => {
                    self.writer_closed = true;
                    return Ok((total, true));
                }
                Ok(count) => {
                    chunk.expand(count);
                    self.end += count;
                    self.write_pos = self.end;
                    total += count;
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((total, false));
                }
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Write readable bytes out to `writer` until it would block or the
    /// buffer drains, consuming what was written and compacting.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> NetworkResult<usize> {
        self.check_live()?;

        let mut total = 0;

        while self.available() > 0 {
            let (index, offset) = self.locate(self.read_pos);
            let extent = min(self.chunks[index].len() - offset, self.available());

            match writer.write(&self.chunks[index].filled()[offset..offset + extent]) {
                Ok(0) => return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::WriteZero))),
                Ok(count) => {
                    self.read_pos += count;
                    total += count;
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }

        self.compact();
        Ok(total)
    }

    #[inline]
    fn check_live(&self) -> NetworkResult<()> {
        if self.disposed {
            return Err(NetworkError::Fatal(ErrorType::Disposed));
        }
        Ok(())
    }

    /// Map an absolute position to `(chunk index, offset within chunk)`. A
    /// position at the retained end maps to the append point.
    fn locate(&self, pos: usize) -> (usize, usize) {
        let mut relative = pos - self.head_offset;

        for (index, chunk) in self.chunks.iter().enumerate() {
            if relative < chunk.len() {
                return (index, relative);
            }
            relative -= chunk.len();
        }

        (self.chunks.len(), 0)
    }

    fn copy_out(&self, from: usize, out: &mut [u8]) {
        if out.is_empty() {
            return;
        }

        let (mut index, mut offset) = self.locate(from);
        let mut copied = 0;

        while copied < out.len() {
            let chunk = &self.chunks[index];
            let take = min(out.len() - copied, chunk.len() - offset);
            out[copied..copied + take].copy_from_slice(&chunk.filled()[offset..offset + take]);
            copied += take;
            index += 1;
            offset = 0;
        }
    }

    fn release_chunks(&mut self) {
        self.head_offset = self.end;
        self.read_pos = self.end;
        self.write_pos = self.end;

        for chunk in self.chunks.drain(..) {
            drop(self.pool.reclaim(chunk));
        }
    }
}

impl Drop for ChunkedBuffer {
    fn drop(&mut self) {
        if !self.disposed {
            self.release_chunks();
        }
    }
}

impl io::Read for ChunkedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_into(buf)
            .map_err(|_| io::Error::from(io::ErrorKind::Other))
    }
}

impl io::Write for ChunkedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ChunkedBuffer::write(self, buf).map_err(|_| io::Error::from(io::ErrorKind::Other))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
