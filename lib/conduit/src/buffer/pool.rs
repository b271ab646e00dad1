use crate::buffer::chunk::Chunk;
use lumen::shared::{ErrorType, NetworkError, NetworkResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Thread-safe pool of equally-sized chunks. Borrowing from an empty pool
/// allocates a fresh chunk; the pool itself never shrinks. Reclaimed chunks
/// are not zeroed.
#[derive(Debug)]
pub struct ChunkPool {
    chunk_size: usize,
    free: Mutex<Vec<Chunk>>,
    allocated: AtomicUsize,
}

impl ChunkPool {
    #[inline]
    pub fn new(chunk_size: usize) -> ChunkPool {
        if chunk_size == 0 {
            panic!("Chunk size must be non-zero");
        }

        ChunkPool {
            chunk_size,
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Provides an existing chunk if one is available, allocating otherwise.
    pub fn borrow(&self) -> Chunk {
        let recycled = self.free.lock().expect("Chunk pool lock poisoned").pop();

        match recycled {
            Some(chunk) => chunk,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Chunk::new(self.chunk_size)
            }
        }
    }

    /// Return the supplied chunk to the pool. Chunks of a different size are
    /// rejected, since they would corrupt the buffers built on this pool.
    pub fn reclaim(&self, mut chunk: Chunk) -> NetworkResult<()> {
        if chunk.capacity() != self.chunk_size {
            return Err(NetworkError::Fatal(ErrorType::InvalidArgument));
        }

        chunk.reset();
        self.free.lock().expect("Chunk pool lock poisoned").push(chunk);

        Ok(())
    }

    /// Size of every chunk handed out by this pool.
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks currently sitting in the free list.
    #[inline]
    pub fn pool_size(&self) -> usize {
        self.free.lock().expect("Chunk pool lock poisoned").len()
    }

    /// Number of chunks ever allocated by this pool.
    #[inline]
    pub fn total_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_borrow_allocates_when_empty() {
        let pool = ChunkPool::new(128);

        let chunk = pool.borrow();

        assert_eq!(chunk.capacity(), 128);
        assert_eq!(pool.total_allocated(), 1);
        assert_eq!(pool.pool_size(), 0);
    }

    #[test]
    fn test_reclaim_and_reuse() {
        let pool = ChunkPool::new(128);

        let mut chunk = pool.borrow();
        chunk.write(&[1, 2, 3]);
        pool.reclaim(chunk).unwrap();

        assert_eq!(pool.pool_size(), 1);

        let chunk = pool.borrow();

        // The recycled chunk comes back empty and no new allocation happened.
        assert_eq!(chunk.len(), 0);
        assert_eq!(pool.total_allocated(), 1);
        assert_eq!(pool.pool_size(), 0);
    }

    #[test]
    fn test_reclaim_wrong_size_fails() {
        let pool = ChunkPool::new(128);

        let result = pool.reclaim(Chunk::new(64));

        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::InvalidArgument));
        assert_eq!(pool.pool_size(), 0);
    }

    #[test]
    fn test_conservation() {
        let pool = ChunkPool::new(32);

        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.borrow());
        }

        assert_eq!(pool.total_allocated(), pool.pool_size() + held.len());

        for _ in 0..4 {
            if let Some(chunk) = held.pop() {
                pool.reclaim(chunk).unwrap();
            }
        }

        assert_eq!(pool.total_allocated(), pool.pool_size() + held.len());

        for chunk in held.drain(..) {
            pool.reclaim(chunk).unwrap();
        }

        assert_eq!(pool.total_allocated(), pool.pool_size());
    }

    #[test]
    fn test_concurrent_borrow_reclaim() {
        let pool = Arc::new(ChunkPool::new(64));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let chunk = pool.borrow();
                        pool.reclaim(chunk).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Every allocated chunk made it back to the free list.
        assert_eq!(pool.total_allocated(), pool.pool_size());
    }
}
