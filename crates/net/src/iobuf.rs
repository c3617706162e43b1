//! Stdio buffer pools.
//!
//! Both ends of the stdio plane bound their memory with fixed pools, one per
//! direction. An empty pool is a visible condition: `try_acquire` returns
//! `PoolExhausted` and the caller deregisters the corresponding read until a
//! buffer comes back.

use thiserror::Error;

pub const DEFAULT_POOL_BUFFERS: usize = 1024;
pub const DEFAULT_BUF_BYTES: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("buffer pool exhausted")]
pub struct PoolExhausted;

#[derive(Debug)]
pub struct BufPool {
    free: Vec<Vec<u8>>,
    outstanding: usize,
    cap: usize,
    buf_bytes: usize,
}

impl BufPool {
    pub fn new(cap: usize, buf_bytes: usize) -> Self {
        Self {
            free: Vec::new(),
            outstanding: 0,
            cap,
            buf_bytes,
        }
    }

    pub fn has_free(&self) -> bool {
        self.outstanding < self.cap
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Buffers allocate lazily up to the cap, then recycle.
    pub fn try_acquire(&mut self) -> Result<Vec<u8>, PoolExhausted> {
        if self.outstanding >= self.cap {
            return Err(PoolExhausted);
        }
        self.outstanding += 1;
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                Ok(buf)
            }
            None => Ok(Vec::with_capacity(self.buf_bytes)),
        }
    }

    pub fn release(&mut self, buf: Vec<u8>) {
        debug_assert!(self.outstanding > 0);
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() < self.cap {
            self.free.push(buf);
        }
    }

    /// Release a slot whose buffer moved into a long-lived cache and cannot
    /// come back.
    pub fn release_detached(&mut self) {
        debug_assert!(self.outstanding > 0);
        self.outstanding = self.outstanding.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_visible_and_release_resumes() {
        let mut pool = BufPool::new(2, 16);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(!pool.has_free());
        assert_eq!(pool.try_acquire(), Err(PoolExhausted));
        pool.release(a);
        assert!(pool.has_free());
        pool.try_acquire().unwrap();
    }

    #[test]
    fn detached_release_frees_the_slot() {
        let mut pool = BufPool::new(1, 8);
        let _buf = pool.try_acquire().unwrap();
        assert_eq!(pool.try_acquire(), Err(PoolExhausted));
        pool.release_detached();
        assert!(pool.has_free());
    }

    #[test]
    fn released_buffers_recycle_cleared() {
        let mut pool = BufPool::new(1, 8);
        let mut buf = pool.try_acquire().unwrap();
        buf.extend_from_slice(b"junk");
        pool.release(buf);
        let buf = pool.try_acquire().unwrap();
        assert!(buf.is_empty());
    }
}
