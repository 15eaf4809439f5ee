//! The block pool backing `PktBuf`: two fixed-count free lists (blocks and
//! "buffer slots", i.e. how many `PktBuf` headers may be live at once)
//! guarded by one lock, with a blocking variant of allocation for callers
//! outside the worker thread.

use std::sync::{Condvar, Mutex};

use super::BLK_SIZE;
use crate::error::{Error, Result};
use crate::time::Duration;

type Slab = Box<[u8; BLK_SIZE]>;

struct Inner {
    free_blocks: Vec<Slab>,
    live_buffers: usize,
    buf_capacity: usize,
}

pub struct Pool {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Pool {
    pub fn new(block_count: usize, buf_capacity: usize) -> Pool {
        let free_blocks = (0..block_count).map(|_| Box::new([0u8; BLK_SIZE])).collect();
        Pool {
            inner: Mutex::new(Inner {
                free_blocks,
                live_buffers: 0,
                buf_capacity,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.lock().unwrap().free_blocks.len()
    }

    /// Non-blocking allocation of `n` blocks plus one buffer-header slot.
    /// Used by the worker thread, which must never stall here.
    pub fn try_take(&self, n: usize) -> Result<Vec<Slab>> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_locked(&mut inner, n)
    }

    /// Non-blocking allocation of `n` extra blocks for a buffer that
    /// already holds its header slot (`resize`, `add_header`).
    pub fn try_take_blocks(&self, n: usize) -> Result<Vec<Slab>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.free_blocks.len() < n {
            return Err(Error::Mem);
        }
        let split_at = inner.free_blocks.len() - n;
        Ok(inner.free_blocks.split_off(split_at))
    }

    fn take_locked(inner: &mut Inner, n: usize) -> Result<Vec<Slab>> {
        if inner.free_blocks.len() < n {
            return Err(Error::Mem);
        }
        if inner.live_buffers >= inner.buf_capacity {
            return Err(Error::Mem);
        }
        let split_at = inner.free_blocks.len() - n;
        let slabs = inner.free_blocks.split_off(split_at);
        inner.live_buffers += 1;
        Ok(slabs)
    }

    /// Blocking allocation: waits (bounded by `timeout`, or forever if
    /// `None`) for enough free blocks and a buffer slot.
    pub fn take_blocking(&self, n: usize, timeout: Option<Duration>) -> Result<Vec<Slab>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match Self::take_locked(&mut inner, n) {
                Ok(slabs) => return Ok(slabs),
                Err(_) => {
                    let (guard, timed_out) = match timeout {
                        Some(d) => {
                            let (g, r) = self
                                .cond
                                .wait_timeout(inner, d.into())
                                .unwrap();
                            (g, r.timed_out())
                        }
                        None => (self.cond.wait(inner).unwrap(), false),
                    };
                    inner = guard;
                    if timed_out {
                        return Err(Error::Tmo);
                    }
                }
            }
        }
    }

    /// Returns a whole buffer to the pool: its blocks (possibly none, if
    /// they were transferred to another chain by `join`) plus its
    /// buffer-header slot.
    pub fn release_buffer(&self, slabs: impl Iterator<Item = Slab>) {
        let mut inner = self.inner.lock().unwrap();
        for slab in slabs {
            inner.free_blocks.push(slab);
        }
        inner.live_buffers = inner.live_buffers.saturating_sub(1);
        self.cond.notify_all();
    }

    /// Returns individual blocks trimmed from a still-live buffer
    /// (`resize`, `remove_header`); the buffer-header slot stays taken.
    pub fn release_blocks(&self, slabs: impl Iterator<Item = Slab>) {
        let mut inner = self.inner.lock().unwrap();
        let mut any = false;
        for slab in slabs {
            inner.free_blocks.push(slab);
            any = true;
        }
        if any {
            self.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_fails_fast() {
        let pool = Pool::new(2, 10);
        let _a = pool.try_take(2).unwrap();
        assert_eq!(pool.try_take(1), Err(Error::Mem));
    }

    #[test]
    fn blocking_alloc_times_out() {
        let pool = Pool::new(1, 10);
        let _a = pool.try_take(1).unwrap();
        let r = pool.take_blocking(1, Some(Duration::from_millis(20)));
        assert_eq!(r, Err(Error::Tmo));
    }
}
