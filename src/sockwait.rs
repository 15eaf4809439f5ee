//! The blocking primitive underneath every socket call. An
//! application thread calling
//! `send`/`recv`/`connect` may find the worker can't complete the
//! request synchronously (no buffer space, no queued datagram, no
//! completed handshake); it parks here until the worker — running on a
//! completely different thread — wakes it, optionally with an error.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, Result};
use crate::time::Duration;

struct Inner {
    signaled: bool,
    err: Option<Error>,
    /// Count of threads currently parked here; `close` uses this to know
    /// whether anybody still needs waking.
    waiting: usize,
}

pub struct SockWait {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl SockWait {
    pub fn new() -> Arc<SockWait> {
        Arc::new(SockWait {
            inner: Mutex::new(Inner {
                signaled: false,
                err: None,
                waiting: 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Blocks until woken or `timeout` elapses (blocks forever on `None`).
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        guard.waiting += 1;
        let mut timed_out = false;
        if !guard.signaled {
            match timeout {
                Some(d) => {
                    let (g, result) = self
                        .cond
                        .wait_timeout_while(guard, d.into(), |s| !s.signaled)
                        .unwrap();
                    guard = g;
                    timed_out = result.timed_out();
                }
                None => {
                    guard = self.cond.wait_while(guard, |s| !s.signaled).unwrap();
                }
            }
        }
        guard.waiting -= 1;
        if timed_out && !guard.signaled {
            return Err(Error::Tmo);
        }
        guard.signaled = false;
        match guard.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wakes every thread currently parked on this wait, with `err` set
    /// (or cleared, on a successful completion) for the next one to
    /// observe.
    pub fn wake(&self, err: Option<Error>) {
        let mut guard = self.inner.lock().unwrap();
        guard.signaled = true;
        guard.err = err;
        self.cond.notify_all();
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.lock().unwrap().waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wakes_a_parked_waiter() {
        let wait = SockWait::new();
        let w2 = wait.clone();
        let handle = thread::spawn(move || w2.wait(None));
        thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(wait.waiting_count(), 1);
        wait.wake(None);
        assert!(handle.join().unwrap().is_ok());
        assert_eq!(wait.waiting_count(), 0);
    }

    #[test]
    fn wake_with_error_propagates() {
        let wait = SockWait::new();
        let w2 = wait.clone();
        let handle = thread::spawn(move || w2.wait(None));
        thread::sleep(std::time::Duration::from_millis(30));
        wait.wake(Some(Error::Close));
        assert_eq!(handle.join().unwrap(), Err(Error::Close));
    }

    #[test]
    fn times_out_without_a_wake() {
        let wait = SockWait::new();
        assert_eq!(wait.wait(Some(Duration::from_millis(20))), Err(Error::Tmo));
    }
}
