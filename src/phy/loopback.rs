use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use super::{Device, DeviceCapabilities, Medium, RxHalf, TxHalf};

struct Shared {
    queue: Mutex<VecDeque<Vec<u8>>>,
    cond: Condvar,
    closed: Mutex<bool>,
}

/// A device that reflects every transmitted frame back as a receive:
/// the degenerate one-host network, used for the loopback interface
/// every stack brings up regardless of physical links.
pub struct Loopback;

struct LoopbackRx(Arc<Shared>);
struct LoopbackTx(Arc<Shared>);

impl RxHalf for LoopbackRx {
    fn recv(&mut self) -> Option<Vec<u8>> {
        let mut q = self.0.queue.lock().unwrap();
        loop {
            if let Some(frame) = q.pop_front() {
                return Some(frame);
            }
            if *self.0.closed.lock().unwrap() {
                return None;
            }
            q = self.0.cond.wait(q).unwrap();
        }
    }
}

impl TxHalf for LoopbackTx {
    fn send(&mut self, frame: &[u8]) {
        self.0.queue.lock().unwrap().push_back(frame.to_vec());
        self.0.cond.notify_one();
    }
}

impl Loopback {
    pub fn new(mtu: usize) -> Device {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            closed: Mutex::new(false),
        });
        Device {
            rx: Box::new(LoopbackRx(shared.clone())),
            tx: Box::new(LoopbackTx(shared)),
            capabilities: DeviceCapabilities {
                medium: Medium::Loopback,
                mtu,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_transmitted_frame() {
        let mut dev = Loopback::new(1500);
        dev.tx.send(&[1, 2, 3]);
        assert_eq!(dev.rx.recv(), Some(vec![1, 2, 3]));
    }
}
