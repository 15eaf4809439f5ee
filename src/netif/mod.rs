//! Network interfaces: each interface owns a driver's transmit
//! half directly, and a receive pump thread that forwards frames into a
//! small mutex-guarded queue. Unlike every other table in this crate, the
//! queue genuinely is touched from two threads — the pump thread pushes,
//! the worker thread drains — so it is the one place outside `worker`
//! that needs its own lock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::config::NETIF_INQ_SIZE;
use crate::phy;
use crate::wire::EthernetAddress as HwAddress;
use crate::wire::Ipv4Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetifId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Opened,
    Active,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

struct InQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
}

pub struct Netif {
    pub id: NetifId,
    pub name: &'static str,
    pub hw_addr: HwAddress,
    pub ip_addr: Ipv4Address,
    pub netmask: Ipv4Address,
    pub mtu: usize,
    pub medium: phy::Medium,
    pub state: State,
    pub stats: Stats,
    tx: Box<dyn phy::TxHalf>,
    in_q: Arc<InQueue>,
}

impl Netif {
    /// Wires up `device`, spawning its receive pump. `notify` is called
    /// (from the pump thread) every time the queue transitions from empty
    /// to non-empty, mirroring `netif_put_in`'s single `NETIF_IN` message
    /// per burst rather than one per frame.
    pub fn open(
        id: NetifId,
        name: &'static str,
        hw_addr: HwAddress,
        ip_addr: Ipv4Address,
        netmask: Ipv4Address,
        device: phy::Device,
        notify: impl Fn() + Send + 'static,
    ) -> Netif {
        let in_q = Arc::new(InQueue {
            frames: Mutex::new(VecDeque::new()),
        });
        let pump_q = in_q.clone();
        let mut rx = device.rx;
        thread::spawn(move || loop {
            match rx.recv() {
                Some(frame) => {
                    let mut q = pump_q.frames.lock().unwrap();
                    if q.len() >= NETIF_INQ_SIZE {
                        // Inbound queue is fixed-size; a stalled worker
                        // sheds the newest frames rather than growing.
                        continue;
                    }
                    let was_empty = q.is_empty();
                    q.push_back(frame);
                    drop(q);
                    if was_empty {
                        notify();
                    }
                }
                None => return,
            }
        });
        Netif {
            id,
            name,
            hw_addr,
            ip_addr,
            netmask,
            mtu: device.capabilities.mtu,
            medium: device.capabilities.medium,
            state: State::Opened,
            stats: Stats::default(),
            tx: device.tx,
            in_q,
        }
    }

    pub fn activate(&mut self) {
        self.state = State::Active;
    }

    pub fn deactivate(&mut self) {
        self.state = State::Opened;
    }

    /// Drains every frame currently queued. Called by the worker once per
    /// `NETIF_IN` message (and, as a safety net, once per timer tick).
    pub fn take_in(&mut self) -> Vec<Vec<u8>> {
        self.in_q.frames.lock().unwrap().drain(..).collect()
    }

    pub fn send_frame(&mut self, frame: &[u8]) {
        if self.state != State::Active {
            self.stats.tx_dropped += 1;
            return;
        }
        self.tx.send(frame);
        self.stats.tx_packets += 1;
    }

    pub fn contains(&self, addr: Ipv4Address) -> bool {
        addr.mask_with(self.netmask) == self.ip_addr.mask_with(self.netmask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::Loopback;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn pump_notifies_on_empty_to_nonempty_transition() {
        let notified = Arc::new(AtomicUsize::new(0));
        let notified2 = notified.clone();
        let mut netif = Netif::open(
            NetifId(0),
            "lo",
            HwAddress([0xff; 6]),
            Ipv4Address::new(127, 0, 0, 1),
            Ipv4Address::new(255, 0, 0, 0),
            Loopback::new(1500),
            move || {
                notified2.fetch_add(1, Ordering::SeqCst);
            },
        );
        netif.activate();
        netif.send_frame(&[1, 2, 3]);
        netif.send_frame(&[4, 5, 6]);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        let frames = netif.take_in();
        assert_eq!(frames, vec![vec![1, 2, 3], vec![4, 5, 6]]);
    }
}
