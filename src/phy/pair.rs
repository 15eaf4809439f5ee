use std::sync::mpsc::{self, Receiver, Sender};

use super::{Device, DeviceCapabilities, Medium, RxHalf, TxHalf};

struct PairRx(Receiver<Vec<u8>>);
struct PairTx(Sender<Vec<u8>>);

impl RxHalf for PairRx {
    fn recv(&mut self) -> Option<Vec<u8>> {
        self.0.recv().ok()
    }
}

impl TxHalf for PairTx {
    fn send(&mut self, frame: &[u8]) {
        // The peer may already have been dropped (test teardown); there is
        // nobody to report the failure to.
        let _ = self.0.send(frame.to_vec());
    }
}

/// Two devices wired back to back, standing in for an Ethernet segment
/// joining two hosts in tests — what the real stack would reach via a
/// TAP device bridged to a peer.
pub fn pair(mtu: usize) -> (Device, Device) {
    let (tx_a, rx_b) = mpsc::channel();
    let (tx_b, rx_a) = mpsc::channel();
    let caps = DeviceCapabilities {
        medium: Medium::Ethernet,
        mtu,
    };
    let a = Device {
        rx: Box::new(PairRx(rx_a)),
        tx: Box::new(PairTx(tx_a)),
        capabilities: caps,
    };
    let b = Device {
        rx: Box::new(PairRx(rx_b)),
        tx: Box::new(PairTx(tx_b)),
        capabilities: caps,
    };
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_across_the_pair() {
        let (mut a, mut b) = pair(1500);
        a.tx.send(&[9, 8, 7]);
        assert_eq!(b.rx.recv(), Some(vec![9, 8, 7]));
    }
}
