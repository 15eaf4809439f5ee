//! The link-driver boundary. This is the stack's one external
//! collaborator — a real implementation is a pcap capture, an RTL8139
//! ring buffer, or a host OS NIC, none of which belong in the core.
//! What belongs here is the trait those drivers implement, plus the
//! handful of in-process implementations ([`Loopback`] and [`pair`])
//! needed to exercise the core without real hardware or elevated
//! privileges.
//!
//! A device is split into a receive half and a transmit half at
//! construction, mirroring how a raw socket or TUN fd is actually used:
//! the worker thread owns the transmit half and calls it synchronously
//! from `netif::out`, while a dedicated pump thread blocks on the
//! receive half and forwards frames into the interface's inbound queue.
//! Splitting up front means neither half needs a lock shared with the
//! other.

mod loopback;
mod pair;

pub use loopback::Loopback;
pub use pair::pair;

/// The receiving half of a link device. `recv` blocks until a frame is
/// available and returns `None` once the device is closed.
pub trait RxHalf: Send {
    fn recv(&mut self) -> Option<Vec<u8>>;
}

/// The transmitting half of a link device.
pub trait TxHalf: Send {
    fn send(&mut self, frame: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Medium {
    #[default]
    Ethernet,
    Loopback,
}

/// Static capabilities reported by a device at `netif_open` time.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCapabilities {
    pub medium: Medium,
    pub mtu: usize,
}

/// A device ready to be wired into an interface: its two halves plus the
/// capabilities the interface needs to size its queues and frame headers.
pub struct Device {
    pub rx: Box<dyn RxHalf>,
    pub tx: Box<dyn TxHalf>,
    pub capabilities: DeviceCapabilities,
}
