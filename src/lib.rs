//! A portable TCP/IP protocol stack core.
//!
//! The stack accepts raw Ethernet frames from a pluggable link device
//! ([`phy`]), parses and demultiplexes them through ARP, IPv4, ICMP, UDP
//! and TCP, and exposes a blocking, BSD-flavoured socket API ([`socket`])
//! to application threads. All protocol state is owned by a single worker
//! thread ([`worker`]); application and driver threads never touch it
//! directly, they marshal work in and park on per-socket wait objects
//! until the worker wakes them.
//!
//! ```no_run
//! use nanostack::phy::Loopback;
//! use nanostack::pktbuf::Pool;
//! use nanostack::socket::UdpSocket;
//! use nanostack::wire::{EthernetAddress, Ipv4Address};
//! use nanostack::worker::Stack;
//! use std::sync::Arc;
//!
//! let pool = Arc::new(Pool::new(2048, 1024));
//! let stack = Stack::spawn(pool);
//! stack
//!     .add_netif(
//!         "lo",
//!         EthernetAddress([0; 6]),
//!         Ipv4Address::new(127, 0, 0, 1),
//!         Ipv4Address::new(255, 0, 0, 0),
//!         Loopback::new(1500),
//!     )
//!     .unwrap();
//! let sock = UdpSocket::open(&stack).unwrap();
//! sock.bind(None, 2000).unwrap();
//! ```

pub mod arp;
pub mod checksum;
pub mod config;
pub mod error;
pub mod ip;
pub mod link;
pub mod netif;
pub mod phy;
pub mod pktbuf;
pub mod raw;
pub mod socket;
pub mod sockwait;
pub mod tcp;
pub mod time;
pub mod timer;
pub mod udp;
pub mod wire;
pub mod worker;

pub use error::{Error, Result};
