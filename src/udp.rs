//! The UDP socket table: each socket is a bound local
//! `(addr, port)` plus a fixed-depth receive queue (`UDP_MAX_RECV`
//! datagrams); once full, the oldest queued datagram is dropped to make
//! room for the newest, matching a ring buffer rather than a growable
//! list.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;

use crate::config::{UDP_MAX_NR, UDP_MAX_RECV};
use crate::error::{Error, Result};
use crate::sockwait::SockWait;
use crate::wire::Ipv4Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpHandle(pub usize);

pub struct Datagram {
    pub src_addr: Ipv4Address,
    pub src_port: u16,
    pub data: Vec<u8>,
}

struct Socket {
    local_addr: Option<Ipv4Address>,
    local_port: u16,
    recv_queue: VecDeque<Datagram>,
    recv_wait: Arc<SockWait>,
}

pub struct Table {
    sockets: Vec<Option<Socket>>,
    next_ephemeral: u16,
}

impl Table {
    pub fn new() -> Table {
        Table {
            sockets: (0..UDP_MAX_NR).map(|_| None).collect(),
            next_ephemeral: 49152,
        }
    }

    pub fn open(&mut self) -> Result<UdpHandle> {
        let idx = self.sockets.iter().position(|s| s.is_none()).ok_or(Error::Full)?;
        self.sockets[idx] = Some(Socket {
            local_addr: None,
            local_port: 0,
            recv_queue: VecDeque::new(),
            recv_wait: SockWait::new(),
        });
        Ok(UdpHandle(idx))
    }

    fn get_mut(&mut self, h: UdpHandle) -> Result<&mut Socket> {
        self.sockets.get_mut(h.0).and_then(|s| s.as_mut()).ok_or(Error::NotExist)
    }

    pub fn bind(&mut self, h: UdpHandle, addr: Option<Ipv4Address>, port: u16) -> Result<()> {
        if self.sockets.iter().flatten().any(|s| s.local_port == port && port != 0) {
            return Err(Error::Refused);
        }
        let sock = self.get_mut(h)?;
        sock.local_addr = addr;
        sock.local_port = port;
        Ok(())
    }

    pub fn local_port(&self, h: UdpHandle) -> Option<u16> {
        self.sockets.get(h.0)?.as_ref().map(|s| s.local_port)
    }

    pub fn local_addr(&self, h: UdpHandle) -> Option<Ipv4Address> {
        self.sockets.get(h.0)?.as_ref().and_then(|s| s.local_addr)
    }

    /// Binds the socket to an ephemeral port if it has none yet (the
    /// implicit bind a first `sendto` performs), returning the local
    /// port either way.
    pub fn ensure_bound(&mut self, h: UdpHandle) -> Result<u16> {
        let current = self.get_mut(h)?.local_port;
        if current != 0 {
            return Ok(current);
        }
        let port = loop {
            let candidate = self.next_ephemeral;
            self.next_ephemeral = if candidate == u16::MAX { 49152 } else { candidate + 1 };
            if !self.sockets.iter().flatten().any(|s| s.local_port == candidate) {
                break candidate;
            }
        };
        self.get_mut(h)?.local_port = port;
        Ok(port)
    }

    pub fn recv_wait(&self, h: UdpHandle) -> Option<Arc<SockWait>> {
        self.sockets.get(h.0)?.as_ref().map(|s| s.recv_wait.clone())
    }

    /// Delivers a datagram addressed to `dst_port` (and, for sockets
    /// bound to a specific address, `dst_addr`); returns whether any
    /// socket accepted it (otherwise the caller should generate a port-
    /// unreachable ICMP message).
    pub fn input(
        &mut self,
        src_addr: Ipv4Address,
        src_port: u16,
        dst_addr: Ipv4Address,
        dst_port: u16,
        data: Vec<u8>,
    ) -> bool {
        let sock = self.sockets.iter_mut().flatten().find(|s| {
            s.local_port == dst_port && s.local_addr.map_or(true, |a| a == dst_addr)
        });
        match sock {
            Some(sock) => {
                if sock.recv_queue.len() >= UDP_MAX_RECV {
                    debug!(target: "net::udp", "receive queue full on port {}, dropping oldest", dst_port);
                    sock.recv_queue.pop_front();
                }
                sock.recv_queue.push_back(Datagram {
                    src_addr,
                    src_port,
                    data,
                });
                sock.recv_wait.wake(None);
                true
            }
            None => false,
        }
    }

    /// Pops the oldest queued datagram, if any.
    pub fn recv_from(&mut self, h: UdpHandle) -> Result<Option<Datagram>> {
        Ok(self.get_mut(h)?.recv_queue.pop_front())
    }

    pub fn close(&mut self, h: UdpHandle) -> Result<()> {
        if let Some(slot) = self.sockets.get_mut(h.0) {
            if let Some(sock) = slot.take() {
                sock.recv_wait.wake(Some(Error::Close));
                return Ok(());
            }
        }
        Err(Error::NotExist)
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_rejects_duplicate_port() {
        let mut table = Table::new();
        let a = table.open().unwrap();
        let b = table.open().unwrap();
        table.bind(a, None, 5000).unwrap();
        assert_eq!(table.bind(b, None, 5000), Err(Error::Refused));
    }

    #[test]
    fn input_queues_and_recv_drains_in_order() {
        let mut table = Table::new();
        let h = table.open().unwrap();
        table.bind(h, None, 5000).unwrap();
        let src = Ipv4Address::new(10, 0, 0, 2);
        assert!(table.input(src, 1, Ipv4Address::new(10, 0, 0, 1), 5000, b"a".to_vec()));
        assert!(table.input(src, 1, Ipv4Address::new(10, 0, 0, 1), 5000, b"b".to_vec()));
        assert_eq!(table.recv_from(h).unwrap().unwrap().data, b"a");
        assert_eq!(table.recv_from(h).unwrap().unwrap().data, b"b");
        assert!(table.recv_from(h).unwrap().is_none());
    }

    #[test]
    fn input_to_unbound_port_is_undelivered() {
        let mut table = Table::new();
        let src = Ipv4Address::new(10, 0, 0, 2);
        assert!(!table.input(src, 1, Ipv4Address::new(10, 0, 0, 1), 9999, b"x".to_vec()));
    }

    #[test]
    fn recv_queue_drops_oldest_when_full() {
        let mut table = Table::new();
        let h = table.open().unwrap();
        table.bind(h, None, 1).unwrap();
        let src = Ipv4Address::new(10, 0, 0, 2);
        for i in 0..(UDP_MAX_RECV + 5) {
            table.input(src, 1, Ipv4Address::new(10, 0, 0, 1), 1, vec![i as u8]);
        }
        let mut count = 0;
        while table.recv_from(h).unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, UDP_MAX_RECV);
    }
}
