//! The raw socket table: sockets bound to an IP protocol number rather
//! than a port. Each matching inbound datagram's payload is copied onto
//! every matching socket's receive queue, so a ping client can observe
//! ICMP echo replies without the stack growing a dedicated ICMP socket
//! type. Queue depth is bounded like UDP's; the oldest datagram is
//! dropped to admit the newest.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::{RAW_MAX_NR, RAW_MAX_RECV};
use crate::error::{Error, Result};
use crate::sockwait::SockWait;
use crate::wire::Ipv4Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(pub usize);

pub struct Datagram {
    pub src_addr: Ipv4Address,
    pub data: Vec<u8>,
}

struct Socket {
    protocol: u8,
    local_addr: Option<Ipv4Address>,
    recv_queue: VecDeque<Datagram>,
    recv_wait: Arc<SockWait>,
}

pub struct Table {
    sockets: Vec<Option<Socket>>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            sockets: (0..RAW_MAX_NR).map(|_| None).collect(),
        }
    }

    pub fn open(&mut self, protocol: u8) -> Result<RawHandle> {
        let idx = self.sockets.iter().position(|s| s.is_none()).ok_or(Error::Full)?;
        self.sockets[idx] = Some(Socket {
            protocol,
            local_addr: None,
            recv_queue: VecDeque::new(),
            recv_wait: SockWait::new(),
        });
        Ok(RawHandle(idx))
    }

    fn get_mut(&mut self, h: RawHandle) -> Result<&mut Socket> {
        self.sockets.get_mut(h.0).and_then(|s| s.as_mut()).ok_or(Error::NotExist)
    }

    pub fn bind(&mut self, h: RawHandle, addr: Option<Ipv4Address>) -> Result<()> {
        self.get_mut(h)?.local_addr = addr;
        Ok(())
    }

    pub fn protocol(&self, h: RawHandle) -> Result<u8> {
        self.sockets
            .get(h.0)
            .and_then(|s| s.as_ref())
            .map(|s| s.protocol)
            .ok_or(Error::NotExist)
    }

    pub fn recv_wait(&self, h: RawHandle) -> Option<Arc<SockWait>> {
        self.sockets.get(h.0)?.as_ref().map(|s| s.recv_wait.clone())
    }

    /// Offers one IP payload to every socket bound to its protocol;
    /// returns whether any socket took a copy.
    pub fn input(
        &mut self,
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
        protocol: u8,
        data: &[u8],
    ) -> bool {
        let mut delivered = false;
        for sock in self.sockets.iter_mut().flatten() {
            if sock.protocol != protocol {
                continue;
            }
            if let Some(bound) = sock.local_addr {
                if bound != dst_addr {
                    continue;
                }
            }
            if sock.recv_queue.len() >= RAW_MAX_RECV {
                sock.recv_queue.pop_front();
            }
            sock.recv_queue.push_back(Datagram {
                src_addr,
                data: data.to_vec(),
            });
            sock.recv_wait.wake(None);
            delivered = true;
        }
        delivered
    }

    pub fn recv_from(&mut self, h: RawHandle) -> Result<Option<Datagram>> {
        Ok(self.get_mut(h)?.recv_queue.pop_front())
    }

    pub fn close(&mut self, h: RawHandle) -> Result<()> {
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

    const ICMP: u8 = 1;

    #[test]
    fn delivers_only_matching_protocol() {
        let mut table = Table::new();
        let h = table.open(ICMP).unwrap();
        let src = Ipv4Address::new(10, 0, 0, 2);
        let dst = Ipv4Address::new(10, 0, 0, 1);
        assert!(table.input(src, dst, ICMP, &[8, 0, 0, 0]));
        assert!(!table.input(src, dst, 47, &[0; 4]));
        let d = table.recv_from(h).unwrap().unwrap();
        assert_eq!(d.src_addr, src);
        assert_eq!(d.data, vec![8, 0, 0, 0]);
    }

    #[test]
    fn every_matching_socket_gets_a_copy() {
        let mut table = Table::new();
        let a = table.open(ICMP).unwrap();
        let b = table.open(ICMP).unwrap();
        let src = Ipv4Address::new(10, 0, 0, 2);
        let dst = Ipv4Address::new(10, 0, 0, 1);
        table.input(src, dst, ICMP, b"zz");
        assert!(table.recv_from(a).unwrap().is_some());
        assert!(table.recv_from(b).unwrap().is_some());
    }

    #[test]
    fn bound_socket_filters_on_destination() {
        let mut table = Table::new();
        let h = table.open(ICMP).unwrap();
        table.bind(h, Some(Ipv4Address::new(10, 0, 0, 1))).unwrap();
        let src = Ipv4Address::new(10, 0, 0, 2);
        table.input(src, Ipv4Address::new(10, 0, 0, 9), ICMP, b"x");
        assert!(table.recv_from(h).unwrap().is_none());
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let mut table = Table::new();
        let h = table.open(ICMP).unwrap();
        let src = Ipv4Address::new(10, 0, 0, 2);
        let dst = Ipv4Address::new(10, 0, 0, 1);
        for i in 0..(RAW_MAX_RECV + 3) {
            table.input(src, dst, ICMP, &[i as u8]);
        }
        let first = table.recv_from(h).unwrap().unwrap();
        assert_eq!(first.data, vec![3u8]);
    }
}
