//! Connectionless datagram sockets.

use crate::error::{Error, Result};
use crate::time::Duration;
use crate::wire::Ipv4Address;
use crate::worker::Stack;

use super::SocketAddr;

/// A UDP socket: `bind`, `send_to`, `recv_from`, with optional receive
/// and send timeouts. `recv_from` blocks until a datagram arrives (or
/// the timeout fires); `send_to` binds an ephemeral local port on first
/// use if the application never bound one.
pub struct UdpSocket {
    stack: Stack,
    handle: crate::udp::UdpHandle,
    rcv_tmo: Option<Duration>,
}

impl UdpSocket {
    pub fn open(stack: &Stack) -> Result<UdpSocket> {
        let handle = stack.exec(|core| core.udp.open())??;
        Ok(UdpSocket {
            stack: stack.clone(),
            handle,
            rcv_tmo: None,
        })
    }

    /// Binds the local address/port. `None` for the address means "any
    /// local interface".
    pub fn bind(&self, addr: Option<Ipv4Address>, port: u16) -> Result<()> {
        let h = self.handle;
        self.stack.exec(move |core| core.udp.bind(h, addr, port))?
    }

    /// How long `recv_from` may block; `None` (the default) blocks
    /// forever.
    pub fn set_recv_timeout(&mut self, tmo: Option<Duration>) {
        self.rcv_tmo = tmo;
    }

    pub fn local_port(&self) -> Result<u16> {
        let h = self.handle;
        self.stack
            .exec(move |core| core.udp.local_port(h))?
            .ok_or(Error::NotExist)
    }

    pub fn send_to(&self, data: &[u8], peer: SocketAddr) -> Result<usize> {
        let h = self.handle;
        let owned = data.to_vec();
        self.stack.exec(move |core| {
            let src_port = core.udp.ensure_bound(h)?;
            let src_addr = match core.udp.local_addr(h) {
                Some(a) => a,
                None => core.source_for(peer.addr)?,
            };
            let now = core.now();
            core.send_udp_datagram(src_addr, src_port, peer.addr, peer.port, &owned, now)?;
            Ok(owned.len())
        })?
    }

    /// Receives one datagram, copying at most `buf.len()` bytes of it
    /// (the rest of an oversized datagram is discarded, per BSD
    /// semantics) and reporting the sender.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let h = self.handle;
        loop {
            if let Some(dgram) = self.stack.exec(move |core| core.udp.recv_from(h))?? {
                let n = buf.len().min(dgram.data.len());
                buf[..n].copy_from_slice(&dgram.data[..n]);
                return Ok((n, SocketAddr::new(dgram.src_addr, dgram.src_port)));
            }
            let wait = self
                .stack
                .exec(move |core| core.udp.recv_wait(h))?
                .ok_or(Error::NotExist)?;
            wait.wait(self.rcv_tmo)?;
        }
    }

    pub fn close(self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&self) -> Result<()> {
        let h = self.handle;
        self.stack.exec(move |core| core.udp.close(h))?
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}
