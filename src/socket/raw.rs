//! Raw IP sockets: datagrams of a whole protocol number, no transport
//! header. The ping demo is the canonical user — it sends ICMP echo
//! requests and reads every ICMP message the stack receives.

use crate::error::{Error, Result};
use crate::raw::RawHandle;
use crate::time::Duration;
use crate::wire::Ipv4Address;
use crate::worker::Stack;

pub struct RawSocket {
    stack: Stack,
    handle: RawHandle,
    rcv_tmo: Option<Duration>,
}

impl RawSocket {
    /// Opens a raw socket receiving (a copy of) every inbound IPv4
    /// payload carrying `protocol`.
    pub fn open(stack: &Stack, protocol: u8) -> Result<RawSocket> {
        let handle = stack.exec(move |core| core.raw.open(protocol))??;
        Ok(RawSocket {
            stack: stack.clone(),
            handle,
            rcv_tmo: None,
        })
    }

    /// Restricts reception to datagrams addressed to `addr`.
    pub fn bind(&self, addr: Ipv4Address) -> Result<()> {
        let h = self.handle;
        self.stack.exec(move |core| core.raw.bind(h, Some(addr)))?
    }

    pub fn set_recv_timeout(&mut self, tmo: Option<Duration>) {
        self.rcv_tmo = tmo;
    }

    /// Sends `data` as the full IP payload to `dst`.
    pub fn send_to(&self, data: &[u8], dst: Ipv4Address) -> Result<usize> {
        let h = self.handle;
        let owned = data.to_vec();
        self.stack.exec(move |core| {
            let protocol = core.raw.protocol(h)?;
            let src = core.source_for(dst)?;
            let now = core.now();
            core.send_raw_datagram(src, dst, protocol, &owned, now)?;
            Ok(owned.len())
        })?
    }

    /// Receives one datagram payload and its sender, blocking until one
    /// arrives or the timeout fires.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Ipv4Address)> {
        let h = self.handle;
        loop {
            if let Some(dgram) = self.stack.exec(move |core| core.raw.recv_from(h))?? {
                let n = buf.len().min(dgram.data.len());
                buf[..n].copy_from_slice(&dgram.data[..n]);
                return Ok((n, dgram.src_addr));
            }
            let wait = self
                .stack
                .exec(move |core| core.raw.recv_wait(h))?
                .ok_or(Error::NotExist)?;
            wait.wait(self.rcv_tmo)?;
        }
    }

    pub fn close(self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&self) -> Result<()> {
        let h = self.handle;
        self.stack.exec(move |core| core.raw.close(h))?
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}
