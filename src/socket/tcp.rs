//! Stream sockets: the blocking face of the TCP state machine.
//!
//! Each call marshals the table operation to the worker and, when the
//! protocol can't satisfy it yet, parks on one of the TCB's three waits:
//! `conn_wait` (connect/accept), `snd_wait` (buffer space), `rcv_wait`
//! (data or FIN). Protocol events on the worker thread wake the parked
//! caller, which then re-runs the operation.

use crate::error::{Error, Result};
use crate::tcp::{output, TcpHandle};
use crate::time::Duration;
use crate::wire::Ipv4Address;
use crate::worker::Stack;

use super::SocketAddr;

/// A TCP socket. One type serves both roles, as in BSD: `connect` makes
/// it a client, `bind` + `listen` + `accept` a server (with `accept`
/// returning a fresh `TcpSocket` per connection).
pub struct TcpSocket {
    stack: Stack,
    handle: TcpHandle,
    local: Option<SocketAddr>,
    rcv_tmo: Option<Duration>,
    snd_tmo: Option<Duration>,
}

impl TcpSocket {
    pub fn open(stack: &Stack) -> Result<TcpSocket> {
        let handle = stack.exec(|core| core.tcp.open())??;
        Ok(TcpSocket {
            stack: stack.clone(),
            handle,
            local: None,
            rcv_tmo: None,
            snd_tmo: None,
        })
    }

    fn from_handle(stack: Stack, handle: TcpHandle) -> TcpSocket {
        TcpSocket {
            stack,
            handle,
            local: None,
            rcv_tmo: None,
            snd_tmo: None,
        }
    }

    /// Records the local address/port for a subsequent `listen`. The
    /// unspecified address accepts connections on any interface.
    pub fn bind(&mut self, addr: Ipv4Address, port: u16) -> Result<()> {
        self.local = Some(SocketAddr::new(addr, port));
        Ok(())
    }

    pub fn set_recv_timeout(&mut self, tmo: Option<Duration>) {
        self.rcv_tmo = tmo;
    }

    pub fn set_send_timeout(&mut self, tmo: Option<Duration>) {
        self.snd_tmo = tmo;
    }

    /// Enables or disables keepalive probing (`SO_KEEPALIVE`).
    pub fn set_keepalive(&self, enabled: bool) -> Result<()> {
        let h = self.handle;
        self.stack.exec(move |core| core.tcp.set_keepalive(h, enabled))?
    }

    /// Idle time before the first keepalive probe (`TCP_KEEPIDLE`).
    pub fn set_keepalive_idle(&self, idle: Duration) -> Result<()> {
        let h = self.handle;
        self.stack.exec(move |core| core.tcp.set_keepalive_idle(h, idle))?
    }

    /// Interval between unanswered probes (`TCP_KEEPINTVL`).
    pub fn set_keepalive_interval(&self, intvl: Duration) -> Result<()> {
        let h = self.handle;
        self.stack
            .exec(move |core| core.tcp.set_keepalive_interval(h, intvl))?
    }

    /// Unanswered probes tolerated before the connection aborts
    /// (`TCP_KEEPCNT`).
    pub fn set_keepalive_count(&self, cnt: u8) -> Result<()> {
        let h = self.handle;
        self.stack.exec(move |core| core.tcp.set_keepalive_count(h, cnt))?
    }

    /// Actively opens a connection to `peer`, blocking until the
    /// handshake completes, the peer refuses, or the timeout fires.
    pub fn connect(&mut self, peer: SocketAddr) -> Result<()> {
        let h = self.handle;
        let local = self.local;
        let wait = self.stack.exec(move |core| {
            let local_addr = match local {
                Some(sa) if !sa.addr.is_unspecified() => sa.addr,
                _ => core.source_for(peer.addr)?,
            };
            let local_port = match local {
                Some(sa) if sa.port != 0 => sa.port,
                _ => core.tcp.ephemeral_port(),
            };
            let iss = output::generate_iss();
            core.tcp
                .connect(h, local_addr, local_port, peer.addr, peer.port, iss)?;
            core.tcp.conn_wait(h)
        })??;
        wait.wait(self.rcv_tmo)?;
        Ok(())
    }

    /// Moves a bound socket into the listening state with room for
    /// `backlog` not-yet-accepted connections.
    pub fn listen(&self, backlog: usize) -> Result<()> {
        let bound = self.local.ok_or(Error::Param)?;
        let h = self.handle;
        self.stack
            .exec(move |core| core.tcp.listen(h, bound.addr, bound.port, backlog))?
    }

    /// Blocks until a connection finishes its handshake and returns a
    /// socket for it.
    pub fn accept(&self) -> Result<TcpSocket> {
        let h = self.handle;
        loop {
            if let Some(child) = self.stack.exec(move |core| core.tcp.accept(h))?? {
                return Ok(TcpSocket::from_handle(self.stack.clone(), child));
            }
            let wait = self.stack.exec(move |core| core.tcp.conn_wait(h))??;
            wait.wait(self.rcv_tmo)?;
        }
    }

    /// Sends all of `data`, blocking whenever the send buffer is full,
    /// and returns `data.len()` once everything is queued for
    /// transmission.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let h = self.handle;
        let mut sent = 0;
        while sent < data.len() {
            let chunk = data[sent..].to_vec();
            let n = self.stack.exec(move |core| core.tcp.send(h, &chunk))??;
            sent += n;
            if n == 0 {
                let wait = self.stack.exec(move |core| core.tcp.snd_wait(h))??;
                wait.wait(self.snd_tmo)?;
            }
        }
        Ok(sent)
    }

    /// Receives into `buf`, blocking until at least one byte is
    /// available. Returns `Ok(0)` at end-of-stream (the peer sent FIN
    /// and everything before it has been read).
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let h = self.handle;
        let cap = buf.len();
        loop {
            let got = self.stack.exec(move |core| {
                let mut tmp = vec![0u8; cap];
                match core.tcp.recv(h, &mut tmp) {
                    Ok(n) => {
                        tmp.truncate(n);
                        Ok(tmp)
                    }
                    Err(e) => Err(e),
                }
            })?;
            match got {
                Ok(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    return Ok(bytes.len());
                }
                Err(Error::Eof) => return Ok(0),
                Err(Error::None) => {
                    let wait = self.stack.exec(move |core| core.tcp.rcv_wait(h))??;
                    wait.wait(self.rcv_tmo)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let h = self.handle;
        let (addr, port) = self.stack.exec(move |core| core.tcp.peer_addr(h))??;
        Ok(SocketAddr::new(addr, port))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let h = self.handle;
        let (addr, port) = self.stack.exec(move |core| core.tcp.local_addr(h))??;
        Ok(SocketAddr::new(addr, port))
    }

    /// Begins an orderly close; queued data (and then a FIN) still go
    /// out. The TCB is reclaimed once the far side finishes the
    /// handshake or TIME_WAIT expires.
    pub fn close(self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&self) -> Result<()> {
        let h = self.handle;
        self.stack.exec(move |core| core.tcp.close(h))?
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}
