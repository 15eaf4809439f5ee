//! The TCP state machine: RFC 793's eleven states, a fixed
//! table of connection control blocks, and the send/receive buffers that
//! the BSD socket layer reads and writes. Retransmission, RTO estimation
//! and the output state machine live in [`output`] and [`rtt`]; this
//! module owns segment acceptability testing, state transitions, and the
//! buffers.

pub mod output;
pub mod rtt;

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info};

use crate::config;
use crate::error::{Error, Result};
use crate::sockwait::SockWait;
use crate::time::{Duration, Instant};
use crate::wire::{Ipv4Address, TcpFlags as Flags, TcpOption, TcpRepr, TcpSeqNumber as SeqNumber};

pub use output::Segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// What `input` determined the caller (the worker) needs to do next.
pub enum Outcome {
    /// Nothing external required beyond whatever `Table::poll_output`
    /// will pick up.
    Continue,
    /// A connection spawned from a `Listen` socket finished its handshake
    /// and is now sitting in that listener's accept backlog.
    NewConnection(TcpHandle),
    /// The peer reset the connection; it is now `Closed` and can be
    /// reclaimed once the application notices.
    Aborted(TcpHandle),
}

struct Tcb {
    state: State,
    local_addr: Ipv4Address,
    local_port: u16,
    remote_addr: Ipv4Address,
    remote_port: u16,

    snd_una: SeqNumber,
    snd_nxt: SeqNumber,
    snd_wnd: u16,
    snd_wl1: SeqNumber,
    snd_wl2: SeqNumber,
    iss: SeqNumber,

    rcv_nxt: SeqNumber,
    rcv_wnd: u16,
    irs: SeqNumber,

    mss: u16,

    /// Bytes from `snd_una` onward: `snd_nxt - snd_una` of them have
    /// already been transmitted at least once (awaiting ACK), the rest
    /// are queued but unsent. Does not include the FIN, which is tracked
    /// purely in sequence-space via `fin_sent`.
    send_buf: VecDeque<u8>,
    /// In-order bytes delivered but not yet read by the application.
    recv_buf: VecDeque<u8>,
    /// The peer's FIN has been processed; `recv` reports end-of-stream
    /// once `recv_buf` drains.
    fin_received: bool,

    rtt: rtt::Estimator,
    out_state: output::OutputState,
    dup_acks: u8,
    /// An ACK is owed to the peer (data or FIN arrived, or an
    /// out-of-window segment needs the current state re-advertised);
    /// cleared by the next segment `poll` emits, since every segment
    /// carries the ACK field.
    ack_pending: bool,
    /// Three duplicate ACKs observed: the next `poll` resends the segment
    /// at `snd_una` immediately, without RTO backoff.
    fast_rexmit: bool,
    /// Set once the segment currently occupying `last_send_time` has been
    /// retransmitted, so its ACK is excluded from the RTT sample (Karn's
    /// algorithm).
    retransmitted: bool,
    last_send_time: Option<Instant>,
    rexmit_deadline: Option<Instant>,
    persist_deadline: Option<Instant>,
    keepalive_deadline: Option<Instant>,
    time_wait_deadline: Option<Instant>,
    syn_retries: u8,
    rexmit_retries: u8,
    persist_retries: u8,
    fin_sent: bool,

    keep_enabled: bool,
    keep_idle: Duration,
    keep_intvl: Duration,
    keep_cnt: u8,
    keepalive_probes: u8,

    snd_wait: Arc<SockWait>,
    rcv_wait: Arc<SockWait>,
    conn_wait: Arc<SockWait>,

    /// Set once an orderly close has been requested locally; drives the
    /// FIN into the output stream once `send_buf` drains.
    close_requested: bool,
    /// For a TCB spawned from a `Listen` socket, the listener it reports
    /// to once the handshake completes.
    listener: Option<TcpHandle>,
    /// `Listen` sockets collect fully-handshaken connections here for
    /// `accept` to drain; any other state leaves this empty.
    accept_backlog: VecDeque<TcpHandle>,
    backlog_cap: usize,
}

impl Tcb {
    fn new(local_addr: Ipv4Address, local_port: u16, iss: SeqNumber) -> Tcb {
        Tcb {
            state: State::Closed,
            local_addr,
            local_port,
            remote_addr: Ipv4Address::UNSPECIFIED,
            remote_port: 0,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: SeqNumber(0),
            snd_wl2: SeqNumber(0),
            iss,
            rcv_nxt: SeqNumber(0),
            rcv_wnd: config::TCP_RBUF_SIZE as u16,
            irs: SeqNumber(0),
            mss: config::TCP_DEFAULT_MSS as u16,
            send_buf: VecDeque::new(),
            recv_buf: VecDeque::new(),
            fin_received: false,
            rtt: rtt::Estimator::new(config::TCP_INIT_RTO),
            out_state: output::OutputState::Idle,
            dup_acks: 0,
            ack_pending: false,
            fast_rexmit: false,
            retransmitted: false,
            last_send_time: None,
            rexmit_deadline: None,
            persist_deadline: None,
            keepalive_deadline: None,
            time_wait_deadline: None,
            syn_retries: 0,
            rexmit_retries: 0,
            persist_retries: 0,
            fin_sent: false,
            keep_enabled: false,
            keep_idle: config::TCP_KEEPALIVE_TIME,
            keep_intvl: config::TCP_KEEPALIVE_INTVL,
            keep_cnt: config::TCP_KEEPALIVE_PROBES,
            keepalive_probes: 0,
            snd_wait: SockWait::new(),
            rcv_wait: SockWait::new(),
            conn_wait: SockWait::new(),
            close_requested: false,
            listener: None,
            accept_backlog: VecDeque::new(),
            backlog_cap: 0,
        }
    }

    fn unsent_len(&self) -> usize {
        self.send_buf.len() - (self.snd_nxt - self.snd_una).max(0) as usize
    }

    fn send_window_available(&self) -> usize {
        let in_flight = (self.snd_nxt - self.snd_una).max(0) as usize;
        (self.snd_wnd as usize).saturating_sub(in_flight)
    }

    fn set_state(&mut self, next: State) {
        if self.state != next {
            debug!(
                target: "net::tcp",
                "{}:{} <-> {}:{} {:?} -> {:?}",
                self.local_addr, self.local_port, self.remote_addr, self.remote_port,
                self.state, next
            );
            self.state = next;
        }
    }
}

pub struct Table {
    tcbs: Vec<Option<Tcb>>,
    next_ephemeral: u16,
}

impl Table {
    pub fn new() -> Table {
        Table {
            tcbs: (0..config::TCP_MAX_NR).map(|_| None).collect(),
            next_ephemeral: 49152,
        }
    }

    fn alloc_slot(&mut self) -> Result<usize> {
        self.tcbs.iter().position(|t| t.is_none()).ok_or(Error::Full)
    }

    fn get(&self, h: TcpHandle) -> Result<&Tcb> {
        self.tcbs.get(h.0).and_then(|t| t.as_ref()).ok_or(Error::NotExist)
    }

    fn get_mut(&mut self, h: TcpHandle) -> Result<&mut Tcb> {
        self.tcbs.get_mut(h.0).and_then(|t| t.as_mut()).ok_or(Error::NotExist)
    }

    pub fn open(&mut self) -> Result<TcpHandle> {
        let idx = self.alloc_slot()?;
        self.tcbs[idx] = Some(Tcb::new(Ipv4Address::UNSPECIFIED, 0, SeqNumber(0)));
        Ok(TcpHandle(idx))
    }

    pub fn state(&self, h: TcpHandle) -> Result<State> {
        Ok(self.get(h)?.state)
    }

    /// Picks a local port no socket is using, from the dynamic range.
    pub fn ephemeral_port(&mut self) -> u16 {
        loop {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == u16::MAX { 49152 } else { port + 1 };
            if !self.tcbs.iter().flatten().any(|t| t.local_port == port) {
                return port;
            }
        }
    }

    pub fn listen(&mut self, h: TcpHandle, addr: Ipv4Address, port: u16, backlog: usize) -> Result<()> {
        if self
            .tcbs
            .iter()
            .flatten()
            .any(|t| t.state == State::Listen && t.local_port == port && t.local_addr == addr)
        {
            return Err(Error::Refused);
        }
        let tcb = self.get_mut(h)?;
        if tcb.state != State::Closed {
            return Err(Error::State);
        }
        tcb.local_addr = addr;
        tcb.local_port = port;
        tcb.backlog_cap = backlog.max(1);
        tcb.set_state(State::Listen);
        info!(target: "net::tcp", "listening on {}:{}", addr, port);
        Ok(())
    }

    /// Finds an existing non-`Listen` TCB matching the full four-tuple, for
    /// routing an inbound segment that isn't a listener's bare SYN.
    pub fn find_connection(
        &self,
        local_addr: Ipv4Address,
        local_port: u16,
        remote_addr: Ipv4Address,
        remote_port: u16,
    ) -> Option<TcpHandle> {
        self.tcbs
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (i, t)))
            .find(|(_, t)| {
                t.state != State::Listen
                    && t.local_port == local_port
                    && t.remote_port == remote_port
                    && t.remote_addr == remote_addr
                    && (t.local_addr == local_addr || t.local_addr == Ipv4Address::UNSPECIFIED)
            })
            .map(|(i, _)| TcpHandle(i))
    }

    /// Finds a `Listen` socket bound to `addr`/`port` (a specific-address
    /// bind wins over one bound to `UNSPECIFIED`).
    pub fn find_listener(&self, addr: Ipv4Address, port: u16) -> Option<TcpHandle> {
        self.tcbs
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (i, t)))
            .filter(|(_, t)| {
                t.state == State::Listen
                    && t.local_port == port
                    && (t.local_addr == addr || t.local_addr == Ipv4Address::UNSPECIFIED)
            })
            .max_by_key(|(_, t)| u8::from(t.local_addr == addr))
            .map(|(i, _)| TcpHandle(i))
    }

    /// Begins an active open: arms ISS and SYN, leaves transmission to
    /// `poll_output`.
    pub fn connect(
        &mut self,
        h: TcpHandle,
        local_addr: Ipv4Address,
        local_port: u16,
        remote_addr: Ipv4Address,
        remote_port: u16,
        iss: SeqNumber,
    ) -> Result<()> {
        let tcb = self.get_mut(h)?;
        if tcb.state != State::Closed {
            return Err(Error::State);
        }
        let (snd_wait, rcv_wait, conn_wait) =
            (tcb.snd_wait.clone(), tcb.rcv_wait.clone(), tcb.conn_wait.clone());
        *tcb = Tcb::new(local_addr, local_port, iss);
        tcb.snd_wait = snd_wait;
        tcb.rcv_wait = rcv_wait;
        tcb.conn_wait = conn_wait;
        tcb.remote_addr = remote_addr;
        tcb.remote_port = remote_port;
        tcb.set_state(State::SynSent);
        Ok(())
    }

    pub fn conn_wait(&self, h: TcpHandle) -> Result<Arc<SockWait>> {
        Ok(self.get(h)?.conn_wait.clone())
    }
    pub fn snd_wait(&self, h: TcpHandle) -> Result<Arc<SockWait>> {
        Ok(self.get(h)?.snd_wait.clone())
    }
    pub fn rcv_wait(&self, h: TcpHandle) -> Result<Arc<SockWait>> {
        Ok(self.get(h)?.rcv_wait.clone())
    }

    pub fn accept(&mut self, h: TcpHandle) -> Result<Option<TcpHandle>> {
        Ok(self.get_mut(h)?.accept_backlog.pop_front())
    }

    pub fn peer_addr(&self, h: TcpHandle) -> Result<(Ipv4Address, u16)> {
        let tcb = self.get(h)?;
        Ok((tcb.remote_addr, tcb.remote_port))
    }

    pub fn local_addr(&self, h: TcpHandle) -> Result<(Ipv4Address, u16)> {
        let tcb = self.get(h)?;
        Ok((tcb.local_addr, tcb.local_port))
    }

    pub fn set_keepalive(&mut self, h: TcpHandle, enabled: bool) -> Result<()> {
        self.get_mut(h)?.keep_enabled = enabled;
        Ok(())
    }

    pub fn set_keepalive_idle(&mut self, h: TcpHandle, idle: Duration) -> Result<()> {
        self.get_mut(h)?.keep_idle = idle;
        Ok(())
    }

    pub fn set_keepalive_interval(&mut self, h: TcpHandle, intvl: Duration) -> Result<()> {
        self.get_mut(h)?.keep_intvl = intvl;
        Ok(())
    }

    pub fn set_keepalive_count(&mut self, h: TcpHandle, cnt: u8) -> Result<()> {
        self.get_mut(h)?.keep_cnt = cnt;
        Ok(())
    }

    /// Queues up to `data.len()` bytes (bounded by `TCP_SBUF_SIZE`) for
    /// transmission, returning how many bytes were actually accepted.
    /// `Ok(0)` means the send buffer is full right now.
    pub fn send(&mut self, h: TcpHandle, data: &[u8]) -> Result<usize> {
        let tcb = self.get_mut(h)?;
        if !matches!(tcb.state, State::Established | State::CloseWait) {
            return Err(Error::State);
        }
        let room = config::TCP_SBUF_SIZE.saturating_sub(tcb.send_buf.len());
        let n = room.min(data.len());
        tcb.send_buf.extend(&data[..n]);
        Ok(n)
    }

    /// Copies up to `buf.len()` bytes out of the receive buffer.
    /// `Err(Error::None)` means no data is available yet (the caller
    /// should park on `rcv_wait`); `Err(Error::Eof)` means the peer's FIN
    /// has been seen and everything before it consumed.
    pub fn recv(&mut self, h: TcpHandle, buf: &mut [u8]) -> Result<usize> {
        let tcb = self.get_mut(h)?;
        if tcb.recv_buf.is_empty() {
            if tcb.fin_received {
                return Err(Error::Eof);
            }
            if tcb.state == State::Closed {
                return Err(Error::Close);
            }
            return Err(Error::None);
        }
        let n = buf.len().min(tcb.recv_buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = tcb.recv_buf.pop_front().unwrap();
        }
        tcb.rcv_wnd = (config::TCP_RBUF_SIZE - tcb.recv_buf.len()) as u16;
        Ok(n)
    }

    /// Requests an orderly close: a FIN is queued once `send_buf` drains.
    pub fn close(&mut self, h: TcpHandle) -> Result<()> {
        let tcb = self.get_mut(h)?;
        tcb.close_requested = true;
        match tcb.state {
            State::Listen | State::SynSent => {
                tcb.set_state(State::Closed);
                tcb.snd_wait.wake(Some(Error::Close));
                tcb.rcv_wait.wake(Some(Error::Close));
                tcb.conn_wait.wake(Some(Error::Close));
            }
            State::Established => tcb.set_state(State::FinWait1),
            State::CloseWait => tcb.set_state(State::LastAck),
            _ => {}
        }
        Ok(())
    }

    pub fn remove(&mut self, h: TcpHandle) {
        if let Some(slot) = self.tcbs.get_mut(h.0) {
            if let Some(tcb) = slot.take() {
                let err = Some(Error::Close);
                tcb.snd_wait.wake(err);
                tcb.rcv_wait.wake(err);
                tcb.conn_wait.wake(err);
            }
        }
    }

    /// Processes one inbound segment against `h`'s TCB (or, if `h` is a
    /// listening socket and the segment carries a bare SYN, spawns a new
    /// TCB for the embryonic connection, already bound to the peer via
    /// `src_addr`/`src_port`).
    pub fn input(
        &mut self,
        h: TcpHandle,
        src_addr: Ipv4Address,
        src_port: u16,
        repr: &TcpRepr,
        payload: &[u8],
        now: Instant,
    ) -> Result<Outcome> {
        let state = self.get(h)?.state;
        match state {
            State::Listen => self.input_listen(h, src_addr, src_port, repr),
            State::SynSent => self.input_syn_sent(h, repr),
            State::Closed => Err(Error::State),
            _ => self.input_established(h, repr, payload, now),
        }
    }

    fn input_listen(
        &mut self,
        h: TcpHandle,
        src_addr: Ipv4Address,
        src_port: u16,
        repr: &TcpRepr,
    ) -> Result<Outcome> {
        if !repr.flags.contains(Flags::SYN) || repr.flags.contains(Flags::ACK) {
            return Ok(Outcome::Continue);
        }
        let listener = self.get(h)?;
        let (local_addr, local_port, cap) =
            (listener.local_addr, listener.local_port, listener.backlog_cap);
        let embryonic = self
            .tcbs
            .iter()
            .flatten()
            .filter(|t| t.listener == Some(h))
            .count();
        if embryonic + self.get(h)?.accept_backlog.len() >= cap {
            debug!(target: "net::tcp", "backlog full on port {}, dropping SYN", local_port);
            return Ok(Outcome::Continue);
        }
        let idx = self.alloc_slot()?;
        let iss = output::generate_iss();
        let mut tcb = Tcb::new(local_addr, local_port, iss);
        tcb.remote_addr = src_addr;
        tcb.remote_port = src_port;
        tcb.irs = repr.seq_number;
        tcb.rcv_nxt = repr.seq_number + 1;
        tcb.snd_nxt = iss;
        tcb.snd_wnd = repr.window_len;
        tcb.snd_wl1 = repr.seq_number;
        tcb.set_state(State::SynReceived);
        tcb.listener = Some(h);
        for opt in &repr.options {
            if let TcpOption::Mss(mss) = opt {
                tcb.mss = *mss;
            }
        }
        self.tcbs[idx] = Some(tcb);
        Ok(Outcome::Continue)
    }

    fn input_syn_sent(&mut self, h: TcpHandle, repr: &TcpRepr) -> Result<Outcome> {
        let tcb = self.get_mut(h)?;
        let syn = repr.flags.contains(Flags::SYN);
        let ack = repr.flags.contains(Flags::ACK);
        let ack_acceptable = ack && repr.ack_number == tcb.iss + 1;
        if repr.flags.contains(Flags::RST) {
            // Only a RST answering our SYN aborts the attempt.
            if ack_acceptable {
                tcb.set_state(State::Closed);
                tcb.conn_wait.wake(Some(Error::Refused));
                return Ok(Outcome::Aborted(h));
            }
            return Ok(Outcome::Continue);
        }
        if ack && !ack_acceptable {
            return Ok(Outcome::Continue);
        }
        if !syn {
            return Ok(Outcome::Continue);
        }
        tcb.irs = repr.seq_number;
        tcb.rcv_nxt = repr.seq_number + 1;
        for opt in &repr.options {
            if let TcpOption::Mss(mss) = opt {
                tcb.mss = *mss;
            }
        }
        tcb.snd_nxt = tcb.iss + 1;
        tcb.ack_pending = true;
        if ack {
            tcb.snd_una = repr.ack_number;
            tcb.snd_wnd = repr.window_len;
            tcb.snd_wl1 = repr.seq_number;
            tcb.snd_wl2 = repr.ack_number;
            tcb.rexmit_deadline = None;
            tcb.set_state(State::Established);
            tcb.conn_wait.wake(None);
        } else {
            // Simultaneous open.
            tcb.set_state(State::SynReceived);
        }
        Ok(Outcome::Continue)
    }

    fn input_established(
        &mut self,
        h: TcpHandle,
        repr: &TcpRepr,
        payload: &[u8],
        now: Instant,
    ) -> Result<Outcome> {
        let (became_established, listener) = {
            let tcb = self.get_mut(h)?;
            if repr.flags.contains(Flags::RST) {
                info!(
                    target: "net::tcp",
                    "{}:{} reset by peer", tcb.remote_addr, tcb.remote_port
                );
                if tcb.listener.is_some() && tcb.state == State::SynReceived {
                    // No application ever saw this embryonic connection;
                    // let the reclaim sweep take the slot back.
                    tcb.close_requested = true;
                }
                tcb.set_state(State::Closed);
                tcb.snd_wait.wake(Some(Error::Close));
                tcb.rcv_wait.wake(Some(Error::Close));
                tcb.conn_wait.wake(Some(Error::Close));
                return Ok(Outcome::Aborted(h));
            }
            if tcb.state == State::SynReceived {
                if repr.flags.contains(Flags::ACK) && repr.ack_number == tcb.iss + 1 {
                    tcb.snd_una = repr.ack_number;
                    tcb.snd_nxt = tcb.iss + 1;
                    tcb.snd_wnd = repr.window_len;
                    tcb.snd_wl1 = repr.seq_number;
                    tcb.snd_wl2 = repr.ack_number;
                    tcb.rexmit_deadline = None;
                    tcb.set_state(State::Established);
                    tcb.conn_wait.wake(None);
                    (true, tcb.listener)
                } else {
                    (false, None)
                }
            } else {
                (false, None)
            }
        };
        if became_established {
            if let Some(lh) = listener {
                if let Ok(ltcb) = self.get_mut(lh) {
                    if ltcb.state == State::Listen {
                        ltcb.accept_backlog.push_back(h);
                        ltcb.conn_wait.wake(None);
                    }
                }
            }
            return Ok(Outcome::NewConnection(h));
        }

        let tcb = self.get_mut(h)?;

        // Acceptability test (RFC 793 §3.3): the segment must overlap the
        // receive window (or carry no data and sit exactly at rcv_nxt).
        let seg_len = payload.len() as u32;
        let in_window = if seg_len == 0 {
            (tcb.rcv_wnd == 0 && repr.seq_number == tcb.rcv_nxt)
                || (tcb.rcv_wnd > 0
                    && repr.seq_number >= tcb.rcv_nxt
                    && repr.seq_number < tcb.rcv_nxt + tcb.rcv_wnd as u32)
        } else {
            tcb.rcv_wnd > 0
                && ((repr.seq_number >= tcb.rcv_nxt
                    && repr.seq_number < tcb.rcv_nxt + tcb.rcv_wnd as u32)
                    || (repr.seq_number + (seg_len - 1) >= tcb.rcv_nxt
                        && repr.seq_number + (seg_len - 1) < tcb.rcv_nxt + tcb.rcv_wnd as u32))
        };
        if !in_window {
            // Re-advertise where we are so a desynchronized peer can
            // resynchronize (RFC 793's "send an acknowledgment" rule for
            // unacceptable segments).
            tcb.ack_pending = true;
            return Ok(Outcome::Continue);
        }

        if repr.flags.contains(Flags::ACK) {
            process_ack(tcb, repr, seg_len, now);
        }

        if seg_len > 0 {
            if repr.seq_number == tcb.rcv_nxt {
                let room = config::TCP_RBUF_SIZE.saturating_sub(tcb.recv_buf.len());
                let take = (seg_len as usize).min(room).min(payload.len());
                tcb.recv_buf.extend(&payload[..take]);
                tcb.rcv_nxt = tcb.rcv_nxt + take as u32;
                tcb.rcv_wnd = (config::TCP_RBUF_SIZE - tcb.recv_buf.len()) as u16;
                tcb.ack_pending = true;
                tcb.rcv_wait.wake(None);
            } else {
                // Out-of-order data is dropped (no reassembly queue); the
                // repeated cumulative ACK tells the peer to retransmit
                // from rcv_nxt.
                tcb.ack_pending = true;
            }
        }

        if repr.flags.contains(Flags::FIN) && repr.seq_number + seg_len == tcb.rcv_nxt {
            tcb.rcv_nxt = tcb.rcv_nxt + 1;
            tcb.fin_received = true;
            tcb.ack_pending = true;
            tcb.rcv_wait.wake(None);
            let next = match tcb.state {
                State::Established => State::CloseWait,
                State::FinWait1 => State::Closing,
                State::FinWait2 => {
                    tcb.time_wait_deadline = Some(now + config::TCP_TMO_MSL + config::TCP_TMO_MSL);
                    State::TimeWait
                }
                other => other,
            };
            tcb.set_state(next);
        }

        Ok(Outcome::Continue)
    }

    /// Runs all per-tick TCB housekeeping: TIME_WAIT expiry. Returns
    /// handles whose connection just finished tearing down and can be
    /// reclaimed.
    pub fn on_timer(&mut self, now: Instant) -> Vec<TcpHandle> {
        let mut done = Vec::new();
        for (idx, slot) in self.tcbs.iter_mut().enumerate() {
            let Some(tcb) = slot else { continue };
            if let Some(deadline) = tcb.time_wait_deadline {
                if now >= deadline {
                    done.push(TcpHandle(idx));
                }
            }
        }
        done
    }

    /// Collects whatever segments are ready to transmit across every
    /// TCB this tick (new data, ACKs, retransmissions, probes).
    pub fn poll_output(&mut self, now: Instant) -> Vec<Segment> {
        let mut out = Vec::new();
        for slot in self.tcbs.iter_mut() {
            if let Some(tcb) = slot {
                output::poll(tcb, now, &mut out);
            }
        }
        out
    }

    pub fn reclaim_closed(&mut self) {
        for slot in self.tcbs.iter_mut() {
            let closed = matches!(
                slot.as_ref().map(|t| (t.state, t.close_requested)),
                Some((State::Closed, true))
            );
            if closed {
                *slot = None;
            }
        }
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

/// Builds the RST answering a segment that matched no connection at all.
/// Segments that are themselves RSTs are never answered.
pub fn rst_reply(
    local_addr: Ipv4Address,
    remote_addr: Ipv4Address,
    repr: &TcpRepr,
    payload_len: usize,
) -> Option<Segment> {
    if repr.flags.contains(Flags::RST) {
        return None;
    }
    let seg_len = payload_len as u32
        + u32::from(repr.flags.contains(Flags::SYN))
        + u32::from(repr.flags.contains(Flags::FIN));
    let (seq, ack, flags) = if repr.flags.contains(Flags::ACK) {
        (repr.ack_number, SeqNumber(0), Flags::RST)
    } else {
        (SeqNumber(0), repr.seq_number + seg_len, Flags::RST | Flags::ACK)
    };
    Some(Segment {
        local_addr,
        local_port: repr.dst_port,
        remote_addr,
        remote_port: repr.src_port,
        seq,
        ack,
        flags,
        window: 0,
        mss: None,
        payload: Vec::new(),
    })
}

fn process_ack(tcb: &mut Tcb, repr: &TcpRepr, seg_len: u32, now: Instant) {
    if repr.ack_number <= tcb.snd_una {
        // A duplicate ACK in the fast-retransmit sense: no data, no
        // SYN/FIN, no window change, and something of ours in flight.
        if repr.ack_number == tcb.snd_una
            && (tcb.snd_nxt - tcb.snd_una).max(0) as usize > 0
            && seg_len == 0
            && seg_is_bare_ack(repr)
            && repr.window_len == tcb.snd_wnd
        {
            tcb.dup_acks += 1;
            if tcb.dup_acks >= config::TCP_DUPTHRESH {
                tcb.dup_acks = 0;
                tcb.fast_rexmit = true;
            }
        }
        update_send_window(tcb, repr);
        return;
    }
    if repr.ack_number > tcb.snd_nxt {
        return; // ACKs something not yet sent; ignore
    }
    let mut acked = (repr.ack_number - tcb.snd_una) as usize;
    if tcb.fin_sent && repr.ack_number == tcb.snd_nxt {
        // The FIN occupies one sequence number past the data.
        acked = acked.saturating_sub(1);
    }
    for _ in 0..acked.min(tcb.send_buf.len()) {
        tcb.send_buf.pop_front();
    }
    if !tcb.retransmitted {
        if let Some(sent_at) = tcb.last_send_time {
            tcb.rtt.sample(now.duration_since(sent_at));
        }
    }
    tcb.snd_una = repr.ack_number;
    tcb.dup_acks = 0;
    tcb.retransmitted = false;
    tcb.rexmit_retries = 0;
    tcb.keepalive_probes = 0;
    if tcb.keep_enabled {
        tcb.keepalive_deadline = Some(now + tcb.keep_idle);
    }
    if tcb.snd_una == tcb.snd_nxt {
        tcb.rexmit_deadline = None;
        tcb.last_send_time = None;
    } else {
        tcb.rexmit_deadline = Some(now + tcb.rtt.rto());
        tcb.last_send_time = Some(now);
    }
    update_send_window(tcb, repr);
    match tcb.state {
        State::FinWait1 if tcb.fin_sent && tcb.snd_una == tcb.snd_nxt => {
            tcb.set_state(State::FinWait2)
        }
        State::Closing if tcb.fin_sent && tcb.snd_una == tcb.snd_nxt => {
            tcb.time_wait_deadline = Some(now + config::TCP_TMO_MSL + config::TCP_TMO_MSL);
            tcb.set_state(State::TimeWait);
        }
        State::LastAck if tcb.fin_sent && tcb.snd_una == tcb.snd_nxt => {
            tcb.set_state(State::Closed)
        }
        _ => {}
    }
    tcb.snd_wait.wake(None);
}

fn seg_is_bare_ack(repr: &TcpRepr) -> bool {
    !repr.flags.contains(Flags::SYN) && !repr.flags.contains(Flags::FIN)
}

/// Takes the peer's advertised window from a segment, guarded against
/// reordered segments carrying stale values: accept iff `wl1 < seq`, or
/// `wl1 == seq` and `wl2 <= ack`.
fn update_send_window(tcb: &mut Tcb, repr: &TcpRepr) {
    if tcb.snd_wl1 < repr.seq_number
        || (tcb.snd_wl1 == repr.seq_number && tcb.snd_wl2 <= repr.ack_number)
    {
        let was_zero = tcb.snd_wnd == 0;
        tcb.snd_wnd = repr.window_len;
        tcb.snd_wl1 = repr.seq_number;
        tcb.snd_wl2 = repr.ack_number;
        if was_zero && tcb.snd_wnd > 0 {
            // Window reopened: leave persist mode and resume transmission
            // at snd_una, treating unacked probe bytes as never sent.
            let in_flight = (tcb.snd_nxt - tcb.snd_una).max(0) as usize;
            if tcb.fin_sent && in_flight > tcb.send_buf.len() {
                tcb.fin_sent = false;
            }
            tcb.snd_nxt = tcb.snd_una;
            tcb.persist_deadline = None;
            tcb.persist_retries = 0;
            tcb.rexmit_deadline = None;
            tcb.out_state = output::OutputState::Idle;
            tcb.snd_wait.wake(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(seq: u32, ack: Option<u32>, flags: Flags) -> TcpRepr {
        TcpRepr {
            src_port: 9000,
            dst_port: 80,
            seq_number: SeqNumber(seq),
            ack_number: SeqNumber(ack.unwrap_or(0)),
            flags,
            window_len: 10240,
            options: vec![TcpOption::Mss(1460)],
        }
    }

    fn connected_table() -> (Table, TcpHandle, Instant) {
        let mut table = Table::new();
        let h = table.open().unwrap();
        table
            .connect(
                h,
                Ipv4Address::new(10, 0, 0, 1),
                9000,
                Ipv4Address::new(10, 0, 0, 2),
                80,
                SeqNumber(1000),
            )
            .unwrap();
        let now = Instant::from_millis(0);
        table.poll_output(now);
        let synack = seg(5000, Some(1001), Flags::SYN | Flags::ACK);
        table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &synack, &[], now).unwrap();
        assert_eq!(table.state(h).unwrap(), State::Established);
        (table, h, now)
    }

    #[test]
    fn active_open_completes_three_way_handshake() {
        let mut table = Table::new();
        let h = table.open().unwrap();
        table
            .connect(
                h,
                Ipv4Address::new(10, 0, 0, 1),
                9000,
                Ipv4Address::new(10, 0, 0, 2),
                80,
                SeqNumber(1000),
            )
            .unwrap();
        assert_eq!(table.state(h).unwrap(), State::SynSent);

        let now = Instant::from_millis(0);
        let segs = table.poll_output(now);
        assert_eq!(segs.len(), 1);
        assert!(segs[0].flags.contains(Flags::SYN));
        assert_eq!(segs[0].seq, SeqNumber(1000));

        let synack = seg(5000, Some(1001), Flags::SYN | Flags::ACK);
        table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &synack, &[], now).unwrap();
        assert_eq!(table.state(h).unwrap(), State::Established);

        // The handshake completes with our ACK of the peer's SYN.
        let segs = table.poll_output(now);
        assert_eq!(segs.len(), 1);
        assert!(segs[0].flags.contains(Flags::ACK));
        assert_eq!(segs[0].ack, SeqNumber(5001));
    }

    #[test]
    fn rst_during_connect_refuses() {
        let mut table = Table::new();
        let h = table.open().unwrap();
        table
            .connect(
                h,
                Ipv4Address::new(10, 0, 0, 1),
                9000,
                Ipv4Address::new(10, 0, 0, 2),
                80,
                SeqNumber(1000),
            )
            .unwrap();
        let now = Instant::from_millis(0);
        table.poll_output(now);
        let conn_wait = table.conn_wait(h).unwrap();
        let rst = seg(0, Some(1001), Flags::RST | Flags::ACK);
        match table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &rst, &[], now).unwrap() {
            Outcome::Aborted(ah) => assert_eq!(ah, h),
            _ => panic!("expected abort"),
        }
        assert_eq!(conn_wait.wait(Some(Duration::from_millis(10))), Err(Error::Refused));
    }

    #[test]
    fn passive_open_spawns_child_and_reports_accept_backlog() {
        let mut table = Table::new();
        let l = table.open().unwrap();
        table.listen(l, Ipv4Address::UNSPECIFIED, 80, 4).unwrap();

        let now = Instant::from_millis(0);
        let syn_seg = seg(5000, None, Flags::SYN);
        table.input(l, Ipv4Address::new(10, 0, 0, 9), 4000, &syn_seg, &[], now).unwrap();
        assert_eq!(table.accept(l).unwrap(), None); // handshake not done yet

        let child = (0..config::TCP_MAX_NR)
            .map(TcpHandle)
            .find(|h| table.state(*h) == Ok(State::SynReceived))
            .unwrap();
        let segs = table.poll_output(now);
        assert!(segs.iter().any(|s| s.flags.contains(Flags::SYN) && s.flags.contains(Flags::ACK)));
        let synack = segs.iter().find(|s| s.flags.contains(Flags::SYN)).unwrap();

        let ack = seg(5001, Some(synack.seq.0 + 1), Flags::ACK);
        table.input(child, Ipv4Address::new(10, 0, 0, 9), 4000, &ack, &[], now).unwrap();
        assert_eq!(table.state(child).unwrap(), State::Established);
        assert_eq!(table.accept(l).unwrap(), Some(child));
    }

    #[test]
    fn send_and_ack_drains_buffer_and_wakes_waiter() {
        let (mut table, h, now) = connected_table();

        assert_eq!(table.send(h, b"hello").unwrap(), 5);
        let segs = table.poll_output(now + Duration::from_millis(10));
        // Handshake-completing ACK was never polled; data rides with it.
        let data_seg = segs.iter().find(|s| !s.payload.is_empty()).unwrap();
        assert_eq!(data_seg.payload, b"hello");
        assert_eq!(data_seg.seq, SeqNumber(1001));

        let ack = seg(5001, Some(1006), Flags::ACK);
        table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &ack, &[], now).unwrap();
    }

    #[test]
    fn received_data_is_acked_and_readable() {
        let (mut table, h, now) = connected_table();
        table.poll_output(now); // drain the handshake ACK

        let data = seg(5001, Some(1001), Flags::ACK | Flags::PSH);
        table
            .input(h, Ipv4Address::new(10, 0, 0, 2), 80, &data, b"abcdef", now)
            .unwrap();
        let segs = table.poll_output(now);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].ack, SeqNumber(5007));

        let mut buf = [0u8; 16];
        assert_eq!(table.recv(h, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"abcdef");
        assert_eq!(table.recv(h, &mut buf), Err(Error::None));
    }

    #[test]
    fn out_of_order_data_is_dropped_and_cum_acked() {
        let (mut table, h, now) = connected_table();
        table.poll_output(now);

        // A gap: segment at 5003 instead of 5001.
        let data = seg(5003, Some(1001), Flags::ACK);
        table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &data, b"cd", now).unwrap();
        let segs = table.poll_output(now);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].ack, SeqNumber(5001)); // unchanged cumulative ACK

        let mut buf = [0u8; 4];
        assert_eq!(table.recv(h, &mut buf), Err(Error::None));
    }

    #[test]
    fn fin_yields_eof_after_drain() {
        let (mut table, h, now) = connected_table();
        table.poll_output(now);

        let fin = seg(5001, Some(1001), Flags::ACK | Flags::FIN);
        table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &fin, b"xy", now).unwrap();
        assert_eq!(table.state(h).unwrap(), State::CloseWait);

        let mut buf = [0u8; 8];
        assert_eq!(table.recv(h, &mut buf).unwrap(), 2);
        assert_eq!(table.recv(h, &mut buf), Err(Error::Eof));
    }

    #[test]
    fn close_drives_fin_and_teardown() {
        let (mut table, h, now) = connected_table();
        table.poll_output(now);

        table.close(h).unwrap();
        assert_eq!(table.state(h).unwrap(), State::FinWait1);
        let segs = table.poll_output(now);
        assert!(segs[0].flags.contains(Flags::FIN));
        assert_eq!(segs[0].seq, SeqNumber(1001));

        let fin_ack = seg(5001, Some(1002), Flags::ACK);
        table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &fin_ack, &[], now).unwrap();
        assert_eq!(table.state(h).unwrap(), State::FinWait2);

        let peer_fin = seg(5001, Some(1002), Flags::FIN | Flags::ACK);
        table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &peer_fin, &[], now).unwrap();
        assert_eq!(table.state(h).unwrap(), State::TimeWait);

        // TIME_WAIT holds for 2 MSL, then the TCB is reclaimed.
        let not_yet = now + config::TCP_TMO_MSL;
        assert!(table.on_timer(not_yet).is_empty());
        let expired = now + config::TCP_TMO_MSL + config::TCP_TMO_MSL;
        assert_eq!(table.on_timer(expired), vec![h]);
    }

    #[test]
    fn zero_window_enters_persist_and_recovers() {
        let (mut table, h, mut now) = connected_table();
        table.poll_output(now);

        // Peer closes its window.
        let zero = TcpRepr {
            window_len: 0,
            ..seg(5001, Some(1001), Flags::ACK)
        };
        table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &zero, &[], now).unwrap();

        table.send(h, b"stuck").unwrap();
        let segs = table.poll_output(now);
        assert_eq!(segs.len(), 1, "first persist probe is immediate");
        assert_eq!(segs[0].payload, b"s");

        // Probes repeat at the persist interval, not faster.
        assert!(table.poll_output(now + Duration::from_millis(500)).is_empty());
        now = now + config::TCP_PERSIST_TMO;
        let segs = table.poll_output(now);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].seq, SeqNumber(1001), "probe resends from snd_una");

        // Window reopens: transmission resumes from snd_una.
        let open = seg(5001, Some(1001), Flags::ACK);
        table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &open, &[], now).unwrap();
        let segs = table.poll_output(now);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].seq, SeqNumber(1001));
        assert_eq!(segs[0].payload, b"stuck");
    }

    #[test]
    fn rto_expiry_retransmits_with_backoff() {
        let (mut table, h, now) = connected_table();
        table.poll_output(now);

        table.send(h, b"data!").unwrap();
        let segs = table.poll_output(now);
        assert_eq!(segs.len(), 1);

        // No ACK: after the initial RTO the same bytes go out again.
        let after_rto = now + config::TCP_INIT_RTO;
        let segs = table.poll_output(after_rto);
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].seq, SeqNumber(1001));
        assert_eq!(segs[0].payload, b"data!");

        // Backoff doubles the wait before the next retry.
        assert!(table
            .poll_output(after_rto + config::TCP_INIT_RTO)
            .is_empty());
        let segs = table.poll_output(after_rto + config::TCP_INIT_RTO + config::TCP_INIT_RTO);
        assert_eq!(segs.len(), 1);
    }

    #[test]
    fn three_dup_acks_trigger_fast_retransmit() {
        let (mut table, h, now) = connected_table();
        table.poll_output(now);

        table.send(h, b"0123456789").unwrap();
        table.poll_output(now);

        let dup = seg(5001, Some(1001), Flags::ACK);
        for _ in 0..3 {
            table.input(h, Ipv4Address::new(10, 0, 0, 2), 80, &dup, &[], now).unwrap();
        }
        let segs = table.poll_output(now + Duration::from_millis(1));
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].seq, SeqNumber(1001));
        assert_eq!(segs[0].payload, b"0123456789");
    }

    #[test]
    fn rst_reply_answers_unmatched_segments() {
        let local = Ipv4Address::new(10, 0, 0, 1);
        let remote = Ipv4Address::new(10, 0, 0, 2);
        let bare_syn = seg(7000, None, Flags::SYN);
        let rst = rst_reply(local, remote, &bare_syn, 0).unwrap();
        assert!(rst.flags.contains(Flags::RST));
        assert!(rst.flags.contains(Flags::ACK));
        assert_eq!(rst.ack, SeqNumber(7001));

        let with_ack = seg(7000, Some(1234), Flags::ACK);
        let rst = rst_reply(local, remote, &with_ack, 0).unwrap();
        assert_eq!(rst.seq, SeqNumber(1234));

        let incoming_rst = seg(7000, None, Flags::RST);
        assert!(rst_reply(local, remote, &incoming_rst, 0).is_none());
    }
}
