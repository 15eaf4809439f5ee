//! The single worker thread. Every mutable piece of protocol state —
//! interfaces, ARP cache, routes, reassembly buckets, socket tables, the
//! timer wheel — lives in one [`Core`], touched from exactly one thread.
//! Every other thread's view of the stack is a [`Stack`] handle: it
//! either marshals a closure in and blocks on a result cell
//! ([`Stack::exec`]), or, on the data path, parks on a `SockWait` until
//! the worker wakes it directly. The RPC boundary is a typed closure
//! rather than a tagged union of message structs; once inside the
//! worker, no locking of protocol state is required.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, info, warn};

use crate::arp;
use crate::checksum;
use crate::config;
use crate::error::{Error, Result};
use crate::ip::{self, icmp, Reassembler, Route, RouteTable};
use crate::link;
use crate::netif::{Netif, NetifId};
use crate::phy::{Device, Medium};
use crate::pktbuf::{PktBuf, Pool};
use crate::raw;
use crate::tcp;
use crate::time::{Clock, Duration, Instant};
use crate::timer::{TimerFlags, TimerList};
use crate::udp;
use crate::wire::{
    self, EthernetAddress, Icmpv4Repr, IpProtocol, Ipv4Address, TcpOption, TcpRepr, UdpRepr,
};

/// Everything the worker thread owns. `pub` fields are read and written
/// directly by closures handed to [`Stack::exec`]; there is no need for
/// getters on a type nothing outside the worker thread ever sees a
/// reference to concurrently.
pub struct Core {
    pub netifs: Vec<Netif>,
    pub routes: RouteTable,
    pub arp: arp::Table,
    pub reassembler: Reassembler,
    pub udp: udp::Table,
    pub tcp: tcp::Table,
    pub raw: raw::Table,
    pub timers: TimerList,
    pub pool: Arc<Pool>,
    clock: Clock,
    ident: u16,
}

impl Core {
    fn new(pool: Arc<Pool>) -> Core {
        Core {
            netifs: Vec::new(),
            routes: RouteTable::new(),
            arp: arp::Table::new(),
            reassembler: Reassembler::new(),
            udp: udp::Table::new(),
            tcp: tcp::Table::new(),
            raw: raw::Table::new(),
            timers: TimerList::new(),
            pool,
            clock: Clock::new(),
            ident: 1,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    fn next_ident(&mut self) -> u16 {
        let id = self.ident;
        self.ident = self.ident.wrapping_add(1);
        id
    }

    fn netif_for(&self, addr: Ipv4Address) -> Option<usize> {
        self.netifs.iter().position(|n| n.contains(addr))
    }

    /// The source address this host would use talking to `dst`: the
    /// address of the interface the route points out of.
    pub fn source_for(&self, dst: Ipv4Address) -> Result<Ipv4Address> {
        let route = self.routes.lookup(dst).ok_or(Error::Unreach)?;
        self.netifs
            .get(route.netif.0)
            .map(|n| n.ip_addr)
            .ok_or(Error::Unreach)
    }

    fn drain_netif(&mut self, id: NetifId) {
        let Some(netif) = self.netifs.get_mut(id.0) else { return };
        let frames = netif.take_in();
        netif.stats.rx_packets += frames.len() as u64;
        let now = self.clock.now();
        for frame in frames {
            self.process_frame(id, &frame, now);
        }
    }

    fn process_frame(&mut self, id: NetifId, frame: &[u8], now: Instant) {
        let Some(netif) = self.netifs.get(id.0) else { return };
        if netif.medium == Medium::Loopback {
            // Loopback frames carry no link header; they are IP datagrams.
            if let Ok(pkt) = PktBuf::from_slice(&self.pool, frame) {
                self.handle_ip(id, pkt, now);
            }
            return;
        }
        let our_hw = netif.hw_addr;
        let incoming = match link::ether_in(&self.pool, our_hw, frame) {
            Some(i) => i,
            None => return,
        };
        match incoming {
            link::Incoming::Arp(repr) => self.handle_arp(id, &repr, now),
            link::Incoming::Ipv4(pkt) => self.handle_ip(id, pkt, now),
            link::Incoming::Unhandled => {}
        }
    }

    fn handle_arp(&mut self, id: NetifId, repr: &wire::ArpRepr, now: Instant) {
        let flushed = self.arp.insert(repr.source_proto_addr, repr.source_hw_addr, now);
        for pkt in flushed {
            self.retransmit_resolved(repr.source_proto_addr, pkt, now);
        }
        if repr.operation == wire::ArpOperation::Request {
            if let Some(netif) = self.netifs.get(id.0) {
                if link::is_for_us(netif, repr) {
                    let frame = link::arp_reply(netif, repr);
                    self.netifs[id.0].send_frame(&frame);
                }
            }
        }
    }

    /// A queued outbound datagram whose next hop just resolved: re-run
    /// `ether_out` (which will now find the entry stable) and transmit.
    fn retransmit_resolved(&mut self, next_hop: Ipv4Address, pkt: PktBuf, now: Instant) {
        let Some(idx) = self.netif_for(next_hop) else { return };
        match link::ether_out(&self.netifs[idx], &mut self.arp, next_hop, false, pkt, now) {
            Ok(link::Outcome::Ready(frame)) => self.netifs[idx].send_frame(&frame.to_vec()),
            Ok(link::Outcome::Pending { target, send_request }) => {
                if send_request {
                    let req = link::arp_request(&self.netifs[idx], target);
                    self.netifs[idx].send_frame(&req);
                }
            }
            Err(_) => {}
        }
    }

    fn handle_ip(&mut self, id: NetifId, pkt: PktBuf, now: Instant) {
        let Some(netif) = self.netifs.get(id.0) else { return };
        match ip::input(netif, &mut self.reassembler, pkt, now) {
            ip::Delivery::Udp { src, dst, payload, head } => {
                self.handle_udp(src, dst, payload, head, now)
            }
            ip::Delivery::Tcp { src, dst, payload } => self.handle_tcp(src, dst, payload, now),
            ip::Delivery::Icmp { src, payload } => self.handle_icmp(id, src, payload, now),
            ip::Delivery::Other { src, dst, protocol, payload, head } => {
                let taken = self.raw.input(src, dst, protocol, &payload.to_vec());
                if !taken {
                    debug!(target: "net::ipv4", "no handler for protocol {}", protocol);
                    self.send_unreachable(dst, src, icmp::protocol_unreachable(&head), now);
                }
            }
            ip::Delivery::Nothing => {}
        }
    }

    fn handle_udp(
        &mut self,
        src: Ipv4Address,
        dst: Ipv4Address,
        payload: PktBuf,
        head: Vec<u8>,
        now: Instant,
    ) {
        let data = payload.to_vec();
        let (repr, body) = match wire::UdpRepr::parse(&data, src, dst) {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "net::udp", "dropping datagram from {}: {}", src, e);
                return;
            }
        };
        let delivered = self
            .udp
            .input(src, repr.src_port, dst, repr.dst_port, body.to_vec());
        if !delivered {
            debug!(target: "net::udp", "no socket on port {}", repr.dst_port);
            self.send_unreachable(dst, src, icmp::port_unreachable(&head), now);
        }
    }

    fn handle_tcp(&mut self, src: Ipv4Address, dst: Ipv4Address, payload: PktBuf, now: Instant) {
        let data = payload.to_vec();
        let mut acc = checksum::pseudo_header(src, dst, 6, data.len() as u16);
        acc.add(&data);
        if acc.finish() != 0 {
            warn!(target: "net::tcp", "dropping segment from {}: bad checksum", src);
            return;
        }
        let (repr, body) = match TcpRepr::parse(&data) {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "net::tcp", "dropping segment from {}: {}", src, e);
                return;
            }
        };
        let handle = self
            .tcp
            .find_connection(dst, repr.dst_port, src, repr.src_port)
            .or_else(|| self.tcp.find_listener(dst, repr.dst_port));
        match handle {
            Some(h) => {
                let _ = self.tcp.input(h, src, repr.src_port, &repr, body, now);
            }
            None => {
                if let Some(rst) = tcp::rst_reply(dst, src, &repr, body.len()) {
                    let frame = Self::build_tcp_frame(&rst);
                    let _ = self.transmit(dst, src, IpProtocol::Tcp, 64, frame, now);
                }
            }
        }
        // Flush whatever the segment made due: ACKs of delivered data,
        // handshake replies, newly opened send window.
        self.drive_tcp(now);
    }

    fn handle_icmp(&mut self, id: NetifId, src: Ipv4Address, payload: PktBuf, now: Instant) {
        let data = payload.to_vec();
        let Some(netif) = self.netifs.get(id.0) else { return };
        let our_addr = netif.ip_addr;
        // Raw sockets see every ICMP message, echo replies included;
        // that is how a ping client is built on this stack.
        self.raw.input(src, our_addr, u8::from(IpProtocol::Icmp), &data);
        let repr = match Icmpv4Repr::parse(&data) {
            Ok(r) => r,
            Err(e) => {
                debug!(target: "net::icmp", "ignoring message from {}: {}", src, e);
                return;
            }
        };
        if let Icmpv4Repr::EchoRequest { ident, seq_no, data } = repr {
            let reply = icmp::echo_reply(ident, seq_no, data);
            let mut buf = vec![0u8; reply.buffer_len()];
            reply.emit(&mut buf);
            let _ = self.transmit(our_addr, src, IpProtocol::Icmp, 64, buf, now);
        }
    }

    fn send_unreachable(
        &mut self,
        our_addr: Ipv4Address,
        peer: Ipv4Address,
        repr: Icmpv4Repr,
        now: Instant,
    ) {
        let bcast = self
            .netif_for(our_addr)
            .map(|i| self.netifs[i].ip_addr.subnet_broadcast(self.netifs[i].netmask))
            .unwrap_or(Ipv4Address::BROADCAST);
        if !icmp::may_report_unreachable(our_addr, bcast) {
            return;
        }
        let mut buf = vec![0u8; repr.buffer_len()];
        repr.emit(&mut buf);
        let _ = self.transmit(our_addr, peer, IpProtocol::Icmp, 64, buf, now);
    }

    /// Builds the IPv4 (and, once routed, Ethernet) framing around
    /// `payload` and hands each resulting packet to the egress interface,
    /// queueing on a pending ARP entry (and emitting the request) when
    /// the next hop isn't resolved yet. Datagrams addressed to one of
    /// this host's own interfaces never touch a device; they re-enter the
    /// input path directly.
    pub fn transmit(
        &mut self,
        src: Ipv4Address,
        dst: Ipv4Address,
        protocol: IpProtocol,
        ttl: u8,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<()> {
        let ident = self.next_ident();
        let pkt = ip::alloc_outgoing(&self.pool, &payload)?;

        if let Some(idx) = self.netifs.iter().position(|n| n.ip_addr == dst) {
            let route = Route {
                dest: dst,
                mask: Ipv4Address::BROADCAST,
                gateway: None,
                netif: NetifId(idx),
            };
            let mtu = self.netifs[idx].mtu;
            let outgoing = ip::output(&route, src, dst, protocol, ident, ttl, pkt, mtu)?;
            for p in outgoing.pkts {
                self.handle_ip(NetifId(idx), p, now);
            }
            return Ok(());
        }

        let route = *self.routes.lookup(dst).ok_or(Error::Unreach)?;
        let idx = route.netif.0;
        let netif = self.netifs.get(idx).ok_or(Error::Unreach)?;
        let mtu = netif.mtu;
        let broadcast =
            dst.is_broadcast() || dst == netif.ip_addr.subnet_broadcast(netif.netmask);
        let outgoing = ip::output(&route, src, dst, protocol, ident, ttl, pkt, mtu)?;

        if self.netifs[idx].medium == Medium::Loopback {
            for p in outgoing.pkts {
                let frame = p.to_vec();
                self.netifs[idx].send_frame(&frame);
            }
            return Ok(());
        }

        for p in outgoing.pkts {
            match link::ether_out(&self.netifs[idx], &mut self.arp, outgoing.dst, broadcast, p, now)?
            {
                link::Outcome::Ready(frame) => self.netifs[idx].send_frame(&frame.to_vec()),
                link::Outcome::Pending { target, send_request } => {
                    if send_request {
                        let req = link::arp_request(&self.netifs[idx], target);
                        self.netifs[idx].send_frame(&req);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn send_udp_datagram(
        &mut self,
        src: Ipv4Address,
        src_port: u16,
        dst: Ipv4Address,
        dst_port: u16,
        data: &[u8],
        now: Instant,
    ) -> Result<()> {
        let repr = UdpRepr {
            src_port,
            dst_port,
            payload_len: data.len() as u16,
        };
        let mut buf = vec![0u8; wire::UDP_HEADER_LEN + data.len()];
        repr.emit(&mut buf, data, src, dst);
        self.transmit(src, dst, IpProtocol::Udp, 64, buf, now)
    }

    /// Sends `data` as the payload of a raw IP datagram with the given
    /// protocol number (raw sockets' transmit path).
    pub fn send_raw_datagram(
        &mut self,
        src: Ipv4Address,
        dst: Ipv4Address,
        protocol: u8,
        data: &[u8],
        now: Instant,
    ) -> Result<()> {
        self.transmit(src, dst, IpProtocol::from(protocol), 64, data.to_vec(), now)
    }

    fn build_tcp_frame(seg: &tcp::Segment) -> Vec<u8> {
        let options = match seg.mss {
            Some(mss) => vec![TcpOption::Mss(mss)],
            None => Vec::new(),
        };
        let repr = TcpRepr {
            src_port: seg.local_port,
            dst_port: seg.remote_port,
            seq_number: seg.seq,
            ack_number: seg.ack,
            flags: seg.flags,
            window_len: seg.window,
            options,
        };
        let hlen = repr.header_len();
        let mut buf = vec![0u8; hlen + seg.payload.len()];
        repr.emit(&mut buf[..hlen]);
        buf[hlen..].copy_from_slice(&seg.payload);
        let mut acc = checksum::pseudo_header(seg.local_addr, seg.remote_addr, 6, buf.len() as u16);
        acc.add(&buf);
        let sum = acc.finish();
        buf[16..18].copy_from_slice(&sum.to_be_bytes());
        buf
    }

    /// Runs every connection's output state machine and transmits
    /// whatever it produces; called after handling inbound segments (so
    /// ACKs reflect data just delivered), after every marshalled socket
    /// operation, and on the periodic tick.
    pub fn drive_tcp(&mut self, now: Instant) {
        for h in self.tcp.on_timer(now) {
            self.tcp.remove(h);
        }
        self.tcp.reclaim_closed();
        let segments = self.tcp.poll_output(now);
        for seg in segments {
            let frame = Self::build_tcp_frame(&seg);
            let _ = self.transmit(seg.local_addr, seg.remote_addr, IpProtocol::Tcp, 64, frame, now);
        }
    }

    /// Registers a freshly opened interface, installing its two routes:
    /// the directly-connected prefix and the host's own /32.
    fn install_netif(&mut self, netif: Netif) -> NetifId {
        let id = netif.id;
        self.routes.add(Route {
            dest: netif.ip_addr.mask_with(netif.netmask),
            mask: netif.netmask,
            gateway: None,
            netif: id,
        });
        self.routes.add(Route {
            dest: netif.ip_addr,
            mask: Ipv4Address::BROADCAST,
            gateway: None,
            netif: id,
        });
        info!(
            target: "net::netif",
            "{} up: {}/{} ({})",
            netif.name, netif.ip_addr, netif.netmask, netif.hw_addr
        );
        self.netifs.push(netif);
        id
    }

    fn deactivate_netif(&mut self, id: NetifId) {
        self.routes.remove_netif(id);
        if let Some(netif) = self.netifs.get_mut(id.0) {
            // Queued inbound frames die with the interface.
            let dropped = netif.take_in().len();
            netif.stats.rx_dropped += dropped as u64;
            netif.deactivate();
            info!(
                target: "net::netif",
                "{} down: rx {} tx {} dropped {}/{}",
                netif.name,
                netif.stats.rx_packets,
                netif.stats.tx_packets,
                netif.stats.rx_dropped,
                netif.stats.tx_dropped,
            );
        }
    }
}

/// A unit of work dispatched to the worker thread.
enum Msg {
    NetifIn(NetifId),
    Fun(Box<dyn FnOnce(&mut Core) + Send>),
}

/// A handle to the running worker thread. Cloning shares the same
/// underlying stack; the worker shuts down once every clone is dropped
/// and its channel closes.
#[derive(Clone)]
pub struct Stack {
    tx: Sender<Msg>,
    pool: Arc<Pool>,
}

struct ResultCell<R> {
    value: Mutex<Option<R>>,
    cond: Condvar,
}

impl Stack {
    /// Spawns the worker thread with an empty `Core` (no interfaces, no
    /// routes) and returns a handle to it. Callers add interfaces with
    /// [`Stack::add_netif`] before the stack can send or receive
    /// anything.
    pub fn spawn(pool: Arc<Pool>) -> Stack {
        let (tx, rx) = mpsc::channel::<Msg>();
        let worker_pool = pool.clone();
        thread::spawn(move || Self::run(rx, worker_pool));
        Stack { tx, pool }
    }

    pub fn pool(&self) -> Arc<Pool> {
        self.pool.clone()
    }

    /// Runs `f` on the worker thread with exclusive access to `Core`,
    /// blocking the caller until it completes. This is the one RPC
    /// primitive every blocking socket call is built from: `connect`,
    /// `send`, `recv` and friends marshal their table operation in as a
    /// closure and wait here (or, once queued, on a `SockWait`) for the
    /// worker to act on it.
    pub fn exec<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Core) -> R + Send + 'static,
    {
        let cell = Arc::new(ResultCell {
            value: Mutex::new(None),
            cond: Condvar::new(),
        });
        let reply = cell.clone();
        let job: Box<dyn FnOnce(&mut Core) + Send> = Box::new(move |core| {
            let result = f(core);
            *reply.value.lock().unwrap() = Some(result);
            reply.cond.notify_one();
        });
        self.tx.send(Msg::Fun(job)).map_err(|_| Error::Sys)?;
        let mut guard = cell.value.lock().unwrap();
        while guard.is_none() {
            guard = cell.cond.wait(guard).unwrap();
        }
        Ok(guard.take().unwrap())
    }

    /// Brings up a new interface. `device` is split up front into its
    /// rx/tx halves (see `phy`); opening it here starts the pump thread
    /// that will post `NetifIn` once traffic arrives.
    pub fn add_netif(
        &self,
        name: &'static str,
        hw_addr: EthernetAddress,
        ip_addr: Ipv4Address,
        netmask: Ipv4Address,
        device: Device,
    ) -> Result<NetifId> {
        let id = self.exec(|core| NetifId(core.netifs.len()))?;
        let tx = self.tx.clone();
        let notify_id = id;
        let mut netif = Netif::open(id, name, hw_addr, ip_addr, netmask, device, move || {
            let _ = tx.send(Msg::NetifIn(notify_id));
        });
        netif.activate();
        self.exec(move |core| {
            core.install_netif(netif);
        })?;
        Ok(id)
    }

    /// Installs (or replaces) the default route: traffic matching no
    /// better prefix goes to `gateway` out of `id`.
    pub fn set_default_gateway(&self, id: NetifId, gateway: Ipv4Address) -> Result<()> {
        self.exec(move |core| core.routes.set_default(id, gateway))
    }

    /// Takes an interface down: drops its routes and queued frames and
    /// stops transmission until it is activated again.
    pub fn deactivate_netif(&self, id: NetifId) -> Result<()> {
        self.exec(move |core| core.deactivate_netif(id))
    }

    fn run(rx: Receiver<Msg>, pool: Arc<Pool>) {
        let mut core = Core::new(pool);
        let tick = Duration::from_millis(config::TIMER_SCAN_PERIOD_MS);
        core.timers.add("arp", config::ARP_TIMER_TMO, TimerFlags::RELOAD, 0).ok();
        core.timers
            .add("frag", config::IP_FRAG_SCAN_PERIOD, TimerFlags::RELOAD, 0)
            .ok();
        core.timers.add("tcp", tick, TimerFlags::RELOAD, 0).ok();
        info!(target: "net::worker", "worker up");
        let mut last_tick = core.now();
        loop {
            let wait = core.timers.first_tmo().unwrap_or(tick);
            let msg = rx.recv_timeout(wait.into());
            let now = core.now();
            match msg {
                Ok(Msg::NetifIn(id)) => core.drain_netif(id),
                Ok(Msg::Fun(f)) => {
                    f(&mut core);
                    // A socket call may have queued data, a FIN, or a
                    // fresh SYN; get it on the wire without waiting for
                    // the next tick.
                    core.drive_tcp(now);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let diff = now.duration_since(last_tick);
            last_tick = now;
            for fired in core.timers.check_tmo(diff) {
                match fired.name {
                    "arp" => {
                        for target in core.arp.on_timer(now) {
                            if let Some(idx) = core.netif_for(target) {
                                let req = link::arp_request(&core.netifs[idx], target);
                                core.netifs[idx].send_frame(&req);
                            }
                        }
                    }
                    "frag" => core.reassembler.on_timer(now),
                    "tcp" => core.drive_tcp(now),
                    _ => {}
                }
            }
        }
        info!(target: "net::worker", "worker down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy;

    fn pool() -> Arc<Pool> {
        Arc::new(Pool::new(config::PKTBUF_BLK_CNT, config::PKTBUF_BUF_CNT))
    }

    #[test]
    fn exec_round_trips_a_value() {
        let stack = Stack::spawn(pool());
        let answer = stack.exec(|_core| 6 * 7).unwrap();
        assert_eq!(answer, 42);
    }

    #[test]
    fn udp_datagram_crosses_a_pair_of_stacks() {
        let (dev_a, dev_b) = phy::pair(1500);
        let stack_a = Stack::spawn(pool());
        let stack_b = Stack::spawn(pool());

        let addr_a = Ipv4Address::new(10, 0, 0, 1);
        let addr_b = Ipv4Address::new(10, 0, 0, 2);
        let mask = Ipv4Address::new(255, 255, 255, 0);
        stack_a
            .add_netif("eth0", EthernetAddress([1, 0, 0, 0, 0, 1]), addr_a, mask, dev_a)
            .unwrap();
        stack_b
            .add_netif("eth0", EthernetAddress([2, 0, 0, 0, 0, 2]), addr_b, mask, dev_b)
            .unwrap();

        let h = stack_b.exec(|core| core.udp.open().unwrap()).unwrap();
        stack_b.exec(move |core| core.udp.bind(h, None, 7000).unwrap()).unwrap();

        stack_a
            .exec(move |core| {
                let now = core.now();
                core.send_udp_datagram(addr_a, 6000, addr_b, 7000, b"ping", now).unwrap();
            })
            .unwrap();

        let recv_wait = stack_b.exec(move |core| core.udp.recv_wait(h).unwrap()).unwrap();
        recv_wait.wait(Some(Duration::from_millis(500))).unwrap();
        let datagram = stack_b
            .exec(move |core| core.udp.recv_from(h).unwrap())
            .unwrap()
            .expect("datagram delivered");
        assert_eq!(datagram.data, b"ping");
        assert_eq!(datagram.src_addr, addr_a);
    }

    #[test]
    fn datagram_to_own_address_loops_back_locally() {
        let stack = Stack::spawn(pool());
        let addr = Ipv4Address::new(192, 168, 1, 1);
        stack
            .add_netif(
                "eth0",
                EthernetAddress([1, 1, 1, 1, 1, 1]),
                addr,
                Ipv4Address::new(255, 255, 255, 0),
                phy::Loopback::new(1500),
            )
            .unwrap();

        let h = stack.exec(|core| core.udp.open().unwrap()).unwrap();
        stack.exec(move |core| core.udp.bind(h, None, 9000).unwrap()).unwrap();
        stack
            .exec(move |core| {
                let now = core.now();
                core.send_udp_datagram(addr, 9001, addr, 9000, b"self", now).unwrap();
            })
            .unwrap();
        let datagram = stack
            .exec(move |core| core.udp.recv_from(h).unwrap())
            .unwrap()
            .expect("delivered without touching the device");
        assert_eq!(datagram.data, b"self");
    }
}
