//! IPv4 input/output: header validation, fragmentation and
//! reassembly, and route resolution for outbound datagrams. ICMP
//! generation lives in [`icmp`]; routing in [`route`]; reassembly state in
//! [`reassembly`].

pub mod icmp;
pub mod reassembly;
pub mod route;

use std::sync::Arc;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::netif::Netif;
use crate::pktbuf::{Pool, PktBuf};
use crate::time::Instant;
use crate::wire::{self, IpProtocol, Ipv4Address, Ipv4Repr};

pub use reassembly::Reassembler;
pub use route::{Route, Table as RouteTable};

/// What `input` determined should happen with a fully reassembled,
/// locally-destined datagram. `head` on the datagram variants carries the
/// raw IP header plus the first 8 payload bytes, exactly what an ICMP
/// destination-unreachable must echo if delivery fails upstream.
pub enum Delivery {
    Udp {
        src: Ipv4Address,
        dst: Ipv4Address,
        payload: PktBuf,
        head: Vec<u8>,
    },
    Tcp {
        src: Ipv4Address,
        dst: Ipv4Address,
        payload: PktBuf,
    },
    /// An ICMP message addressed to this host; payload still includes the
    /// ICMP header.
    Icmp {
        src: Ipv4Address,
        payload: PktBuf,
    },
    /// A protocol this stack has no built-in handler for; raw sockets get
    /// a chance at it before a protocol-unreachable goes back.
    Other {
        src: Ipv4Address,
        dst: Ipv4Address,
        protocol: u8,
        payload: PktBuf,
        head: Vec<u8>,
    },
    /// Nothing further to do (packet absorbed, e.g. mid-reassembly, or
    /// silently dropped).
    Nothing,
}

/// A routed datagram, framed and fragmented as needed, ready to hand to
/// `link::ether_out` one packet at a time.
pub struct Outgoing {
    /// The next hop: the destination itself when directly connected,
    /// otherwise the route's gateway.
    pub dst: Ipv4Address,
    pub netif: crate::netif::NetifId,
    pub pkts: Vec<PktBuf>,
}

/// Parses and validates the IPv4 header, handles fragmentation, and —
/// once a datagram is whole — classifies it for upper-layer delivery.
/// `pkt` is the Ethernet payload (IP header at offset 0).
pub fn input(
    netif: &Netif,
    reassembler: &mut reassembly::Reassembler,
    mut pkt: PktBuf,
    now: Instant,
) -> Delivery {
    let raw = pkt.to_vec();
    let repr = match Ipv4Repr::parse(&raw) {
        Ok(r) => r,
        Err(e) => {
            warn!(target: "net::ipv4", "dropping bad header: {}", e);
            return Delivery::Nothing;
        }
    };
    // Only accept datagrams addressed to this interface or its
    // broadcast/limited-broadcast address; this host never forwards.
    let bcast = netif.ip_addr.subnet_broadcast(netif.netmask);
    if repr.dst_addr != netif.ip_addr && repr.dst_addr != bcast && !repr.dst_addr.is_broadcast() {
        return Delivery::Nothing;
    }
    let ihl = (raw[0] & 0x0f) as usize * 4;
    // Save what an ICMP error would need to echo before the header is
    // stripped: the header itself plus the first 8 payload bytes.
    let head = raw[..(ihl + 8).min(raw.len())].to_vec();

    // Drop link-layer padding (short Ethernet frames are padded to the
    // 60-byte minimum) so the transport sees exactly the IP payload.
    let datagram_len = ihl + repr.payload_len as usize;
    if pkt.total_size() > datagram_len && pkt.resize(datagram_len).is_err() {
        return Delivery::Nothing;
    }
    if pkt.remove_header(ihl).is_err() {
        return Delivery::Nothing;
    }
    // `pkt` now holds exactly `payload_len` bytes of IP payload, per the
    // length already validated during `Ipv4Repr::parse`.
    let complete = if repr.more_fragments || repr.frag_offset != 0 {
        match reassembler.insert(
            repr.src_addr,
            repr.dst_addr,
            repr.ident,
            repr.protocol,
            repr.frag_offset_bytes(),
            repr.more_fragments,
            pkt,
            now,
        ) {
            Some(whole) => whole,
            None => return Delivery::Nothing,
        }
    } else {
        pkt
    };

    match repr.protocol {
        IpProtocol::Udp => Delivery::Udp {
            src: repr.src_addr,
            dst: repr.dst_addr,
            payload: complete,
            head,
        },
        IpProtocol::Tcp => Delivery::Tcp {
            src: repr.src_addr,
            dst: repr.dst_addr,
            payload: complete,
        },
        IpProtocol::Icmp => Delivery::Icmp {
            src: repr.src_addr,
            payload: complete,
        },
        IpProtocol::Unknown(p) => Delivery::Other {
            src: repr.src_addr,
            dst: repr.dst_addr,
            protocol: p,
            payload: complete,
            head,
        },
    }
}

fn prepend_header(repr: &Ipv4Repr, payload: &mut PktBuf) -> Result<()> {
    let mut header = [0u8; wire::IPV4_HEADER_LEN];
    repr.emit(&mut header);
    payload.add_header(wire::IPV4_HEADER_LEN, true)?;
    payload.seek(0)?;
    payload.write(&header)?;
    payload.reset_acc();
    Ok(())
}

/// Frames `payload` as one IPv4 datagram over `route`, splitting it into
/// fragments when it would exceed the egress `mtu`. Fragment payload
/// sizes are the largest multiple of 8 that fits (1480 for an MTU of
/// 1500); every fragment but the last carries MF.
pub fn output(
    route: &Route,
    src: Ipv4Address,
    dest: Ipv4Address,
    protocol: IpProtocol,
    ident: u16,
    ttl: u8,
    mut payload: PktBuf,
    mtu: usize,
) -> Result<Outgoing> {
    let next_hop = route.gateway.unwrap_or(dest);
    let total = payload.total_size();

    if total + wire::IPV4_HEADER_LEN <= mtu {
        let repr = Ipv4Repr {
            src_addr: src,
            dst_addr: dest,
            protocol,
            payload_len: total as u16,
            ident,
            dont_fragment: false,
            more_fragments: false,
            frag_offset: 0,
            ttl,
        };
        prepend_header(&repr, &mut payload)?;
        return Ok(Outgoing {
            dst: next_hop,
            netif: route.netif,
            pkts: vec![payload],
        });
    }

    // Fragment offsets are in 8-byte units, so each fragment's payload
    // must be a multiple of 8 except the last.
    let max_frag = (mtu - wire::IPV4_HEADER_LEN) / 8 * 8;
    if max_frag == 0 {
        return Err(Error::Param);
    }
    let pool = payload.pool_handle();
    payload.reset_acc();
    let mut pkts = Vec::with_capacity((total + max_frag - 1) / max_frag);
    let mut offset = 0;
    while offset < total {
        let len = max_frag.min(total - offset);
        let more = offset + len < total;
        let mut chunk = vec![0u8; len];
        payload.read(&mut chunk)?;
        let mut pkt = alloc_outgoing(&pool, &chunk)?;
        let repr = Ipv4Repr {
            src_addr: src,
            dst_addr: dest,
            protocol,
            payload_len: len as u16,
            ident,
            dont_fragment: false,
            more_fragments: more,
            frag_offset: (offset / 8) as u16,
            ttl,
        };
        prepend_header(&repr, &mut pkt)?;
        pkts.push(pkt);
        offset += len;
    }
    debug!(target: "net::ipv4", "fragmented {} bytes into {} packets", total, pkts.len());
    Ok(Outgoing {
        dst: next_hop,
        netif: route.netif,
        pkts,
    })
}

/// Allocates a fresh pktbuf holding `payload` with room reserved for the
/// IPv4 + Ethernet headers that will be prepended on the way out.
pub fn alloc_outgoing(pool: &Arc<Pool>, payload: &[u8]) -> Result<PktBuf> {
    let headroom = wire::IPV4_HEADER_LEN + wire::ETHERNET_HEADER_LEN;
    let mut pkt = PktBuf::alloc(pool, payload.len(), headroom)?;
    pkt.write(payload)?;
    pkt.reset_acc();
    Ok(pkt)
}
