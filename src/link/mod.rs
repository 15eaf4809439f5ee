//! Ethernet framing and next-hop resolution: `ether_in`
//! strips the Ethernet header and dispatches by ethertype; `ether_out`
//! resolves the frame's destination hardware address (via ARP, unless the
//! destination is this host's own broadcast address) and prepends the
//! header.

use crate::arp;
use crate::error::Result;
use crate::netif::Netif;
use crate::pktbuf::PktBuf;
use crate::time::Instant;
use crate::wire::{self, EthernetAddress, EtherType, Ipv4Address};

pub enum Incoming {
    Arp(wire::ArpRepr),
    Ipv4(PktBuf),
    Unhandled,
}

/// Strips the Ethernet header and, for an IPv4 payload, lifts it into a
/// pool-backed [`PktBuf`] ready for `ip::input`. Frames whose source
/// address is this host's own are dropped. `frame` arrives as a plain
/// `Vec<u8>` from the netif's receive pump, not yet pool-backed; this is
/// the one place that cost is paid.
pub fn ether_in(
    pool: &std::sync::Arc<crate::pktbuf::Pool>,
    our_hw: EthernetAddress,
    frame: &[u8],
) -> Option<Incoming> {
    let (repr, payload) = wire::EthernetRepr::parse(frame).ok()?;
    if repr.src_addr == our_hw {
        return None;
    }
    match repr.ethertype {
        EtherType::Arp => wire::ArpRepr::parse(payload).ok().map(Incoming::Arp),
        EtherType::Ipv4 => PktBuf::from_slice(pool, payload).ok().map(Incoming::Ipv4),
        EtherType::Unknown(_) => Some(Incoming::Unhandled),
    }
}

/// Result of attempting to send an IPv4 datagram out an interface:
/// either the fully-framed Ethernet frame is ready to transmit, or
/// resolution is pending (`send_request` says whether this call started
/// it, i.e. whether an ARP request frame is owed).
pub enum Outcome {
    Ready(PktBuf),
    Pending { target: Ipv4Address, send_request: bool },
}

/// Resolves `next_hop`'s hardware address and prepends the Ethernet
/// header over `pkt` (an IPv4 datagram). If resolution is still pending,
/// `pkt` is queued in the ARP table and `Pending` is returned so the
/// caller can emit the request frame if one is owed.
pub fn ether_out(
    netif: &Netif,
    arp_table: &mut arp::Table,
    next_hop: Ipv4Address,
    broadcast: bool,
    mut pkt: PktBuf,
    now: Instant,
) -> Result<Outcome> {
    let dst_hw = if broadcast || next_hop.is_broadcast() {
        wire::EthernetAddress([0xff; 6])
    } else if let Some(hw) = arp_table.lookup(next_hop) {
        hw
    } else {
        // Not resolved yet: hand the datagram to the ARP table to queue;
        // it comes back once the entry completes, via `Table::insert`'s
        // return value.
        let send_request = arp_table.resolve(next_hop, pkt, now);
        return Ok(Outcome::Pending {
            target: next_hop,
            send_request,
        });
    };
    let repr = wire::EthernetRepr {
        dst_addr: dst_hw,
        src_addr: netif.hw_addr,
        ethertype: EtherType::Ipv4,
    };
    pkt.add_header(wire::ETHERNET_HEADER_LEN, true)?;
    let mut header = [0u8; wire::ETHERNET_HEADER_LEN];
    repr.emit(&mut header);
    pkt.seek(0)?;
    pkt.write(&header)?;
    pkt.reset_acc();
    Ok(Outcome::Ready(pkt))
}

pub const ARP_FRAME_LEN: usize = wire::ETHERNET_HEADER_LEN + wire::ARP_HEADER_LEN;

/// Builds the ARP request frame for `target`, to be sent via
/// `netif.send_frame`.
pub fn arp_request(netif: &Netif, target: Ipv4Address) -> Vec<u8> {
    let arp_repr = wire::ArpRepr {
        operation: wire::ArpOperation::Request,
        source_hw_addr: netif.hw_addr,
        source_proto_addr: netif.ip_addr,
        target_hw_addr: EthernetAddress([0; 6]),
        target_proto_addr: target,
    };
    let eth_repr = wire::EthernetRepr {
        dst_addr: EthernetAddress([0xff; 6]),
        src_addr: netif.hw_addr,
        ethertype: EtherType::Arp,
    };
    let mut frame = vec![0u8; ARP_FRAME_LEN];
    eth_repr.emit(&mut frame[..wire::ETHERNET_HEADER_LEN]);
    arp_repr.emit(&mut frame[wire::ETHERNET_HEADER_LEN..]);
    frame
}

/// Builds the ARP reply frame answering a request that targeted this
/// interface's address.
pub fn arp_reply(netif: &Netif, request: &wire::ArpRepr) -> Vec<u8> {
    let arp_repr = wire::ArpRepr {
        operation: wire::ArpOperation::Reply,
        source_hw_addr: netif.hw_addr,
        source_proto_addr: netif.ip_addr,
        target_hw_addr: request.source_hw_addr,
        target_proto_addr: request.source_proto_addr,
    };
    let eth_repr = wire::EthernetRepr {
        dst_addr: request.source_hw_addr,
        src_addr: netif.hw_addr,
        ethertype: EtherType::Arp,
    };
    let mut frame = vec![0u8; ARP_FRAME_LEN];
    eth_repr.emit(&mut frame[..wire::ETHERNET_HEADER_LEN]);
    arp_repr.emit(&mut frame[wire::ETHERNET_HEADER_LEN..]);
    frame
}

pub fn is_for_us(netif: &Netif, arp_repr: &wire::ArpRepr) -> bool {
    arp_repr.target_proto_addr == netif.ip_addr
}
