//! ICMPv4 message generation on top of the datagram layer:
//! echo replies for `ip_in`-delivered echo requests, and destination-
//! unreachable notices for datagrams this host can't deliver or doesn't
//! understand.

use crate::wire::{Icmpv4DstUnreachable, Icmpv4Repr, Ipv4Address};

/// Builds the reply to an incoming echo request, swapping source and
/// destination at the IP layer is the caller's job (it owns the `Repr`);
/// this just mirrors the ICMP payload.
pub fn echo_reply(ident: u16, seq_no: u16, data: Vec<u8>) -> Icmpv4Repr {
    Icmpv4Repr::EchoReply { ident, seq_no, data }
}

/// Builds a destination-unreachable message carrying the offending
/// datagram's header plus first 8 bytes of payload, per RFC 792.
pub fn dst_unreachable(reason: Icmpv4DstUnreachable, original_datagram: &[u8]) -> Icmpv4Repr {
    let payload_len = original_datagram.len().min(28);
    Icmpv4Repr::DstUnreachable {
        reason,
        payload: original_datagram[..payload_len].to_vec(),
    }
}

pub fn port_unreachable(original_datagram: &[u8]) -> Icmpv4Repr {
    dst_unreachable(Icmpv4DstUnreachable::Port, original_datagram)
}

pub fn protocol_unreachable(original_datagram: &[u8]) -> Icmpv4Repr {
    dst_unreachable(Icmpv4DstUnreachable::Protocol, original_datagram)
}

/// Whether `dest` should ever receive an ICMP error (never for broadcast
/// or multicast, per RFC 1122 §3.2.2 — generating one would storm the
/// subnet).
pub fn may_report_unreachable(dest: Ipv4Address, broadcast: Ipv4Address) -> bool {
    !dest.is_broadcast() && !dest.is_multicast() && dest != broadcast
}
