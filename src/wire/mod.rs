//! Wire formats: parsing untrusted bytes into value types (`*Repr`) and
//! serializing them back out. Every header in the stack is handled this
//! way rather than by casting a struct over a buffer, so a malformed
//! packet can only produce a parse error, never a misread field.

mod arp;
mod ethernet;
mod icmpv4;
mod ipv4;
mod tcp;
mod udp;

pub use arp::{
    Operation as ArpOperation, Repr as ArpRepr, HEADER_LEN as ARP_HEADER_LEN,
};
pub use ethernet::{
    Address as EthernetAddress, EtherType, Repr as EthernetRepr, HEADER_LEN as ETHERNET_HEADER_LEN,
};
pub use icmpv4::{DstUnreachable as Icmpv4DstUnreachable, Repr as Icmpv4Repr};
pub use ipv4::{Address as Ipv4Address, Repr as Ipv4Repr, HEADER_LEN as IPV4_HEADER_LEN};
pub use tcp::{
    Flags as TcpFlags, Repr as TcpRepr, SeqNumber as TcpSeqNumber, TcpOption,
    HEADER_LEN as TCP_HEADER_LEN,
};
pub use udp::{Repr as UdpRepr, HEADER_LEN as UDP_HEADER_LEN};

use core::fmt;

/// Parsing failed: either malformed input or a feature this stack doesn't
/// implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError(pub &'static str);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire parse error: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

pub type ParseResult<T> = core::result::Result<T, ParseError>;

impl From<ParseError> for crate::error::Error {
    fn from(_: ParseError) -> crate::error::Error {
        crate::error::Error::Format
    }
}

/// The IANA protocol numbers this stack understands on top of IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Icmp,
    Udp,
    Tcp,
    Unknown(u8),
}

impl From<u8> for IpProtocol {
    fn from(v: u8) -> IpProtocol {
        match v {
            1 => IpProtocol::Icmp,
            17 => IpProtocol::Udp,
            6 => IpProtocol::Tcp,
            other => IpProtocol::Unknown(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(p: IpProtocol) -> u8 {
        match p {
            IpProtocol::Icmp => 1,
            IpProtocol::Udp => 17,
            IpProtocol::Tcp => 6,
            IpProtocol::Unknown(v) => v,
        }
    }
}
