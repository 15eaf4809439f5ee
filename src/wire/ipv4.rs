//! IPv4: standard 20-byte header, 16-bit one's-complement
//! checksum over the header words.

use byteorder::{ByteOrder, NetworkEndian};

use super::{IpProtocol, ParseError, ParseResult};
use crate::checksum;

pub const HEADER_LEN: usize = 20;
pub const VERSION: u8 = 4;
pub const DEFAULT_TTL: u8 = 64;

pub const FLAG_DF: u16 = 0x4000;
pub const FLAG_MF: u16 = 0x2000;
pub const FRAG_OFFSET_MASK: u16 = 0x1fff;

/// A 32-bit IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; 4]);

impl Address {
    pub const UNSPECIFIED: Address = Address([0, 0, 0, 0]);
    pub const BROADCAST: Address = Address([255, 255, 255, 255]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Address {
        Address([a, b, c, d])
    }

    pub fn from_bytes(b: &[u8]) -> Address {
        Address([b[0], b[1], b[2], b[3]])
    }

    pub fn octets(&self) -> [u8; 4] {
        self.0
    }

    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn from_u32(v: u32) -> Address {
        Address(v.to_be_bytes())
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }

    /// The directed (subnet) broadcast address for `self`/`mask`.
    pub fn subnet_broadcast(&self, mask: Address) -> Address {
        Address::from_u32(self.to_u32() | !mask.to_u32())
    }

    pub fn mask_with(&self, mask: Address) -> Address {
        Address::from_u32(self.to_u32() & mask.to_u32())
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// A parsed IPv4 header. IP options are skipped on parse and never
/// emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repr {
    pub src_addr: Address,
    pub dst_addr: Address,
    pub protocol: IpProtocol,
    pub payload_len: u16,
    pub ident: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    pub frag_offset: u16,
    pub ttl: u8,
}

impl Repr {
    /// Parses the header, verifying version/IHL/total-length consistency
    /// and the header checksum. IP options (IHL > 5) are skipped, not
    /// retained.
    pub fn parse(data: &[u8]) -> ParseResult<Repr> {
        if data.len() < HEADER_LEN {
            return Err(ParseError("ipv4 header truncated"));
        }
        let version = data[0] >> 4;
        let ihl = (data[0] & 0x0f) as usize * 4;
        if version != VERSION {
            return Err(ParseError("not an ipv4 packet"));
        }
        if ihl < HEADER_LEN || ihl > data.len() {
            return Err(ParseError("ipv4 ihl out of range"));
        }
        let total_len = NetworkEndian::read_u16(&data[2..4]) as usize;
        if total_len < ihl || total_len > data.len() {
            return Err(ParseError("ipv4 total length inconsistent"));
        }
        if checksum::checksum(&data[..ihl]) != 0 {
            return Err(ParseError("ipv4 header checksum mismatch"));
        }
        let flags_frag = NetworkEndian::read_u16(&data[6..8]);
        Ok(Repr {
            src_addr: Address::from_bytes(&data[12..16]),
            dst_addr: Address::from_bytes(&data[16..20]),
            protocol: IpProtocol::from(data[9]),
            payload_len: (total_len - ihl) as u16,
            ident: NetworkEndian::read_u16(&data[4..6]),
            dont_fragment: flags_frag & FLAG_DF != 0,
            more_fragments: flags_frag & FLAG_MF != 0,
            frag_offset: flags_frag & FRAG_OFFSET_MASK,
            ttl: data[8],
        })
    }

    /// Emits a 20-byte header (no options) with a freshly computed
    /// checksum. `buf` must be exactly `HEADER_LEN` bytes.
    pub fn emit(&self, buf: &mut [u8]) {
        buf[0] = (VERSION << 4) | 5;
        buf[1] = 0;
        NetworkEndian::write_u16(&mut buf[2..4], HEADER_LEN as u16 + self.payload_len);
        NetworkEndian::write_u16(&mut buf[4..6], self.ident);
        let mut flags_frag = self.frag_offset & FRAG_OFFSET_MASK;
        if self.dont_fragment {
            flags_frag |= FLAG_DF;
        }
        if self.more_fragments {
            flags_frag |= FLAG_MF;
        }
        NetworkEndian::write_u16(&mut buf[6..8], flags_frag);
        buf[8] = self.ttl;
        buf[9] = u8::from(self.protocol);
        NetworkEndian::write_u16(&mut buf[10..12], 0);
        buf[12..16].copy_from_slice(&self.src_addr.octets());
        buf[16..20].copy_from_slice(&self.dst_addr.octets());
        let sum = checksum::checksum(&buf[..HEADER_LEN]);
        NetworkEndian::write_u16(&mut buf[10..12], sum);
    }

    pub fn frag_offset_bytes(&self) -> usize {
        self.frag_offset as usize * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let repr = Repr {
            src_addr: Address::new(192, 168, 74, 2),
            dst_addr: Address::new(192, 168, 74, 3),
            protocol: IpProtocol::Udp,
            payload_len: 8,
            ident: 42,
            dont_fragment: false,
            more_fragments: false,
            frag_offset: 0,
            ttl: 64,
        };
        let mut buf = [0u8; HEADER_LEN + 8];
        repr.emit(&mut buf[..HEADER_LEN]);
        let parsed = Repr::parse(&buf).unwrap();
        assert_eq!(parsed, repr);
    }

    #[test]
    fn rejects_bad_checksum() {
        let repr = Repr {
            src_addr: Address::new(10, 0, 0, 1),
            dst_addr: Address::new(10, 0, 0, 2),
            protocol: IpProtocol::Tcp,
            payload_len: 0,
            ident: 1,
            dont_fragment: false,
            more_fragments: false,
            frag_offset: 0,
            ttl: 64,
        };
        let mut buf = [0u8; HEADER_LEN];
        repr.emit(&mut buf);
        buf[11] ^= 0xff;
        assert!(Repr::parse(&buf).is_err());
    }

    #[test]
    fn subnet_broadcast() {
        let addr = Address::new(192, 168, 1, 5);
        let mask = Address::new(255, 255, 255, 0);
        assert_eq!(addr.subnet_broadcast(mask), Address::new(192, 168, 1, 255));
    }
}
