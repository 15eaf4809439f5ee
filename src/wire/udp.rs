//! UDP: `src_port dst_port length checksum` + payload, checksum
//! over the IPv4 pseudo-header plus UDP header plus payload.

use byteorder::{ByteOrder, NetworkEndian};

use super::ipv4::Address as Ipv4Address;
use super::{ParseError, ParseResult};
use crate::checksum;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: u16,
}

impl Repr {
    pub fn parse(
        data: &[u8],
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
    ) -> ParseResult<(Repr, &[u8])> {
        if data.len() < HEADER_LEN {
            return Err(ParseError("udp datagram truncated"));
        }
        let length = NetworkEndian::read_u16(&data[4..6]) as usize;
        if length < HEADER_LEN || length > data.len() {
            return Err(ParseError("udp length field inconsistent"));
        }
        let checksum_field = NetworkEndian::read_u16(&data[6..8]);
        if checksum_field != 0 {
            let mut acc = checksum::pseudo_header(src_addr, dst_addr, 17, length as u16);
            acc.add(&data[..length]);
            if acc.finish() != 0 {
                return Err(ParseError("udp checksum mismatch"));
            }
        }
        let repr = Repr {
            src_port: NetworkEndian::read_u16(&data[0..2]),
            dst_port: NetworkEndian::read_u16(&data[2..4]),
            payload_len: (length - HEADER_LEN) as u16,
        };
        Ok((repr, &data[HEADER_LEN..length]))
    }

    /// Emits header + `payload` into `buf` (which must be exactly
    /// `HEADER_LEN + payload.len()` bytes) and fills in the checksum.
    pub fn emit(
        &self,
        buf: &mut [u8],
        payload: &[u8],
        src_addr: Ipv4Address,
        dst_addr: Ipv4Address,
    ) {
        let length = (HEADER_LEN + payload.len()) as u16;
        NetworkEndian::write_u16(&mut buf[0..2], self.src_port);
        NetworkEndian::write_u16(&mut buf[2..4], self.dst_port);
        NetworkEndian::write_u16(&mut buf[4..6], length);
        NetworkEndian::write_u16(&mut buf[6..8], 0);
        buf[8..8 + payload.len()].copy_from_slice(payload);

        let mut acc = checksum::pseudo_header(src_addr, dst_addr, 17, length);
        acc.add(&buf[..8 + payload.len()]);
        let sum = acc.finish();
        // RFC 768: an all-zero computed checksum is transmitted as all-ones.
        NetworkEndian::write_u16(&mut buf[6..8], if sum == 0 { 0xffff } else { sum });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let src = Ipv4Address::new(192, 168, 74, 3);
        let dst = Ipv4Address::new(192, 168, 74, 2);
        let repr = Repr {
            src_port: 5000,
            dst_port: 2000,
            payload_len: 5,
        };
        let mut buf = [0u8; HEADER_LEN + 5];
        repr.emit(&mut buf, b"hello", src, dst);
        let (parsed, payload) = Repr::parse(&buf, src, dst).unwrap();
        assert_eq!(parsed, repr);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn bad_checksum_rejected() {
        let src = Ipv4Address::new(10, 0, 0, 1);
        let dst = Ipv4Address::new(10, 0, 0, 2);
        let repr = Repr {
            src_port: 1,
            dst_port: 2,
            payload_len: 0,
        };
        let mut buf = [0u8; HEADER_LEN];
        repr.emit(&mut buf, &[], src, dst);
        buf[7] ^= 0xff;
        assert!(Repr::parse(&buf, src, dst).is_err());
    }
}
