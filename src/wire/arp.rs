//! ARP (RFC 826) for Ethernet/IPv4: `hw=1, proto=0x0800, hlen=6, plen=4,
//! op in {1 request, 2 reply}`.

use byteorder::{ByteOrder, NetworkEndian};

use super::ethernet::Address as EthernetAddress;
use super::ipv4::Address as Ipv4Address;
use super::{ParseError, ParseResult};

pub const HEADER_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Request,
    Reply,
    Unknown(u16),
}

impl Operation {
    fn from_u16(v: u16) -> Operation {
        match v {
            1 => Operation::Request,
            2 => Operation::Reply,
            other => Operation::Unknown(other),
        }
    }

    fn to_u16(self) -> u16 {
        match self {
            Operation::Request => 1,
            Operation::Reply => 2,
            Operation::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repr {
    pub operation: Operation,
    pub source_hw_addr: EthernetAddress,
    pub source_proto_addr: Ipv4Address,
    pub target_hw_addr: EthernetAddress,
    pub target_proto_addr: Ipv4Address,
}

impl Repr {
    pub fn parse(data: &[u8]) -> ParseResult<Repr> {
        if data.len() < HEADER_LEN {
            return Err(ParseError("arp packet shorter than header"));
        }
        let hw_type = NetworkEndian::read_u16(&data[0..2]);
        let proto_type = NetworkEndian::read_u16(&data[2..4]);
        let hw_len = data[4];
        let proto_len = data[5];
        if hw_type != 1 || proto_type != 0x0800 || hw_len != 6 || proto_len != 4 {
            return Err(ParseError("unsupported arp hardware/protocol combination"));
        }
        let operation = Operation::from_u16(NetworkEndian::read_u16(&data[6..8]));
        Ok(Repr {
            operation,
            source_hw_addr: EthernetAddress::from_bytes(&data[8..14]),
            source_proto_addr: Ipv4Address::from_bytes(&data[14..18]),
            target_hw_addr: EthernetAddress::from_bytes(&data[18..24]),
            target_proto_addr: Ipv4Address::from_bytes(&data[24..28]),
        })
    }

    pub fn emit(&self, buf: &mut [u8]) {
        NetworkEndian::write_u16(&mut buf[0..2], 1);
        NetworkEndian::write_u16(&mut buf[2..4], 0x0800);
        buf[4] = 6;
        buf[5] = 4;
        NetworkEndian::write_u16(&mut buf[6..8], self.operation.to_u16());
        buf[8..14].copy_from_slice(self.source_hw_addr.as_bytes());
        buf[14..18].copy_from_slice(&self.source_proto_addr.octets());
        buf[18..24].copy_from_slice(self.target_hw_addr.as_bytes());
        buf[24..28].copy_from_slice(&self.target_proto_addr.octets());
    }
}
