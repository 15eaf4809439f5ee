//! ICMPv4: echo request/reply and destination-unreachable.

use byteorder::{ByteOrder, NetworkEndian};

use super::{ParseError, ParseResult};
use crate::checksum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstUnreachable {
    Net,
    Host,
    Protocol,
    Port,
    Other(u8),
}

impl DstUnreachable {
    fn code(self) -> u8 {
        match self {
            DstUnreachable::Net => 0,
            DstUnreachable::Host => 1,
            DstUnreachable::Protocol => 2,
            DstUnreachable::Port => 3,
            DstUnreachable::Other(c) => c,
        }
    }

    fn from_code(c: u8) -> DstUnreachable {
        match c {
            0 => DstUnreachable::Net,
            1 => DstUnreachable::Host,
            2 => DstUnreachable::Protocol,
            3 => DstUnreachable::Port,
            other => DstUnreachable::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repr {
    EchoRequest { ident: u16, seq_no: u16, data: Vec<u8> },
    EchoReply { ident: u16, seq_no: u16, data: Vec<u8> },
    DstUnreachable { reason: DstUnreachable, payload: Vec<u8> },
}

impl Repr {
    pub fn parse(data: &[u8]) -> ParseResult<Repr> {
        if data.len() < 8 {
            return Err(ParseError("icmpv4 message truncated"));
        }
        if checksum::checksum(data) != 0 {
            return Err(ParseError("icmpv4 checksum mismatch"));
        }
        let ty = data[0];
        let code = data[1];
        match ty {
            8 => Ok(Repr::EchoRequest {
                ident: NetworkEndian::read_u16(&data[4..6]),
                seq_no: NetworkEndian::read_u16(&data[6..8]),
                data: data[8..].to_vec(),
            }),
            0 => Ok(Repr::EchoReply {
                ident: NetworkEndian::read_u16(&data[4..6]),
                seq_no: NetworkEndian::read_u16(&data[6..8]),
                data: data[8..].to_vec(),
            }),
            3 => Ok(Repr::DstUnreachable {
                reason: DstUnreachable::from_code(code),
                payload: data[8..].to_vec(),
            }),
            _ => Err(ParseError("unsupported icmpv4 type")),
        }
    }

    pub fn buffer_len(&self) -> usize {
        8 + match self {
            Repr::EchoRequest { data, .. } => data.len(),
            Repr::EchoReply { data, .. } => data.len(),
            Repr::DstUnreachable { payload, .. } => payload.len(),
        }
    }

    pub fn emit(&self, buf: &mut [u8]) {
        match self {
            Repr::EchoRequest { ident, seq_no, data } => {
                buf[0] = 8;
                buf[1] = 0;
                NetworkEndian::write_u16(&mut buf[4..6], *ident);
                NetworkEndian::write_u16(&mut buf[6..8], *seq_no);
                buf[8..].copy_from_slice(data);
            }
            Repr::EchoReply { ident, seq_no, data } => {
                buf[0] = 0;
                buf[1] = 0;
                NetworkEndian::write_u16(&mut buf[4..6], *ident);
                NetworkEndian::write_u16(&mut buf[6..8], *seq_no);
                buf[8..].copy_from_slice(data);
            }
            Repr::DstUnreachable { reason, payload } => {
                buf[0] = 3;
                buf[1] = reason.code();
                buf[4..8].fill(0);
                buf[8..].copy_from_slice(payload);
            }
        }
        NetworkEndian::write_u16(&mut buf[2..4], 0);
        let sum = checksum::checksum(buf);
        NetworkEndian::write_u16(&mut buf[2..4], sum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_round_trip() {
        let repr = Repr::EchoRequest {
            ident: 0x1234,
            seq_no: 0,
            data: (0u32..64).map(|x| x as u8).collect(),
        };
        let mut buf = vec![0u8; repr.buffer_len()];
        repr.emit(&mut buf);
        assert_eq!(Repr::parse(&buf).unwrap(), repr);
    }
}
