//! TCP: standard 20-byte header plus options. Supported options:
//! `EOL(0)`, `NOP(1)`, `MSS(2,4)`, `WSOPT(3,3)`, `SACK-permitted(4,2)`
//! (parsed and otherwise ignored — this stack advertises neither window
//! scaling nor SACK).

use byteorder::{ByteOrder, NetworkEndian};
use core::cmp::Ordering;
use core::fmt;
use core::ops::{Add, Sub};

use super::{ParseError, ParseResult};

pub const HEADER_LEN: usize = 20;

/// A 32-bit sequence number with RFC 793 wraparound (mod 2^32) comparison
/// semantics: `a < b` iff `(a - b) as i32 is negative`, not the plain
/// unsigned order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeqNumber(pub u32);

impl SeqNumber {
    pub fn wrapping_add(self, n: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(n))
    }

    /// Signed distance `self - other`, i.e. how far ahead `self` is of
    /// `other` in sequence-space order.
    pub fn diff(self, other: SeqNumber) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u32> for SeqNumber {
    type Output = SeqNumber;
    fn add(self, rhs: u32) -> SeqNumber {
        self.wrapping_add(rhs)
    }
}

impl Sub<SeqNumber> for SeqNumber {
    type Output = i32;
    fn sub(self, rhs: SeqNumber) -> i32 {
        self.diff(rhs)
    }
}

impl PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.diff(*other).cmp(&0)
    }
}

macro_rules! bitflags_plain {
    (pub struct $name:ident : $repr:ty { $(const $variant:ident = $value:expr;)* }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $variant: $name = $name($value);)*
            pub const EMPTY: $name = $name(0);

            pub fn contains(&self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn bits(&self) -> $repr {
                self.0
            }

            pub fn from_bits(v: $repr) -> $name {
                $name(v)
            }
        }

        impl core::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }
    };
}

bitflags_plain! {
    pub struct Flags: u16 {
        const FIN = 1 << 0;
        const SYN = 1 << 1;
        const RST = 1 << 2;
        const PSH = 1 << 3;
        const ACK = 1 << 4;
        const URG = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    Mss(u16),
    WindowScale(u8),
    SackPermitted,
    Nop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repr {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: SeqNumber,
    pub ack_number: SeqNumber,
    pub flags: Flags,
    pub window_len: u16,
    pub options: Vec<TcpOption>,
}

fn parse_options(data: &[u8]) -> Vec<TcpOption> {
    let mut opts = Vec::new();
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            0 => break, // EOL
            1 => {
                opts.push(TcpOption::Nop);
                i += 1;
            }
            2 if i + 4 <= data.len() && data[i + 1] == 4 => {
                opts.push(TcpOption::Mss(NetworkEndian::read_u16(&data[i + 2..i + 4])));
                i += 4;
            }
            3 if i + 3 <= data.len() && data[i + 1] == 3 => {
                opts.push(TcpOption::WindowScale(data[i + 2]));
                i += 3;
            }
            4 if i + 2 <= data.len() && data[i + 1] == 2 => {
                opts.push(TcpOption::SackPermitted);
                i += 2;
            }
            _ => {
                // Unknown/malformed option: skip using its length byte if
                // present, otherwise bail out of option parsing.
                if i + 1 < data.len() && data[i + 1] >= 2 {
                    i += data[i + 1] as usize;
                } else {
                    break;
                }
            }
        }
    }
    opts
}

fn options_len(options: &[TcpOption]) -> usize {
    let raw: usize = options
        .iter()
        .map(|o| match o {
            TcpOption::Mss(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::Nop => 1,
        })
        .sum();
    (raw + 3) / 4 * 4
}

impl Repr {
    pub fn parse(data: &[u8]) -> ParseResult<(Repr, &[u8])> {
        if data.len() < HEADER_LEN {
            return Err(ParseError("tcp segment truncated"));
        }
        let data_offset = ((data[12] >> 4) as usize) * 4;
        if data_offset < HEADER_LEN || data_offset > data.len() {
            return Err(ParseError("tcp data offset out of range"));
        }
        let flags = Flags::from_bits(NetworkEndian::read_u16(&data[12..14]) & 0x003f);
        let options = parse_options(&data[HEADER_LEN..data_offset]);
        let repr = Repr {
            src_port: NetworkEndian::read_u16(&data[0..2]),
            dst_port: NetworkEndian::read_u16(&data[2..4]),
            seq_number: SeqNumber(NetworkEndian::read_u32(&data[4..8])),
            ack_number: SeqNumber(NetworkEndian::read_u32(&data[8..12])),
            flags,
            window_len: NetworkEndian::read_u16(&data[14..16]),
            options,
        };
        Ok((repr, &data[data_offset..]))
    }

    pub fn header_len(&self) -> usize {
        HEADER_LEN + options_len(&self.options)
    }

    /// Emits header (including options) into `buf`; checksum is computed
    /// and filled by the caller (it needs the pseudo-header + payload, not
    /// visible here), matching `tools::pseudo_header` usage at the call
    /// site.
    pub fn emit(&self, buf: &mut [u8]) {
        let hlen = self.header_len();
        NetworkEndian::write_u16(&mut buf[0..2], self.src_port);
        NetworkEndian::write_u16(&mut buf[2..4], self.dst_port);
        NetworkEndian::write_u32(&mut buf[4..8], self.seq_number.0);
        NetworkEndian::write_u32(&mut buf[8..12], self.ack_number.0);
        let data_offset = ((hlen / 4) as u16) << 12;
        NetworkEndian::write_u16(&mut buf[12..14], data_offset | self.flags.bits());
        NetworkEndian::write_u16(&mut buf[14..16], self.window_len);
        NetworkEndian::write_u16(&mut buf[16..18], 0); // checksum, filled by caller
        NetworkEndian::write_u16(&mut buf[18..20], 0); // urgent pointer, unused

        let mut o = HEADER_LEN;
        for opt in &self.options {
            match opt {
                TcpOption::Mss(mss) => {
                    buf[o] = 2;
                    buf[o + 1] = 4;
                    NetworkEndian::write_u16(&mut buf[o + 2..o + 4], *mss);
                    o += 4;
                }
                TcpOption::WindowScale(shift) => {
                    buf[o] = 3;
                    buf[o + 1] = 3;
                    buf[o + 2] = *shift;
                    o += 3;
                }
                TcpOption::SackPermitted => {
                    buf[o] = 4;
                    buf[o + 1] = 2;
                    o += 2;
                }
                TcpOption::Nop => {
                    buf[o] = 1;
                    o += 1;
                }
            }
        }
        while o < hlen {
            buf[o] = 0;
            o += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_mss_option() {
        let repr = Repr {
            src_port: 1000,
            dst_port: 2000,
            seq_number: SeqNumber(100),
            ack_number: SeqNumber(0),
            flags: Flags::SYN,
            window_len: 10240,
            options: vec![TcpOption::Mss(536)],
        };
        let mut buf = vec![0u8; repr.header_len()];
        repr.emit(&mut buf);
        let (parsed, rest) = Repr::parse(&buf).unwrap();
        assert_eq!(parsed.src_port, repr.src_port);
        assert_eq!(parsed.options, repr.options);
        assert!(rest.is_empty());
    }

    #[test]
    fn seq_number_wraparound_ordering() {
        let near_wrap = SeqNumber(u32::MAX - 5);
        let after_wrap = near_wrap.wrapping_add(10);
        assert!(after_wrap > near_wrap);
        assert_eq!(after_wrap.diff(near_wrap), 10);
    }
}
