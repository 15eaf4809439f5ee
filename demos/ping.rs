//! Ping between two in-process stacks joined by a simulated Ethernet
//! segment: the left host sends ICMP echo requests from a raw socket,
//! the right host's stack answers them, and the round-trip time is
//! printed per reply.
//!
//!     cargo run --example ping

use std::sync::Arc;
use std::time::Instant;

use nanostack::phy;
use nanostack::pktbuf::Pool;
use nanostack::socket::RawSocket;
use nanostack::time::Duration;
use nanostack::wire::{EthernetAddress, Icmpv4Repr, Ipv4Address};
use nanostack::worker::Stack;

const LOCAL: Ipv4Address = Ipv4Address::new(192, 168, 69, 1);
const REMOTE: Ipv4Address = Ipv4Address::new(192, 168, 69, 100);
const COUNT: u16 = 4;

fn pool() -> Arc<Pool> {
    Arc::new(Pool::new(256, 128))
}

fn main() {
    env_logger::init();

    let (dev_l, dev_r) = phy::pair(1500);
    let left = Stack::spawn(pool());
    let right = Stack::spawn(pool());
    let mask = Ipv4Address::new(255, 255, 255, 0);
    left.add_netif("eth0", EthernetAddress([2, 0, 0, 0, 0, 1]), LOCAL, mask, dev_l)
        .unwrap();
    right
        .add_netif("eth0", EthernetAddress([2, 0, 0, 0, 0, 2]), REMOTE, mask, dev_r)
        .unwrap();

    let mut sock = RawSocket::open(&left, 1).unwrap();
    sock.set_recv_timeout(Some(Duration::from_secs(2)));
    let ident = std::process::id() as u16;

    for seq_no in 0..COUNT {
        let request = Icmpv4Repr::EchoRequest {
            ident,
            seq_no,
            data: vec![0x55; 40],
        };
        let mut buf = vec![0u8; request.buffer_len()];
        request.emit(&mut buf);
        let sent_at = Instant::now();
        sock.send_to(&buf, REMOTE).unwrap();

        let mut rx = [0u8; 256];
        loop {
            match sock.recv_from(&mut rx) {
                Ok((n, from)) => match Icmpv4Repr::parse(&rx[..n]) {
                    Ok(Icmpv4Repr::EchoReply { ident: id, seq_no: seq, data }) if id == ident => {
                        println!(
                            "{} bytes from {}: icmp_seq={} time={:.2?}",
                            data.len(),
                            from,
                            seq,
                            sent_at.elapsed()
                        );
                        break;
                    }
                    _ => continue,
                },
                Err(e) => {
                    println!("icmp_seq={seq_no} {e}");
                    break;
                }
            }
        }
    }
}
