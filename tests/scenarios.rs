//! End-to-end scenarios: two full stacks joined by an in-process
//! Ethernet segment, exercising the whole path from socket call through
//! ARP, IP and the transport back up to the far side's socket.

use std::sync::Arc;
use std::thread;

use nanostack::config;
use nanostack::phy;
use nanostack::pktbuf::Pool;
use nanostack::socket::{RawSocket, SocketAddr, TcpSocket, UdpSocket};
use nanostack::time::Duration;
use nanostack::wire::{
    EthernetAddress, EtherType, EthernetRepr, ArpRepr, Icmpv4DstUnreachable, Icmpv4Repr,
    Ipv4Address,
};
use nanostack::worker::Stack;

const ADDR_A: Ipv4Address = Ipv4Address::new(192, 168, 74, 2);
const ADDR_B: Ipv4Address = Ipv4Address::new(192, 168, 74, 3);
const MASK: Ipv4Address = Ipv4Address::new(255, 255, 255, 0);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pool() -> Arc<Pool> {
    Arc::new(Pool::new(config::PKTBUF_BLK_CNT, config::PKTBUF_BUF_CNT))
}

/// Two hosts on one simulated Ethernet segment.
fn linked_stacks() -> (Stack, Stack) {
    let (dev_a, dev_b) = phy::pair(1500);
    let stack_a = Stack::spawn(pool());
    let stack_b = Stack::spawn(pool());
    stack_a
        .add_netif("eth0", EthernetAddress([2, 0, 0, 0, 0, 0xa]), ADDR_A, MASK, dev_a)
        .unwrap();
    stack_b
        .add_netif("eth0", EthernetAddress([2, 0, 0, 0, 0, 0xb]), ADDR_B, MASK, dev_b)
        .unwrap();
    (stack_a, stack_b)
}

#[test]
fn icmp_echo_round_trip() {
    init_logging();
    let (stack_a, _stack_b) = linked_stacks();

    let mut ping = RawSocket::open(&stack_a, 1).unwrap();
    ping.set_recv_timeout(Some(Duration::from_secs(5)));

    let payload: Vec<u8> = (0u32..64).map(|x| x as u8).collect();
    let request = Icmpv4Repr::EchoRequest {
        ident: 0x1234,
        seq_no: 0,
        data: payload.clone(),
    };
    let mut buf = vec![0u8; request.buffer_len()];
    request.emit(&mut buf);
    ping.send_to(&buf, ADDR_B).unwrap();

    let mut rx = [0u8; 256];
    loop {
        let (n, from) = ping.recv_from(&mut rx).unwrap();
        match Icmpv4Repr::parse(&rx[..n]) {
            Ok(Icmpv4Repr::EchoReply { ident, seq_no, data }) => {
                assert_eq!(from, ADDR_B);
                assert_eq!(ident, 0x1234);
                assert_eq!(seq_no, 0);
                assert_eq!(data, payload);
                return;
            }
            _ => continue,
        }
    }
}

#[test]
fn udp_echo_round_trip() {
    init_logging();
    let (stack_a, stack_b) = linked_stacks();

    let mut server = UdpSocket::open(&stack_b).unwrap();
    server.bind(None, 2000).unwrap();
    server.set_recv_timeout(Some(Duration::from_secs(5)));

    let mut client = UdpSocket::open(&stack_a).unwrap();
    client.bind(None, 5000).unwrap();
    client.set_recv_timeout(Some(Duration::from_secs(5)));

    client
        .send_to(b"hello", SocketAddr::new(ADDR_B, 2000))
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, peer) = server.recv_from(&mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(peer, SocketAddr::new(ADDR_A, 5000));

    server.send_to(&buf[..n], peer).unwrap();
    let (n, peer) = client.recv_from(&mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(peer, SocketAddr::new(ADDR_B, 2000));
}

#[test]
fn arp_entry_resolves_and_goes_stable() {
    init_logging();
    let (stack_a, stack_b) = linked_stacks();

    let mut server = UdpSocket::open(&stack_b).unwrap();
    server.bind(None, 2000).unwrap();
    server.set_recv_timeout(Some(Duration::from_secs(5)));

    let client = UdpSocket::open(&stack_a).unwrap();
    // First packet to a fresh address must wait for ARP resolution, then
    // be released from the pending queue.
    client.send_to(b"probe", SocketAddr::new(ADDR_B, 2000)).unwrap();
    let mut buf = [0u8; 16];
    let (n, _) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"probe");

    let resolved = stack_a
        .exec(|core| core.arp.lookup(ADDR_B))
        .unwrap()
        .expect("entry went stable after the reply");
    assert_eq!(resolved, EthernetAddress([2, 0, 0, 0, 0, 0xb]));
}

#[test]
fn tcp_echo_round_trip() {
    init_logging();
    let (stack_a, stack_b) = linked_stacks();

    let mut listener = TcpSocket::open(&stack_b).unwrap();
    listener.bind(Ipv4Address::UNSPECIFIED, 2000).unwrap();
    listener.listen(4).unwrap();
    listener.set_recv_timeout(Some(Duration::from_secs(10)));

    let server = thread::spawn(move || {
        let conn = listener.accept().unwrap();
        let mut buf = [0u8; 64];
        let mut got = 0;
        while got < 6 {
            let n = conn.recv(&mut buf[got..]).unwrap();
            assert!(n > 0);
            got += n;
        }
        conn.send(&buf[..got]).unwrap();
        // Leave teardown to the client side.
        buf[..got].to_vec()
    });

    let mut client = TcpSocket::open(&stack_a).unwrap();
    client.set_recv_timeout(Some(Duration::from_secs(10)));
    client.connect(SocketAddr::new(ADDR_B, 2000)).unwrap();
    client.send(b"abcdef").unwrap();

    let mut buf = [0u8; 64];
    let mut got = 0;
    while got < 6 {
        let n = client.recv(&mut buf[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(&buf[..6], b"abcdef");
    assert_eq!(server.join().unwrap(), b"abcdef".to_vec());
}

#[test]
fn tcp_bulk_transfer_spans_many_segments() {
    init_logging();
    let (stack_a, stack_b) = linked_stacks();

    let mut listener = TcpSocket::open(&stack_b).unwrap();
    listener.bind(Ipv4Address::UNSPECIFIED, 2001).unwrap();
    listener.listen(1).unwrap();
    listener.set_recv_timeout(Some(Duration::from_secs(20)));

    // 4000 bytes crosses several MSS-sized segments and forces the
    // window/ACK machinery to cycle.
    let payload: Vec<u8> = (0u32..4000).map(|x| (x % 251) as u8).collect();
    let expected = payload.clone();

    let server = thread::spawn(move || {
        let mut conn = listener.accept().unwrap();
        conn.set_recv_timeout(Some(Duration::from_secs(20)));
        let mut got = Vec::new();
        let mut buf = [0u8; 1024];
        while got.len() < 4000 {
            let n = conn.recv(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        got
    });

    let mut client = TcpSocket::open(&stack_a).unwrap();
    client.set_recv_timeout(Some(Duration::from_secs(20)));
    client.connect(SocketAddr::new(ADDR_B, 2001)).unwrap();
    client.send(&payload).unwrap();

    assert_eq!(server.join().unwrap(), expected);
}

#[test]
fn connect_to_closed_port_is_refused() {
    init_logging();
    let (stack_a, _stack_b) = linked_stacks();

    let mut client = TcpSocket::open(&stack_a).unwrap();
    client.set_recv_timeout(Some(Duration::from_secs(5)));
    let err = client
        .connect(SocketAddr::new(ADDR_B, 4444))
        .expect_err("nothing listens there");
    assert_eq!(err, nanostack::Error::Refused);
}

#[test]
fn udp_to_closed_port_draws_port_unreachable() {
    init_logging();
    let (stack_a, _stack_b) = linked_stacks();

    let mut icmp = RawSocket::open(&stack_a, 1).unwrap();
    icmp.set_recv_timeout(Some(Duration::from_secs(5)));

    let client = UdpSocket::open(&stack_a).unwrap();
    client.send_to(b"anyone?", SocketAddr::new(ADDR_B, 9999)).unwrap();

    let mut rx = [0u8; 256];
    loop {
        let (n, from) = icmp.recv_from(&mut rx).unwrap();
        if let Ok(Icmpv4Repr::DstUnreachable { reason, .. }) = Icmpv4Repr::parse(&rx[..n]) {
            assert_eq!(from, ADDR_B);
            assert_eq!(reason, Icmpv4DstUnreachable::Port);
            return;
        }
    }
}

#[test]
fn oversized_datagram_fragments_and_reassembles() {
    init_logging();
    let (stack_a, stack_b) = linked_stacks();

    let mut server = UdpSocket::open(&stack_b).unwrap();
    server.bind(None, 2000).unwrap();
    server.set_recv_timeout(Some(Duration::from_secs(5)));

    let client = UdpSocket::open(&stack_a).unwrap();
    let payload: Vec<u8> = (0u32..3000).map(|x| (x % 256) as u8).collect();
    client.send_to(&payload, SocketAddr::new(ADDR_B, 2000)).unwrap();

    let mut buf = vec![0u8; 4096];
    let (n, peer) = server.recv_from(&mut buf).unwrap();
    assert_eq!(n, 3000);
    assert_eq!(&buf[..n], &payload[..]);
    assert_eq!(peer.addr, ADDR_A);
}

/// Reads frames straight off the far end of a segment, for tests that
/// inspect what the stack put on the wire rather than running a second
/// stack.
fn next_frame(dev: &mut phy::Device) -> Vec<u8> {
    dev.rx.recv().expect("segment stays open")
}

#[test]
fn routing_picks_the_interface_by_prefix() {
    init_logging();
    let (dev1, mut peer1) = phy::pair(1500);
    let (dev2, mut peer2) = phy::pair(1500);
    let stack = Stack::spawn(pool());
    let if1 = stack
        .add_netif(
            "eth0",
            EthernetAddress([2, 0, 0, 0, 1, 1]),
            Ipv4Address::new(192, 168, 74, 2),
            MASK,
            dev1,
        )
        .unwrap();
    let _if2 = stack
        .add_netif(
            "eth1",
            EthernetAddress([2, 0, 0, 0, 2, 2]),
            Ipv4Address::new(10, 0, 2, 200),
            MASK,
            dev2,
        )
        .unwrap();

    let sock = UdpSocket::open(&stack).unwrap();

    // On-link destination in eth1's subnet: resolution traffic must show
    // up on eth1's segment, and only there.
    sock.send_to(b"x", SocketAddr::new(Ipv4Address::new(10, 0, 2, 2), 7)).unwrap();
    let frame = next_frame(&mut peer2);
    let (eth, body) = EthernetRepr::parse(&frame).unwrap();
    assert_eq!(eth.ethertype, EtherType::Arp);
    let arp = ArpRepr::parse(body).unwrap();
    assert_eq!(arp.target_proto_addr, Ipv4Address::new(10, 0, 2, 2));

    // Off-link destination goes to whichever default gateway was set
    // last, with ARP resolving the gateway rather than the destination.
    stack
        .set_default_gateway(if1, Ipv4Address::new(192, 168, 74, 1))
        .unwrap();
    sock.send_to(b"y", SocketAddr::new(Ipv4Address::new(8, 8, 8, 8), 7)).unwrap();
    let frame = next_frame(&mut peer1);
    let (eth, body) = EthernetRepr::parse(&frame).unwrap();
    assert_eq!(eth.ethertype, EtherType::Arp);
    let arp = ArpRepr::parse(body).unwrap();
    assert_eq!(arp.target_proto_addr, Ipv4Address::new(192, 168, 74, 1));
}
