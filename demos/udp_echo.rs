//! A UDP echo pair: a server stack bound to port 7 mirrors whatever a
//! client stack sends it.
//!
//!     cargo run --example udp_echo

use std::sync::Arc;
use std::thread;

use nanostack::phy;
use nanostack::pktbuf::Pool;
use nanostack::socket::{SocketAddr, UdpSocket};
use nanostack::time::Duration;
use nanostack::wire::{EthernetAddress, Ipv4Address};
use nanostack::worker::Stack;

const CLIENT: Ipv4Address = Ipv4Address::new(192, 168, 69, 1);
const SERVER: Ipv4Address = Ipv4Address::new(192, 168, 69, 100);

fn pool() -> Arc<Pool> {
    Arc::new(Pool::new(256, 128))
}

fn main() {
    env_logger::init();

    let (dev_c, dev_s) = phy::pair(1500);
    let client_stack = Stack::spawn(pool());
    let server_stack = Stack::spawn(pool());
    let mask = Ipv4Address::new(255, 255, 255, 0);
    client_stack
        .add_netif("eth0", EthernetAddress([2, 0, 0, 0, 0, 1]), CLIENT, mask, dev_c)
        .unwrap();
    server_stack
        .add_netif("eth0", EthernetAddress([2, 0, 0, 0, 0, 2]), SERVER, mask, dev_s)
        .unwrap();

    thread::spawn(move || {
        let server = UdpSocket::open(&server_stack).unwrap();
        server.bind(None, 7).unwrap();
        let mut buf = [0u8; 1024];
        loop {
            let (n, peer) = server.recv_from(&mut buf).unwrap();
            server.send_to(&buf[..n], peer).unwrap();
        }
    });

    let mut client = UdpSocket::open(&client_stack).unwrap();
    client.set_recv_timeout(Some(Duration::from_secs(2)));
    for msg in ["hello", "from", "a", "tiny", "stack"] {
        client.send_to(msg.as_bytes(), SocketAddr::new(SERVER, 7)).unwrap();
        let mut buf = [0u8; 1024];
        let (n, peer) = client.recv_from(&mut buf).unwrap();
        println!("{} echoed {:?}", peer, String::from_utf8_lossy(&buf[..n]));
    }
}
