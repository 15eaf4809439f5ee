//! Compile-time configuration constants: pool and table sizes, protocol
//! timeouts and retry counts. Everything tunable lives here so porting
//! to a smaller host is a matter of shrinking a few numbers.

use crate::time::Duration;

pub const PKTBUF_BLK_SIZE: usize = 1024;
pub const PKTBUF_BLK_CNT: usize = 2048;
pub const PKTBUF_BUF_CNT: usize = 1024;

pub const NETIF_HWADDR_SIZE: usize = 10;
pub const NETIF_NAME_SIZE: usize = 10;
pub const NETIF_INQ_SIZE: usize = 50;
pub const NETIF_OUTQ_SIZE: usize = 50;

pub const TIMER_SCAN_PERIOD_MS: u64 = 50;

pub const ARP_CACHE_SIZE: usize = 50;
pub const ARP_MAX_PKT_WAIT: usize = 5;
pub const ARP_ENTRY_STABLE_TMO: Duration = Duration::from_secs(1200);
pub const ARP_ENTRY_PENDING_TMO: Duration = Duration::from_secs(1);
pub const ARP_ENTRY_RETRY_CNT: u8 = 5;
pub const ARP_TIMER_TMO: Duration = Duration::from_secs(1);

pub const IP_FRAGS_MAX_NR: usize = 10;
pub const IP_FRAG_MAX_BUF_NR: usize = 10;
pub const IP_FRAG_TMO: Duration = Duration::from_secs(5);
pub const IP_FRAG_SCAN_PERIOD: Duration = Duration::from_secs(1);
pub const IP_RTABLE_SIZE: usize = 16;

pub const RAW_MAX_NR: usize = 5;
pub const RAW_MAX_RECV: usize = 50;

pub const UDP_MAX_NR: usize = 4;
pub const UDP_MAX_RECV: usize = 50;

pub const TCP_MAX_NR: usize = 10;
pub const TCP_DEFAULT_MSS: usize = 536;
pub const TCP_SBUF_SIZE: usize = 10240;
pub const TCP_RBUF_SIZE: usize = 10240;
pub const TCP_SYN_RETRIES: u8 = 5;
pub const TCP_INIT_RTO: Duration = Duration::from_millis(1000);
pub const TCP_RTO_MIN: Duration = Duration::from_millis(200);
pub const TCP_RTO_MAX: Duration = Duration::from_millis(60_000);
pub const TCP_DUPTHRESH: u8 = 3;
pub const TCP_RESENDING_RETRIES: u8 = 20;
pub const TCP_PERSIST_RETRIES: u8 = 10;
pub const TCP_PERSIST_TMO: Duration = Duration::from_millis(1000);
pub const TCP_TMO_MSL: Duration = Duration::from_millis(5000);

pub const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(2 * 60 * 60);
pub const TCP_KEEPALIVE_INTVL: Duration = Duration::from_secs(75);
pub const TCP_KEEPALIVE_PROBES: u8 = 10;
