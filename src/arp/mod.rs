//! The ARP cache: a small fixed table of hardware/protocol
//! address bindings, each either `Pending` (resolution in flight, with a
//! bounded queue of packets waiting on it) or `Stable` (usable, aged out
//! after a timeout). Retried and aged by a 1Hz timer, matching
//! `ARP_TIMER_TMO`.

use std::collections::VecDeque;

use log::{debug, trace};

use crate::config;
use crate::pktbuf::PktBuf;
use crate::time::{Duration, Instant};
use crate::wire::{EthernetAddress, Ipv4Address};

#[derive(Debug, Clone, Copy)]
pub enum State {
    /// Resolution request sent, awaiting a reply. `retries` counts
    /// requests sent so far; the entry is dropped once it exceeds
    /// `ARP_ENTRY_RETRY_CNT`.
    Pending { retries: u8 },
    Stable,
}

struct Entry {
    proto_addr: Ipv4Address,
    hw_addr: EthernetAddress,
    state: State,
    expires_at: Instant,
    /// Outbound packets queued on a `Pending` entry, flushed to
    /// `link::ether_out` once resolution completes.
    waiting: VecDeque<PktBuf>,
}

pub struct Table {
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            entries: Vec::with_capacity(config::ARP_CACHE_SIZE),
        }
    }

    fn find_mut(&mut self, addr: Ipv4Address) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.proto_addr == addr)
    }

    /// Queues `pkt` awaiting resolution of `addr`, starting a fresh
    /// pending entry or joining one already in flight. Returns `true`
    /// when a new entry was created, i.e. the caller owes the network
    /// one ARP request; joining an in-flight resolution must not emit
    /// another. When the per-entry queue is full the oldest waiter is
    /// dropped. Callers must check [`Table::lookup`] first — this
    /// assumes `addr` isn't already stable.
    pub fn resolve(&mut self, addr: Ipv4Address, pkt: PktBuf, now: Instant) -> bool {
        if let Some(entry) = self.find_mut(addr) {
            if entry.waiting.len() >= config::ARP_MAX_PKT_WAIT {
                entry.waiting.pop_front();
            }
            entry.waiting.push_back(pkt);
            return false;
        }
        if self.entries.len() >= config::ARP_CACHE_SIZE {
            // Evict the oldest entry to make room, mirroring a fixed-size
            // slab that must recycle rather than grow.
            self.entries.remove(0);
        }
        let mut waiting = VecDeque::new();
        waiting.push_back(pkt);
        self.entries.push(Entry {
            proto_addr: addr,
            hw_addr: EthernetAddress([0; 6]),
            state: State::Pending { retries: 1 },
            expires_at: now + config::ARP_ENTRY_PENDING_TMO,
            waiting,
        });
        true
    }

    /// Records a binding learned from an incoming ARP request or reply,
    /// inserting a fresh stable entry or refreshing an existing one, and
    /// returns whatever was queued on it awaiting resolution.
    pub fn insert(
        &mut self,
        addr: Ipv4Address,
        hw_addr: EthernetAddress,
        now: Instant,
    ) -> Vec<PktBuf> {
        trace!(target: "net::arp", "{} is-at {}", addr, hw_addr);
        if let Some(entry) = self.find_mut(addr) {
            entry.hw_addr = hw_addr;
            entry.state = State::Stable;
            entry.expires_at = now + config::ARP_ENTRY_STABLE_TMO;
            return entry.waiting.drain(..).collect();
        }
        if self.entries.len() >= config::ARP_CACHE_SIZE {
            self.entries.remove(0);
        }
        self.entries.push(Entry {
            proto_addr: addr,
            hw_addr,
            state: State::Stable,
            expires_at: now + config::ARP_ENTRY_STABLE_TMO,
            waiting: VecDeque::new(),
        });
        Vec::new()
    }

    pub fn lookup(&self, addr: Ipv4Address) -> Option<EthernetAddress> {
        self.entries
            .iter()
            .find(|e| e.proto_addr == addr && e.state == State::Stable)
            .map(|e| e.hw_addr)
    }

    /// Runs on the `ARP_TIMER_TMO` (1Hz) tick. An expired stable entry
    /// is not discarded outright: it flips back to pending and gets
    /// re-probed, so a still-reachable neighbor stays resolved without a
    /// gap. Pending entries either bump their retry counter (the
    /// returned addresses tell the caller to resend requests) or are
    /// dropped with their waiting packets once retries are exhausted.
    pub fn on_timer(&mut self, now: Instant) -> Vec<Ipv4Address> {
        let mut retry = Vec::new();
        self.entries.retain_mut(|e| match &mut e.state {
            State::Stable => {
                if now < e.expires_at {
                    return true;
                }
                e.state = State::Pending { retries: 1 };
                e.expires_at = now + config::ARP_ENTRY_PENDING_TMO;
                retry.push(e.proto_addr);
                true
            }
            State::Pending { retries } => {
                if now < e.expires_at {
                    return true;
                }
                if *retries >= config::ARP_ENTRY_RETRY_CNT {
                    debug!(
                        target: "net::arp",
                        "{} unresolved after {} tries, dropping {} queued packets",
                        e.proto_addr, retries, e.waiting.len()
                    );
                    false
                } else {
                    *retries += 1;
                    e.expires_at = now + config::ARP_ENTRY_PENDING_TMO;
                    retry.push(e.proto_addr);
                    true
                }
            }
        });
        retry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

impl PartialEq for State {
    fn eq(&self, other: &State) -> bool {
        matches!(
            (self, other),
            (State::Stable, State::Stable) | (State::Pending { .. }, State::Pending { .. })
        )
    }
}
impl Eq for State {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktbuf::Pool;
    use std::sync::Arc;

    fn test_pkt() -> PktBuf {
        let pool = Arc::new(Pool::new(4, 4));
        PktBuf::alloc(&pool, 8, 0).unwrap()
    }

    #[test]
    fn unresolved_address_queues_and_reports_pending() {
        let mut table = Table::new();
        let now = Instant::from_millis(0);
        let addr = Ipv4Address::new(192, 168, 1, 1);
        table.resolve(addr, test_pkt(), now);
        assert!(table.lookup(addr).is_none());
    }

    #[test]
    fn insert_flushes_waiting_packets() {
        let mut table = Table::new();
        let now = Instant::from_millis(0);
        let addr = Ipv4Address::new(192, 168, 1, 1);
        table.resolve(addr, test_pkt(), now);
        table.resolve(addr, test_pkt(), now);
        let hw = EthernetAddress([1, 2, 3, 4, 5, 6]);
        let flushed = table.insert(addr, hw, now);
        assert_eq!(flushed.len(), 2);
        assert_eq!(table.lookup(addr), Some(hw));
    }

    #[test]
    fn pending_entry_drops_after_exhausting_retries() {
        let mut table = Table::new();
        let mut now = Instant::from_millis(0);
        let addr = Ipv4Address::new(10, 0, 0, 1);
        table.resolve(addr, test_pkt(), now);
        for _ in 0..config::ARP_ENTRY_RETRY_CNT {
            now = now + Duration::from_secs(2);
            table.on_timer(now);
        }
        now = now + Duration::from_secs(2);
        table.on_timer(now);
        assert_eq!(table.len(), 0);
    }
}
