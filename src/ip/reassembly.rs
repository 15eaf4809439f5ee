//! IPv4 fragment reassembly: up to `IP_FRAG_MAX_BUF_NR`
//! buckets keyed by `(src, dest, id, proto)`, each holding up to
//! `IP_FRAGS_MAX_NR` fragments and expiring after `IP_FRAG_TMO` if
//! reassembly never completes — the classic "fragment timer" behavior,
//! checked once per second by `IP_FRAG_SCAN_PERIOD`.

use crate::config::{IP_FRAGS_MAX_NR, IP_FRAG_MAX_BUF_NR, IP_FRAG_TMO};
use crate::pktbuf::PktBuf;
use crate::time::Instant;
use crate::wire::{IpProtocol, Ipv4Address};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Key {
    src: Ipv4Address,
    dst: Ipv4Address,
    ident: u16,
    protocol: u8,
}

struct Fragment {
    offset: usize,
    more_fragments: bool,
    data: PktBuf,
}

struct Bucket {
    key: Key,
    frags: Vec<Fragment>,
    expires_at: Instant,
}

impl Bucket {
    /// A bucket is complete once a fragment with `more_fragments == false`
    /// has arrived and every byte from 0 up to its end offset is covered,
    /// with no gaps.
    fn total_if_complete(&self) -> Option<usize> {
        let mut sorted: Vec<&Fragment> = self.frags.iter().collect();
        sorted.sort_by_key(|f| f.offset);
        let last = sorted.iter().find(|f| !f.more_fragments)?;
        let end = last.offset + last.data.total_size();
        let mut covered = 0usize;
        for f in &sorted {
            if f.offset > covered {
                return None;
            }
            covered = covered.max(f.offset + f.data.total_size());
        }
        if covered >= end {
            Some(end)
        } else {
            None
        }
    }
}

pub struct Reassembler {
    buckets: Vec<Bucket>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler {
            buckets: Vec::with_capacity(IP_FRAG_MAX_BUF_NR),
        }
    }

    /// Feeds in one fragment. Returns the reassembled payload (in a fresh
    /// buffer built by concatenating fragments in offset order) once the
    /// bucket is complete; otherwise `None`.
    pub fn insert(
        &mut self,
        src: Ipv4Address,
        dst: Ipv4Address,
        ident: u16,
        protocol: IpProtocol,
        offset: usize,
        more_fragments: bool,
        data: PktBuf,
        now: Instant,
    ) -> Option<PktBuf> {
        let key = Key {
            src,
            dst,
            ident,
            protocol: protocol.into(),
        };
        let idx = match self.buckets.iter().position(|b| b.key == key) {
            Some(i) => i,
            None => {
                if self.buckets.len() >= IP_FRAG_MAX_BUF_NR {
                    // No room for a new reassembly in flight; drop the
                    // fragment, matching a fixed-size slab that cannot grow.
                    return None;
                }
                self.buckets.push(Bucket {
                    key,
                    frags: Vec::new(),
                    expires_at: now + IP_FRAG_TMO,
                });
                self.buckets.len() - 1
            }
        };
        if self.buckets[idx].frags.len() >= IP_FRAGS_MAX_NR {
            return None;
        }
        self.buckets[idx].frags.push(Fragment {
            offset,
            more_fragments,
            data,
        });

        if let Some(total) = self.buckets[idx].total_if_complete() {
            let mut bucket = self.buckets.remove(idx);
            bucket.frags.sort_by_key(|f| f.offset);
            let pool = bucket.frags[0].data.pool_handle();
            let mut out = PktBuf::alloc(&pool, total, 0).ok()?;
            for frag in bucket.frags.iter_mut() {
                let _ = out.seek(frag.offset);
                frag.data.reset_acc();
                let size = frag.data.total_size();
                let _ = PktBuf::copy(&mut out, &mut frag.data, size);
            }
            out.reset_acc();
            return Some(out);
        }
        None
    }

    /// Drops buckets that have outlived `IP_FRAG_TMO` without completing.
    pub fn on_timer(&mut self, now: Instant) {
        self.buckets.retain(|b| b.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for Reassembler {
    fn default() -> Reassembler {
        Reassembler::new()
    }
}
