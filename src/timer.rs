//! The delta-list timer wheel: a sorted list of timers where each entry
//! stores its delay relative to its predecessor, so letting time pass is
//! O(1) work at the head regardless of list length.

use crate::time::Duration;

/// Opaque handle identifying a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFlags(u8);

impl TimerFlags {
    pub const NONE: TimerFlags = TimerFlags(0);
    pub const RELOAD: TimerFlags = TimerFlags(1 << 0);

    pub fn has_reload(&self) -> bool {
        self.0 & Self::RELOAD.0 != 0
    }
}

impl Default for TimerFlags {
    fn default() -> Self {
        TimerFlags::NONE
    }
}

struct Entry {
    id: TimerId,
    name: &'static str,
    delta: Duration,
    reload: Option<Duration>,
    arg: u64,
}

/// A sorted list of timers, stored as deltas from the previous entry.
pub struct TimerList {
    entries: Vec<Entry>,
    next_id: u64,
}

/// A timer that fired this tick, handed back to the caller for dispatch
/// outside the delta walk (so handlers may freely re-add timers).
pub struct Fired {
    pub id: TimerId,
    pub name: &'static str,
    pub arg: u64,
}

impl TimerList {
    pub fn new() -> TimerList {
        TimerList {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Inserts a timer firing `ms` from now. `arg` is an opaque payload
    /// (typically a table index) handed back in `Fired`.
    pub fn add(
        &mut self,
        name: &'static str,
        ms: Duration,
        flags: TimerFlags,
        arg: u64,
    ) -> Result<TimerId, &'static str> {
        if flags.has_reload() && ms == Duration::ZERO {
            return Err("reload interval must be > 0");
        }
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.insert_delta(
            id,
            name,
            ms,
            if flags.has_reload() { Some(ms) } else { None },
            arg,
        );
        Ok(id)
    }

    fn insert_delta(
        &mut self,
        id: TimerId,
        name: &'static str,
        ms: Duration,
        reload: Option<Duration>,
        arg: u64,
    ) {
        let mut remaining = ms;
        let mut idx = 0;
        while idx < self.entries.len() {
            if remaining < self.entries[idx].delta {
                self.entries[idx].delta = self.entries[idx].delta - remaining;
                break;
            }
            remaining = remaining - self.entries[idx].delta;
            idx += 1;
        }
        self.entries.insert(
            idx,
            Entry {
                id,
                name,
                delta: remaining,
                reload,
                arg,
            },
        );
    }

    /// Removes a still-pending timer, transferring its delta onto its
    /// successor so downstream deadlines are unaffected.
    pub fn remove(&mut self, id: TimerId) {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            let removed = self.entries.remove(pos);
            if let Some(next) = self.entries.get_mut(pos) {
                next.delta = next.delta + removed.delta;
            }
        }
    }

    /// The head timer's absolute delay, used by the worker to bound its
    /// message-queue wait. `None` if no timers are scheduled.
    pub fn first_tmo(&self) -> Option<Duration> {
        self.entries.first().map(|e| e.delta)
    }

    /// Subtracts `diff` from the head of the delta list, moving any timers
    /// whose delta reaches zero into the returned fired list (reloading
    /// ones are re-armed in place before this call returns, so `Fired`
    /// entries represent a decoupled snapshot safe to dispatch).
    pub fn check_tmo(&mut self, diff: Duration) -> Vec<Fired> {
        let mut remaining = diff;
        let mut fired = Vec::new();
        while let Some(head) = self.entries.first_mut() {
            if head.delta > remaining {
                head.delta = head.delta - remaining;
                break;
            }
            remaining = remaining - head.delta;
            let entry = self.entries.remove(0);
            fired.push(Fired {
                id: entry.id,
                name: entry.name,
                arg: entry.arg,
            });
            if let Some(period) = entry.reload {
                self.insert_delta(entry.id, entry.name, period, Some(period), entry.arg);
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TimerList {
    fn default() -> Self {
        TimerList::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_order_once_each() {
        let mut t = TimerList::new();
        let a = t.add("a", Duration::from_millis(100), TimerFlags::NONE, 1).unwrap();
        let b = t.add("b", Duration::from_millis(200), TimerFlags::NONE, 2).unwrap();

        let f1 = t.check_tmo(Duration::from_millis(150));
        assert_eq!(f1.len(), 1);
        assert_eq!(f1[0].id, a);

        let f2 = t.check_tmo(Duration::from_millis(50));
        assert!(f2.is_empty());

        let f3 = t.check_tmo(Duration::from_millis(50));
        assert_eq!(f3.len(), 1);
        assert_eq!(f3[0].id, b);
    }

    #[test]
    fn reload_fires_repeatedly() {
        let mut t = TimerList::new();
        t.add("a", Duration::from_millis(100), TimerFlags::RELOAD, 0)
            .unwrap();
        let mut total = 0;
        for _ in 0..10 {
            total += t.check_tmo(Duration::from_millis(100)).len();
        }
        assert_eq!(total, 10);
    }

    #[test]
    fn remove_transfers_delta() {
        let mut t = TimerList::new();
        let a = t.add("a", Duration::from_millis(100), TimerFlags::NONE, 0).unwrap();
        t.add("b", Duration::from_millis(200), TimerFlags::NONE, 0).unwrap();
        t.remove(a);
        // b should now fire after its original total delay (300ms from
        // start was 200ms-after-a i.e. 100+200=300ms absolute); removing a
        // must not change that.
        let fired = t.check_tmo(Duration::from_millis(299));
        assert!(fired.is_empty());
        let fired = t.check_tmo(Duration::from_millis(1));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn reload_rejects_zero_interval() {
        let mut t = TimerList::new();
        assert!(t.add("a", Duration::ZERO, TimerFlags::RELOAD, 0).is_err());
    }
}
