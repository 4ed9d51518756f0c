//! Cancellable timers delivered to their owners as Signal frames.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub cancel_id: u64,
    pub owner: usize,
    pub stream_id: u64,
    pub signal_id: i32,
    pub context_id: i32,
}

#[derive(Debug, Default)]
pub struct Signaler {
    scheduled: BTreeMap<(i64, u64), Timer>,
    deadlines: HashMap<u64, i64>,
    immediate: VecDeque<Timer>,
    next_cancel_id: u64,
}

impl Signaler {
    pub fn new() -> Self {
        Self {
            next_cancel_id: 1,
            ..Default::default()
        }
    }

    fn supply_cancel_id(&mut self) -> u64 {
        let cancel_id = self.next_cancel_id;
        self.next_cancel_id += 1;
        cancel_id
    }

    pub fn signal_at(
        &mut self,
        deadline_ms: i64,
        owner: usize,
        stream_id: u64,
        signal_id: i32,
        context_id: i32,
    ) -> u64 {
        let cancel_id = self.supply_cancel_id();
        self.scheduled.insert(
            (deadline_ms, cancel_id),
            Timer {
                cancel_id,
                owner,
                stream_id,
                signal_id,
                context_id,
            },
        );
        self.deadlines.insert(cancel_id, deadline_ms);
        cancel_id
    }

    pub fn signal_now(&mut self, owner: usize, stream_id: u64, signal_id: i32, context_id: i32) {
        let cancel_id = self.supply_cancel_id();
        self.immediate.push_back(Timer {
            cancel_id,
            owner,
            stream_id,
            signal_id,
            context_id,
        });
    }

    /// Cancels a scheduled signal; false when it already fired or was cancelled.
    pub fn cancel(&mut self, cancel_id: u64) -> bool {
        match self.deadlines.remove(&cancel_id) {
            Some(deadline) => self.scheduled.remove(&(deadline, cancel_id)).is_some(),
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.scheduled.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn has_immediate(&self) -> bool {
        !self.immediate.is_empty()
    }

    pub fn pop_immediate(&mut self) -> Option<Timer> {
        self.immediate.pop_front()
    }

    /// Removes and returns every timer due at `now_ms`, earliest first.
    pub fn poll_due(&mut self, now_ms: i64) -> Vec<Timer> {
        let mut due = Vec::new();
        while let Some(entry) = self.scheduled.first_entry() {
            if entry.key().0 > now_ms {
                break;
            }
            let timer = entry.remove();
            self.deadlines.remove(&timer.cancel_id);
            due.push(timer);
        }
        due
    }

    pub fn pending(&self) -> usize {
        self.scheduled.len()
    }
}
