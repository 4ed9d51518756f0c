//! Shared byte budgets.
//!
//! A budget is credited by the owner of a physical connection and debited by
//! every stream multiplexed onto it. It is the only state shared between
//! engine shards, so every update goes through an atomic.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Stream waiting for credit on a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BudgetWatcher {
    pub shard: usize,
    pub owner: usize,
    pub stream_id: u64,
}

impl BudgetWatcher {
    pub fn new(shard: usize, owner: usize, stream_id: u64) -> Self {
        Self {
            shard,
            owner,
            stream_id,
        }
    }
}

#[derive(Debug, Default)]
struct Budget {
    available: AtomicI64,
    watchers: Mutex<Vec<BudgetWatcher>>,
}

#[derive(Debug)]
pub struct BudgetCreditor {
    budgets: DashMap<u64, Arc<Budget>>,
    next_budget_id: AtomicU64,
}

impl Default for BudgetCreditor {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetCreditor {
    pub fn new() -> Self {
        Self {
            budgets: DashMap::new(),
            next_budget_id: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh budget id; `0` always means "no budget".
    pub fn supply_budget_id(&self) -> u64 {
        self.next_budget_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn acquire(&self, budget_id: u64) {
        if budget_id != 0 {
            self.budgets.entry(budget_id).or_default();
        }
    }

    pub fn available(&self, budget_id: u64) -> i64 {
        self.budgets
            .get(&budget_id)
            .map_or(0, |b| b.available.load(Ordering::Acquire))
    }

    /// Adds credit and returns the new available amount.
    pub fn credit(&self, budget_id: u64, credit: i64) -> i64 {
        let budget = self.budgets.entry(budget_id).or_default().clone();
        let available = budget.available.fetch_add(credit, Ordering::AcqRel) + credit;
        trace!(
            "budget {} credited {} -> {} available",
            budget_id,
            credit,
            available
        );
        available
    }

    /// Claims between `min` and `max` bytes, or nothing when fewer than
    /// `min` are available.
    pub fn claim(&self, budget_id: u64, min: i32, max: i32) -> i32 {
        let Some(budget) = self.budgets.get(&budget_id).map(|b| b.clone()) else {
            return 0;
        };
        let mut current = budget.available.load(Ordering::Acquire);
        loop {
            if current < min as i64 {
                return 0;
            }
            let claimed = current.min(max as i64);
            match budget.available.compare_exchange_weak(
                current,
                current - claimed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return claimed as i32,
                Err(updated) => current = updated,
            }
        }
    }

    /// Registers a stream to be flushed when the budget is next credited.
    pub fn watch(&self, budget_id: u64, watcher: BudgetWatcher) {
        if let Some(budget) = self.budgets.get(&budget_id) {
            let mut watchers = budget.watchers.lock();
            if !watchers.contains(&watcher) {
                watchers.push(watcher);
            }
        }
    }

    pub fn take_watchers(&self, budget_id: u64) -> Vec<BudgetWatcher> {
        self.budgets
            .get(&budget_id)
            .map(|b| std::mem::take(&mut *b.watchers.lock()))
            .unwrap_or_default()
    }

    pub fn release(&self, budget_id: u64) {
        self.budgets.remove(&budget_id);
    }
}
