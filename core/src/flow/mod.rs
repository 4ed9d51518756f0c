//! Flow control primitives shared by every stream: credit windows, half
//! stream state, shared byte budgets and the bounded slot pool.

pub mod budget;
pub mod pool;
pub mod state;
pub mod window;

pub use budget::{BudgetCreditor, BudgetWatcher};
pub use pool::{SlotId, SlotPool};
pub use state::StreamState;
pub use window::{Reservation, StreamWindow};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("acknowledge {acknowledge} beyond sequence {sequence}")]
    AcknowledgeAhead { acknowledge: i64, sequence: i64 },
    #[error("acknowledge retreated from {previous} to {acknowledge}")]
    AcknowledgeRetreat { acknowledge: i64, previous: i64 },
    #[error("maximum retreated from {previous} to {maximum}")]
    MaximumRetreat { maximum: i32, previous: i32 },
    #[error("sequence {sequence} + reserved {reserved} exceeds window {acknowledge} + {maximum}")]
    WindowExceeded {
        sequence: i64,
        reserved: i32,
        acknowledge: i64,
        maximum: i32,
    },
    #[error("sequence retreated from {previous} to {sequence}")]
    SequenceRetreat { sequence: i64, previous: i64 },
    #[error("no free slot for stream {0}")]
    SlotExhausted(u64),
}
