//! Safety controller: rate limiting, hourly and daily quotas, a circuit
//! breaker, an idempotency ledger and in-flight attempt tracking, all
//! persisted in one shared state file.

pub mod controller;
pub mod retry;
pub mod state;

pub use controller::{
    CircuitState, Decision, Denial, Outcome, Permit, SafetyController, SafetyLimits, SafetyStatus,
    ABANDONED,
};
pub use retry::RetryPolicy;
pub use state::{RequestLogEntry, SafetyState};
