//! Rate-limited outbound dispatch.

pub mod dispatcher;
pub mod rate_limit;

pub use dispatcher::{
    DispatchPolicy, DispatchStats, DispatchStatsSnapshot, Dispatcher, ReconcileReport,
    effective_fatal_codes, spawn_dispatch_loop,
};
pub use rate_limit::RateLimiter;
