//! Persistence layer: libSQL-backed storage for leads, actions, timers and history.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{LeadFilter, LeadStore, ReplyTimer, ScoreChangeKind, TransitionWrite};
