//! Per-lead mutual exclusion keyed by lead id.
//!
//! Shared by the orchestrator (read, decide, write) and the dispatcher
//! (claiming a queued action for sending), so a send is never claimed in
//! the middle of a transition for the same lead.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock table size above which idle entries are dropped.
const LOCK_PRUNE_THRESHOLD: usize = 4096;

#[derive(Debug, Default)]
pub struct LeadLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LeadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one lead.
    pub async fn acquire(&self, lead_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() > LOCK_PRUNE_THRESHOLD {
                // Only the table holds an idle lock.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(lead_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}
