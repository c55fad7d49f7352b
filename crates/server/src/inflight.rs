//! In-flight call table — one per connection.
//!
//! The dispatcher inserts a call when a request is accepted and removes it
//! when its response is sent. Cancellation reads go through each call's
//! own [`CancellationToken`] without touching the table lock.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

struct InflightCall {
    started_at: Instant,
    cancel: CancellationToken,
}

/// Table of calls currently in flight on a single connection.
#[derive(Default)]
pub struct InflightTable {
    calls: Mutex<HashMap<String, InflightCall>>,
}

impl InflightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a call. Returns its cancellation token, or `None` when the
    /// correlation id is already in flight (protocol violation).
    pub fn insert(&self, id: &str) -> Option<CancellationToken> {
        let mut calls = self.calls.lock();
        if calls.contains_key(id) {
            return None;
        }
        let token = CancellationToken::new();
        calls.insert(
            id.to_string(),
            InflightCall {
                started_at: Instant::now(),
                cancel: token.clone(),
            },
        );
        Some(token)
    }

    /// Signal cancellation for a call. A miss is a no-op — cancelling an
    /// unknown or already-completed id must be idempotent.
    pub fn cancel(&self, id: &str) -> bool {
        match self.calls.lock().get(id) {
            Some(call) => {
                call.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a completed call. Returns how long it was in flight.
    pub fn remove(&self, id: &str) -> Option<std::time::Duration> {
        self.calls
            .lock()
            .remove(id)
            .map(|call| call.started_at.elapsed())
    }

    /// Cancel everything — called on connection teardown. Returns the
    /// number of calls signalled.
    pub fn cancel_all(&self) -> usize {
        let calls = self.calls.lock();
        for call in calls.values() {
            call.cancel.cancel();
        }
        calls.len()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}
