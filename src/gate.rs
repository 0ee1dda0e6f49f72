//! Counting concurrency gates.
//!
//! A [`ConcurrencyGate`] wraps a tokio [`Semaphore`] and tracks how many
//! permits are currently held and the highest count observed. The fetch and
//! download gates are separate instances so neither kind of traffic can starve
//! the other.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct GateState {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    limit: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// A bounded permit pool. Cheap to clone; clones share the same permits.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    state: Arc<GateState>,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `limit` holders (minimum 1).
    pub fn new(name: &'static str, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            state: Arc::new(GateState {
                name,
                semaphore: Arc::new(Semaphore::new(limit)),
                limit,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a slot. The slot is released when the returned permit drops,
    /// including when the owning task is aborted.
    pub async fn acquire(&self) -> GatePermit {
        // The semaphore is owned by the gate and never closed.
        let permit = Arc::clone(&self.state.semaphore)
            .acquire_owned()
            .await
            .expect("gate semaphore is never closed");
        let now = self.state.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.peak.fetch_max(now, Ordering::AcqRel);
        GatePermit {
            state: Arc::clone(&self.state),
            _permit: permit,
        }
    }

    pub fn name(&self) -> &'static str {
        self.state.name
    }

    pub fn limit(&self) -> usize {
        self.state.limit
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of permits ever held at once.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::Acquire)
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.state.semaphore.available_permits()
    }
}

/// A held gate slot.
#[derive(Debug)]
pub struct GatePermit {
    state: Arc<GateState>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
