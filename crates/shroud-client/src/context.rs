//! Interception contexts known to the hub.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Opaque identifier assigned to a context when it announces itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(String);

impl ContextId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The hub's record of one live context.
///
/// The hub holds the only strong reference. Pending requests keep a `Weak`,
/// so once a context disconnects any late responses for it are discarded.
#[derive(Debug)]
pub struct ContextPort {
    id: ContextId,
    announced_at: Instant,
    in_flight: AtomicUsize,
}

impl ContextPort {
    pub(crate) fn new(id: ContextId) -> Self {
        Self {
            id,
            announced_at: Instant::now(),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub const fn id(&self) -> &ContextId {
        &self.id
    }

    /// Time since the context was announced.
    pub fn connected_for(&self) -> Duration {
        self.announced_at.elapsed()
    }

    /// Requests submitted by this context that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
