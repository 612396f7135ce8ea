//! Pending-request bookkeeping keyed by correlation id.
//!
//! Every request sent over the tunnel gets a fresh id and a completion slot.
//! The slot completes exactly once: with the relay's response, with a
//! request-scoped error, or with a timeout once the deadline passes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{RwLock, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use shroud_proto::ProxyResponse;

use crate::context::ContextPort;
use crate::error::TunnelError;

/// Outcome delivered to whoever submitted a request.
pub type Completion = Result<ProxyResponse, TunnelError>;

/// Default age after which a pending request times out.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(15);

/// Identifier pairing a tunneled request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

struct PendingEntry {
    deadline: Instant,
    /// Session epoch the request was sent under. `None` while orphaned and
    /// waiting for the next session.
    epoch: Option<u64>,
    owner: Weak<ContextPort>,
    completion: oneshot::Sender<Completion>,
    /// Serialized request, kept so it can be sent again after a reconnect.
    request: Arc<[u8]>,
}

/// Receiving half of a registered request.
#[derive(Debug)]
pub struct PendingResponse {
    id: CorrelationId,
    rx: oneshot::Receiver<Completion>,
}

impl PendingResponse {
    /// The id the request was first registered under. A resubmitted request
    /// travels under a new id but still completes here.
    pub const fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub async fn wait(self) -> Completion {
        self.rx
            .await
            .unwrap_or_else(|_| Err(TunnelError::Abandoned(self.id.to_string())))
    }
}

/// Map of in-flight requests awaiting a response from the relay.
pub struct Correlator {
    pending: RwLock<HashMap<CorrelationId, PendingEntry>>,
    deadline: Duration,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_DEADLINE)
    }
}

impl Correlator {
    pub fn new(deadline: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            deadline,
        }
    }

    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Register a request under a fresh id unique among pending entries.
    pub async fn register(
        &self,
        request: Arc<[u8]>,
        owner: Weak<ContextPort>,
        epoch: u64,
    ) -> (CorrelationId, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.write().await;
        let id = Self::fresh_id(&pending);
        pending.insert(
            id.clone(),
            PendingEntry {
                deadline: Instant::now() + self.deadline,
                epoch: Some(epoch),
                owner,
                completion: tx,
                request,
            },
        );
        drop(pending);
        (id.clone(), PendingResponse { id, rx })
    }

    fn fresh_id(pending: &HashMap<CorrelationId, PendingEntry>) -> CorrelationId {
        loop {
            let id = CorrelationId::generate();
            if !pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Complete a pending request with the relay's response.
    ///
    /// Returns `false` if the id is unknown (already completed, expired or
    /// never registered) or its owning context is gone.
    pub async fn resolve(&self, id: &str, response: ProxyResponse) -> bool {
        self.settle(id, Ok(response)).await
    }

    /// Fail a single pending request.
    pub async fn reject(&self, id: &str, error: TunnelError) -> bool {
        self.settle(id, Err(error)).await
    }

    async fn settle(&self, id: &str, outcome: Completion) -> bool {
        let Some(entry) = self.pending.write().await.remove(id) else {
            debug!(id, "No pending request for id");
            return false;
        };
        if entry.owner.strong_count() == 0 {
            debug!(id, "Owning context is gone, discarding result");
            return false;
        }
        entry.completion.send(outcome).is_ok()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.pending.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }

    /// Fail every request whose deadline has passed. Returns the expired ids.
    pub async fn expire_overdue(&self) -> Vec<CorrelationId> {
        let now = Instant::now();
        let overdue: Vec<(CorrelationId, PendingEntry)> = {
            let mut pending = self.pending.write().await;
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let mut expired = Vec::with_capacity(overdue.len());
        for (id, entry) in overdue {
            warn!(id = %id, "Pending request timed out");
            let _ = entry.completion.send(Err(TunnelError::Timeout {
                id: id.to_string(),
            }));
            expired.push(id);
        }
        expired
    }

    /// Periodically expire overdue requests until shutdown.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        correlator.expire_overdue().await;
                    }
                    _ = shutdown.changed() => {
                        debug!("Correlator sweeper stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Fail every request sent under `epoch`. Returns how many were failed.
    pub async fn fail_epoch(
        &self,
        epoch: u64,
        error: impl Fn(&CorrelationId) -> TunnelError,
    ) -> usize {
        let failed: Vec<(CorrelationId, PendingEntry)> = {
            let mut pending = self.pending.write().await;
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, entry)| entry.epoch == Some(epoch))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = failed.len();
        for (id, entry) in failed {
            let _ = entry.completion.send(Err(error(&id)));
        }
        count
    }

    /// Detach every request sent under `epoch` so it can be resubmitted.
    /// Deadlines keep running.
    pub async fn orphan_epoch(&self, epoch: u64) -> usize {
        let mut pending = self.pending.write().await;
        let mut count = 0;
        for entry in pending.values_mut() {
            if entry.epoch == Some(epoch) {
                entry.epoch = None;
                count += 1;
            }
        }
        count
    }

    /// Move every orphaned request to `epoch` under a fresh id.
    ///
    /// Returns the new ids with the serialized requests to send again.
    /// Requests whose owner has disconnected are dropped instead.
    pub async fn adopt_orphans(&self, epoch: u64) -> Vec<(CorrelationId, Arc<[u8]>)> {
        let mut pending = self.pending.write().await;
        let orphaned: Vec<CorrelationId> = pending
            .iter()
            .filter(|(_, entry)| entry.epoch.is_none())
            .map(|(id, _)| id.clone())
            .collect();

        let mut adopted = Vec::with_capacity(orphaned.len());
        for old_id in orphaned {
            let Some(mut entry) = pending.remove(&old_id) else {
                continue;
            };
            if entry.owner.strong_count() == 0 {
                debug!(id = %old_id, "Dropping orphan of a disconnected context");
                continue;
            }
            let new_id = Self::fresh_id(&pending);
            entry.epoch = Some(epoch);
            let request = Arc::clone(&entry.request);
            pending.insert(new_id.clone(), entry);
            adopted.push((new_id, request));
        }
        drop(pending);

        if !adopted.is_empty() {
            info!(epoch, count = adopted.len(), "Adopted orphaned requests");
        }
        adopted
    }
}
