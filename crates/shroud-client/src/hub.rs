//! Context registry and request submission.
//!
//! Many interception contexts share one session. The hub hands each a
//! context id, forwards their requests through the session and routes each
//! response back to the context that asked for it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::{debug, info};

use shroud_proto::{ProxyRequest, ProxyResponse};

use crate::context::{ContextId, ContextPort};
use crate::error::TunnelError;
use crate::session::SessionManager;

/// Shares one tunnel session between many contexts.
pub struct MultiplexingHub {
    session: Arc<SessionManager>,
    contexts: RwLock<HashMap<ContextId, Arc<ContextPort>>>,
}

impl MultiplexingHub {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            contexts: RwLock::new(HashMap::new()),
        }
    }

    pub const fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Register a new context and return its id.
    pub async fn announce(&self) -> ContextId {
        let id = ContextId::generate();
        let port = Arc::new(ContextPort::new(id.clone()));
        let count = {
            let mut contexts = self.contexts.write().await;
            contexts.insert(id.clone(), port);
            contexts.len()
        };
        info!(context = %id, contexts = count, "Context announced");
        id
    }

    /// Forget a context. Responses still in flight for it are discarded.
    pub async fn disconnect(&self, id: &ContextId) -> bool {
        let removed = self.contexts.write().await.remove(id);
        match removed {
            Some(port) => {
                let connected_ms = u64::try_from(port.connected_for().as_millis()).unwrap_or(u64::MAX);
                info!(
                    context = %id,
                    in_flight = port.in_flight(),
                    connected_ms,
                    "Context disconnected"
                );
                true
            }
            None => {
                debug!(context = %id, "Disconnect for unknown context");
                false
            }
        }
    }

    /// Send a request on behalf of a context and wait for its response.
    ///
    /// Waits for the session to be ready, bounded by the session's ready
    /// wait. Other contexts are never affected by this request's outcome.
    pub async fn submit(
        &self,
        context: &ContextId,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, TunnelError> {
        let owner = {
            let contexts = self.contexts.read().await;
            let port = contexts
                .get(context)
                .ok_or_else(|| TunnelError::ContextNotFound(context.to_string()))?;
            Arc::downgrade(port)
        };

        let _in_flight = InFlight::enter(&owner);
        let pending = self
            .session
            .encrypt_and_send(&request, owner.clone())
            .await?;
        let id = pending.id().clone();
        let result = pending.wait().await;
        match &result {
            Ok(response) => {
                debug!(context = %context, id = %id, status = response.status, "Request completed");
            }
            Err(e) => debug!(context = %context, id = %id, error = %e, "Request failed"),
        }
        result
    }

    pub async fn context_count(&self) -> usize {
        self.contexts.read().await.len()
    }

    /// Requests in flight for a context, `None` if it is not registered.
    pub async fn in_flight(&self, context: &ContextId) -> Option<usize> {
        self.contexts
            .read()
            .await
            .get(context)
            .map(|port| port.in_flight())
    }
}

/// Counts a request against its context for as long as it is alive.
/// Holds only a weak reference so it never keeps the context registered.
struct InFlight(Weak<ContextPort>);

impl InFlight {
    fn enter(owner: &Weak<ContextPort>) -> Self {
        if let Some(port) = owner.upgrade() {
            port.begin_request();
        }
        Self(owner.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(port) = self.0.upgrade() {
            port.end_request();
        }
    }
}
