//! Session lifecycle: connect, handshake, serve, reconnect.
//!
//! A session is one transport connection plus the AES key negotiated on it.
//! Keys never outlive their connection; every reconnect runs a fresh
//! handshake and bumps the session epoch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use shroud_core::PendingPolicy;
use shroud_crypto::{CryptoError, EnvelopeCipher, RelayPublicKey, SessionKey, encoding};
use shroud_proto::{ControlMessage, DataFrame, ProxyRequest, ProxyResponse};

use crate::config::SessionConfig;
use crate::context::ContextPort;
use crate::correlator::{CorrelationId, Correlator, PendingResponse};
use crate::error::{SessionError, TunnelError};
use crate::keysource::KeySource;
use crate::transport::{Connector, TransportLink};

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

impl SessionState {
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Key material and outbound channel of the current session.
struct ActiveSession {
    epoch: u64,
    cipher: EnvelopeCipher,
    outbound: mpsc::Sender<String>,
}

/// A connected, handshaken session returned by [`SessionManager::connect`].
/// Hand it to [`SessionManager::serve`] to process inbound frames.
pub struct Established {
    session: Arc<ActiveSession>,
    inbound: mpsc::Receiver<String>,
}

impl Established {
    pub fn epoch(&self) -> u64 {
        self.session.epoch
    }
}

/// Owns the relay connection and the per-session key.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    key_source: Arc<dyn KeySource>,
    correlator: Arc<Correlator>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    active: RwLock<Option<Arc<ActiveSession>>>,
    epochs: AtomicU64,
    rekey: Notify,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        key_source: Arc<dyn KeySource>,
        correlator: Arc<Correlator>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Closed);
        Self {
            connector,
            key_source,
            correlator,
            config,
            state,
            active: RwLock::new(None),
            epochs: AtomicU64::new(0),
            rekey: Notify::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Epoch of the most recent session, 0 before the first handshake.
    pub fn epoch(&self) -> u64 {
        self.epochs.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub const fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Session state changed");
        }
    }

    /// Keep a session up until shutdown, reconnecting with backoff.
    ///
    /// The backoff counter resets once a session reaches Ready.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let policy = self.config.reconnect.clone();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let connected = tokio::select! {
                result = self.connect() => result,
                _ = shutdown.changed() => break,
            };
            let result = match connected {
                Ok(established) => {
                    attempt = 0;
                    self.serve(established, &mut shutdown).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(e) => {
                    self.set_state(SessionState::Closed);
                    if !policy.should_retry(attempt) {
                        error!(attempts = attempt, error = %e, "Giving up on relay connection");
                        return;
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Session ended, reconnecting"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }

        self.set_state(SessionState::Closed);
        self.active.write().await.take();
        info!("Session manager stopped");
    }

    /// Open the transport and run the handshake. On success the session is
    /// Ready and requests can flow.
    pub async fn connect(&self) -> Result<Established, SessionError> {
        self.set_state(SessionState::Connecting);
        let mut link = self.connector.connect().await?;

        self.set_state(SessionState::Handshaking);
        let cipher = self.handshake(&mut link).await?;

        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(ActiveSession {
            epoch,
            cipher,
            outbound: link.tx,
        });
        *self.active.write().await = Some(Arc::clone(&session));
        self.set_state(SessionState::Ready);
        info!(epoch, "Session ready");

        if self.config.pending_policy == PendingPolicy::Resubmit {
            self.resubmit_orphans(&session).await;
        }

        Ok(Established {
            session,
            inbound: link.rx,
        })
    }

    async fn handshake(&self, link: &mut TransportLink) -> Result<EnvelopeCipher, SessionError> {
        let document = self.key_source.fetch_document().await?;
        let relay_key = RelayPublicKey::from_document(&document)
            .map_err(|e| SessionError::Handshake(e.to_string()))?;

        let key = SessionKey::generate();
        let wrapped = relay_key
            .wrap(&key)
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        let init = ControlMessage::Init {
            encrypted_key_base64: encoding::encode(&wrapped),
        }
        .to_json()
        .map_err(|e| SessionError::Handshake(e.to_string()))?;

        link.tx
            .send(init)
            .await
            .map_err(|_| SessionError::Transport("transport closed before init".into()))?;
        debug!(key_bits = relay_key.bits(), "Sent init");

        tokio::time::timeout(self.config.handshake_timeout, Self::await_ack(&mut link.rx))
            .await
            .map_err(|_| {
                SessionError::Handshake(format!(
                    "no init_ack within {:?}",
                    self.config.handshake_timeout
                ))
            })??;

        Ok(EnvelopeCipher::new(&key))
    }

    async fn await_ack(inbound: &mut mpsc::Receiver<String>) -> Result<(), SessionError> {
        while let Some(text) = inbound.recv().await {
            match ControlMessage::from_json(&text) {
                Ok(ControlMessage::InitAck) => return Ok(()),
                Ok(other) => debug!(kind = other.kind(), "Ignoring frame before init_ack"),
                Err(e) => debug!(error = %e, "Ignoring unparseable frame before init_ack"),
            }
        }
        Err(SessionError::Transport(
            "transport closed before init_ack".into(),
        ))
    }

    /// Process inbound frames until the transport drops or shutdown.
    /// Tears the session down either way.
    pub async fn serve(
        &self,
        established: Established,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let Established {
            session,
            mut inbound,
        } = established;

        let result = loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => self.on_frame(&text).await,
                    None => break Err(SessionError::Transport("relay connection lost".into())),
                },
                () = self.rekey.notified() => {
                    break Err(SessionError::Closed("IV budget exhausted, rekeying".into()));
                }
                _ = shutdown.changed() => break Ok(()),
            }
        };

        self.teardown(session.epoch).await;
        result
    }

    async fn teardown(&self, epoch: u64) {
        // State flips before the key is dropped so waiters never see Ready
        // without an active session.
        self.set_state(SessionState::Closed);
        self.active.write().await.take();

        match self.config.pending_policy {
            PendingPolicy::Fail => {
                let failed = self
                    .correlator
                    .fail_epoch(epoch, |id| TunnelError::TransportLoss { id: id.to_string() })
                    .await;
                if failed > 0 {
                    warn!(epoch, failed, "Failed requests pending on lost session");
                }
            }
            PendingPolicy::AwaitTimeout => {}
            PendingPolicy::Resubmit => {
                let orphaned = self.correlator.orphan_epoch(epoch).await;
                if orphaned > 0 {
                    info!(epoch, orphaned, "Holding requests for resubmission");
                }
            }
        }
        info!(epoch, "Session closed");
    }

    /// Wait for a Ready session until `deadline`.
    async fn wait_ready(&self, deadline: Instant) -> Result<Arc<ActiveSession>, TunnelError> {
        let mut state = self.state.subscribe();
        loop {
            let gate = async { state.wait_for(|s| s.is_ready()).await.map(|_| ()) };
            match tokio::time::timeout_at(deadline, gate).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return Err(TunnelError::NoSession(self.config.ready_wait)),
            }
            if let Some(session) = self.active.read().await.clone() {
                return Ok(session);
            }
            // Torn down between the gate and the read; state is Closed now.
        }
    }

    /// Encrypt a request and send it under a fresh correlation id.
    ///
    /// Waits (bounded by the configured ready wait) for a Ready session.
    /// The returned handle completes with the response or a request error.
    pub async fn encrypt_and_send(
        &self,
        request: &ProxyRequest,
        owner: Weak<ContextPort>,
    ) -> Result<PendingResponse, TunnelError> {
        let plaintext: Arc<[u8]> = serde_json::to_vec(request)
            .map_err(|e| TunnelError::Encode(e.to_string()))?
            .into();

        let ready_by = Instant::now() + self.config.ready_wait;
        let (session, id, pending) = loop {
            let session = self.wait_ready(ready_by).await?;
            // Registering under the read guard orders this entry before any
            // teardown of the session, so the loss policy always sees it.
            let active = self.active.read().await;
            if active.as_ref().is_some_and(|a| Arc::ptr_eq(a, &session)) {
                let (id, pending) = self
                    .correlator
                    .register(Arc::clone(&plaintext), owner.clone(), session.epoch)
                    .await;
                break (session, id, pending);
            }
            debug!(epoch = session.epoch, "Session ended before registration, waiting again");
        };

        if let Err(e) = self.seal_and_send(&session, &id, &plaintext).await {
            self.correlator.reject(id.as_str(), e.clone()).await;
            return Err(e);
        }

        debug!(
            id = %id,
            epoch = session.epoch,
            method = %request.method,
            url = %request.url,
            "Request sent"
        );
        Ok(pending)
    }

    async fn seal_and_send(
        &self,
        session: &ActiveSession,
        id: &CorrelationId,
        plaintext: &[u8],
    ) -> Result<(), TunnelError> {
        let sealed = match session.cipher.seal(plaintext) {
            Ok(sealed) => sealed,
            Err(CryptoError::IvBudgetExhausted) => {
                error!(epoch = session.epoch, "IV budget exhausted, forcing a new session");
                self.rekey.notify_one();
                return Err(TunnelError::TransportLoss { id: id.to_string() });
            }
            Err(e) => return Err(TunnelError::Encode(e.to_string())),
        };

        let frame = ControlMessage::Data(DataFrame {
            id: id.to_string(),
            iv_base64: encoding::encode(&sealed.iv),
            payload_base64: encoding::encode(&sealed.ciphertext),
            tag_base64: encoding::encode(&sealed.tag),
            status: None,
            headers: None,
        })
        .to_json()
        .map_err(|e| TunnelError::Encode(e.to_string()))?;

        session
            .outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::TransportLoss { id: id.to_string() })
    }

    async fn resubmit_orphans(&self, session: &ActiveSession) {
        for (id, plaintext) in self.correlator.adopt_orphans(session.epoch).await {
            if let Err(e) = self.seal_and_send(session, &id, &plaintext).await {
                self.correlator.reject(id.as_str(), e).await;
            }
        }
    }

    /// Handle one inbound frame against the current session. Frames that
    /// arrive with no active session are dropped.
    pub async fn on_frame(&self, text: &str) {
        let session = self.active.read().await.clone();
        match session {
            Some(session) => self.dispatch(&session, text).await,
            None => debug!("Dropping frame with no active session"),
        }
    }

    async fn dispatch(&self, session: &ActiveSession, text: &str) {
        let message = match ControlMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                // Still fail the one request it names, if it names one.
                let id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("id")?.as_str().map(str::to_owned));
                warn!(error = %e, id = ?id, "Malformed frame from relay");
                if let Some(id) = id {
                    self.correlator
                        .reject(
                            &id,
                            TunnelError::Decryption {
                                id: id.clone(),
                                reason: format!("malformed frame: {e}"),
                            },
                        )
                        .await;
                }
                return;
            }
        };

        match message {
            ControlMessage::Data(frame) => self.deliver(session, frame).await,
            ControlMessage::InitAck => debug!("Ignoring repeated init_ack"),
            ControlMessage::Init { .. } => warn!("Ignoring init sent by relay"),
        }
    }

    async fn deliver(&self, session: &ActiveSession, frame: DataFrame) {
        match open_frame(&session.cipher, &frame) {
            Ok(body) => {
                let response = ProxyResponse::new(
                    frame.status.unwrap_or(ProxyResponse::DEFAULT_STATUS),
                    frame.headers.unwrap_or_default(),
                    body,
                );
                if self.correlator.resolve(&frame.id, response).await {
                    debug!(id = %frame.id, "Response delivered");
                }
            }
            Err(e) => {
                warn!(id = %frame.id, error = %e, "Response failed to decrypt");
                self.correlator
                    .reject(
                        &frame.id,
                        TunnelError::Decryption {
                            id: frame.id.clone(),
                            reason: e.to_string(),
                        },
                    )
                    .await;
            }
        }
    }
}

fn open_frame(cipher: &EnvelopeCipher, frame: &DataFrame) -> Result<Vec<u8>, CryptoError> {
    let iv = encoding::decode(&frame.iv_base64)?;
    let ciphertext = encoding::decode(&frame.payload_base64)?;
    let tag = encoding::decode(&frame.tag_base64)?;
    cipher.open(&iv, &ciphertext, &tag)
}
