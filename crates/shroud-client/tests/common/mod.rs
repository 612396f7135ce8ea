//! In-process fake relay for integration tests.
//!
//! Speaks the relay side of the handshake with a real RSA keypair, decrypts
//! requests, and answers them according to a per-test responder.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

use shroud_client::{
    Connector, Correlator, MultiplexingHub, ReconnectPolicy, SessionConfig, SessionError,
    SessionManager, SessionState, StaticKeySource, TransportLink,
};
use shroud_core::PendingPolicy;
use shroud_crypto::{EnvelopeCipher, RelayKeyPair, encoding};
use shroud_proto::{ControlMessage, DataFrame, HeaderList, ProxyRequest};

/// How the relay answers one request.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub delay: Duration,
    pub status: Option<u16>,
    pub headers: Option<HeaderList>,
    pub body: Vec<u8>,
    /// Flip a bit of the tag so the client's decryption fails.
    pub corrupt_tag: bool,
    /// Never answer.
    pub silent: bool,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderList) -> Self {
        self.headers = Some(headers);
        self
    }

    #[must_use]
    pub const fn corrupted(mut self) -> Self {
        self.corrupt_tag = true;
        self
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }
}

pub type Responder = Arc<dyn Fn(&ProxyRequest) -> Reply + Send + Sync>;

/// Echo the request URL back as the body.
pub fn echo_url() -> Responder {
    Arc::new(|req: &ProxyRequest| Reply::ok(req.url.clone()))
}

#[derive(Default)]
struct RelayState {
    session_keys: Vec<[u8; 32]>,
    request_ids: Vec<String>,
    requests: Vec<ProxyRequest>,
    connections: usize,
    current: Option<Connection>,
}

struct Connection {
    tx: mpsc::WeakSender<String>,
    kill: Arc<Notify>,
}

struct Inner {
    keypair: RelayKeyPair,
    document: String,
    responder: Mutex<Responder>,
    ack_delay: Mutex<Duration>,
    withhold_ack: AtomicBool,
    refuse: AtomicBool,
    state: Mutex<RelayState>,
    ready: Notify,
}

/// Fake relay. Cloning shares the same relay.
#[derive(Clone)]
pub struct FakeRelay {
    inner: Arc<Inner>,
}

impl FakeRelay {
    pub fn new() -> Self {
        let keypair = RelayKeyPair::generate(1024).unwrap();
        let document = keypair.public_document().unwrap();
        Self {
            inner: Arc::new(Inner {
                keypair,
                document,
                responder: Mutex::new(echo_url()),
                ack_delay: Mutex::new(Duration::ZERO),
                withhold_ack: AtomicBool::new(false),
                refuse: AtomicBool::new(false),
                state: Mutex::new(RelayState::default()),
                ready: Notify::new(),
            }),
        }
    }

    pub fn key_document(&self) -> String {
        self.inner.document.clone()
    }

    pub fn key_source(&self) -> Arc<StaticKeySource> {
        Arc::new(StaticKeySource::new(self.key_document()))
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.inner.responder.lock().unwrap() = responder;
    }

    pub fn set_ack_delay(&self, delay: Duration) {
        *self.inner.ack_delay.lock().unwrap() = delay;
    }

    pub fn withhold_ack(&self, withhold: bool) {
        self.inner.withhold_ack.store(withhold, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Raw session keys, one per completed `init`, in order.
    pub fn session_keys(&self) -> Vec<[u8; 32]> {
        self.inner.state.lock().unwrap().session_keys.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().unwrap().connections
    }

    /// Correlation ids of every data frame received, in arrival order.
    pub fn request_ids(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().request_ids.clone()
    }

    /// Decrypted requests, in arrival order.
    pub fn requests(&self) -> Vec<ProxyRequest> {
        self.inner.state.lock().unwrap().requests.clone()
    }

    /// Wait until `n` requests have arrived.
    pub async fn wait_for_requests(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.inner.ready.notified();
                if self.inner.state.lock().unwrap().request_ids.len() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap();
    }

    /// Drop the current connection from the relay side.
    pub fn drop_connection(&self) {
        if let Some(conn) = self.inner.state.lock().unwrap().current.take() {
            conn.kill.notify_one();
        }
    }

    /// Send a raw text frame on the current connection.
    pub async fn inject(&self, text: impl Into<String>) {
        let tx = self
            .inner
            .state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .and_then(|c| c.tx.upgrade())
            .unwrap();
        tx.send(text.into()).await.unwrap();
    }

    /// Cipher for the most recent session key, as the relay holds it.
    pub fn current_cipher(&self) -> EnvelopeCipher {
        let keys = self.session_keys();
        let key = shroud_crypto::SessionKey::from_bytes(keys.last().unwrap()).unwrap();
        EnvelopeCipher::new(&key)
    }
}

#[async_trait]
impl Connector for FakeRelay {
    async fn connect(&self) -> Result<TransportLink, SessionError> {
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("connection refused".into()));
        }
        let (client_end, relay_end) = TransportLink::pair(256);
        let kill = Arc::new(Notify::new());
        {
            let mut state = self.inner.state.lock().unwrap();
            state.connections += 1;
            state.current = Some(Connection {
                tx: relay_end.tx.downgrade(),
                kill: Arc::clone(&kill),
            });
        }
        tokio::spawn(serve_connection(Arc::clone(&self.inner), relay_end, kill));
        Ok(client_end)
    }
}

async fn serve_connection(inner: Arc<Inner>, link: TransportLink, kill: Arc<Notify>) {
    let TransportLink { tx, mut rx } = link;

    let key = loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(text) = frame else { return };
                if let Ok(ControlMessage::Init { encrypted_key_base64 }) = ControlMessage::from_json(&text) {
                    let wrapped = encoding::decode(&encrypted_key_base64).unwrap();
                    break inner.keypair.unwrap_key(&wrapped).unwrap();
                }
            }
            () = kill.notified() => return,
        }
    };
    inner
        .state
        .lock()
        .unwrap()
        .session_keys
        .push(*key.as_bytes());

    if inner.withhold_ack.load(Ordering::SeqCst) {
        kill.notified().await;
        return;
    }
    let ack_delay = *inner.ack_delay.lock().unwrap();
    tokio::select! {
        () = tokio::time::sleep(ack_delay) => {}
        () = kill.notified() => return,
    }
    if tx
        .send(ControlMessage::InitAck.to_json().unwrap())
        .await
        .is_err()
    {
        return;
    }

    // Responder tasks only hold weak senders, so dropping `tx` on return
    // closes the connection even while replies are still pending.
    let cipher = Arc::new(EnvelopeCipher::new(&key));
    let weak_tx = tx.downgrade();

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(text) = frame else { return };
                handle_frame(&inner, &cipher, &weak_tx, &text);
            }
            () = kill.notified() => return,
        }
    }
}

fn handle_frame(
    inner: &Arc<Inner>,
    cipher: &Arc<EnvelopeCipher>,
    tx: &mpsc::WeakSender<String>,
    text: &str,
) {
    let Ok(ControlMessage::Data(frame)) = ControlMessage::from_json(text) else {
        return;
    };
    let iv = encoding::decode(&frame.iv_base64).unwrap();
    let ciphertext = encoding::decode(&frame.payload_base64).unwrap();
    let tag = encoding::decode(&frame.tag_base64).unwrap();
    let plaintext = cipher.open(&iv, &ciphertext, &tag).unwrap();
    let request: ProxyRequest = serde_json::from_slice(&plaintext).unwrap();

    let responder = Arc::clone(&*inner.responder.lock().unwrap());
    let reply = responder(&request);
    {
        let mut state = inner.state.lock().unwrap();
        state.request_ids.push(frame.id.clone());
        state.requests.push(request);
    }
    inner.ready.notify_waiters();

    if reply.silent {
        return;
    }
    let cipher = Arc::clone(cipher);
    let tx = tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(reply.delay).await;
        let sealed = cipher.seal(&reply.body).unwrap();
        let mut tag = sealed.tag;
        if reply.corrupt_tag {
            tag[0] ^= 0x01;
        }
        let response = ControlMessage::Data(DataFrame {
            id: frame.id,
            iv_base64: encoding::encode(&sealed.iv),
            payload_base64: encoding::encode(&sealed.ciphertext),
            tag_base64: encoding::encode(&tag),
            status: reply.status,
            headers: reply.headers,
        });
        if let Some(tx) = tx.upgrade() {
            let _ = tx.send(response.to_json().unwrap()).await;
        }
    });
}

/// Session config with short timeouts and a fast fixed backoff.
pub fn test_config(pending_policy: PendingPolicy) -> SessionConfig {
    SessionConfig {
        handshake_timeout: Duration::from_secs(2),
        ready_wait: Duration::from_secs(2),
        reconnect: ReconnectPolicy::fixed(Duration::from_millis(20)),
        pending_policy,
    }
}

/// A running client wired to `relay`.
pub struct Harness {
    pub session: Arc<SessionManager>,
    pub hub: Arc<MultiplexingHub>,
    pub correlator: Arc<Correlator>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Harness {
    pub fn start(relay: &FakeRelay, config: SessionConfig, deadline: Duration) -> Self {
        let correlator = Arc::new(Correlator::new(deadline));
        let session = Arc::new(SessionManager::new(
            Arc::new(relay.clone()),
            relay.key_source(),
            Arc::clone(&correlator),
            config,
        ));
        let hub = Arc::new(MultiplexingHub::new(Arc::clone(&session)));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run(shutdown_rx).await })
        };
        Self {
            session,
            hub,
            correlator,
            shutdown,
            task,
        }
    }

    /// Start and wait for the first session to be ready.
    pub async fn ready(relay: &FakeRelay, config: SessionConfig, deadline: Duration) -> Self {
        let harness = Self::start(relay, config, deadline);
        harness.wait_for(SessionState::Ready).await;
        harness
    }

    pub async fn wait_for(&self, state: SessionState) {
        let mut rx = self.session.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    /// Wait until a session with at least `epoch` is Ready.
    pub async fn wait_for_epoch(&self, epoch: u64) {
        let mut rx = self.session.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if self.session.epoch() >= epoch && rx.borrow_and_update().is_ready() {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    pub async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.task.await.unwrap();
    }
}
