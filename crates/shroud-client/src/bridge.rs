//! Local listener for interception points.
//!
//! Each accepted TCP connection becomes one context on the hub. The peer
//! writes `LocalRequest` envelopes as newline-delimited JSON and reads
//! `LocalResponse` envelopes back, in completion order. The context is
//! disconnected when the connection closes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use shroud_core::config::AdapterSettings;
use shroud_proto::{LocalRequest, LocalResponse};

use crate::adapter::{DirectFetch, InterceptionAdapter};
use crate::hub::MultiplexingHub;

/// Responses buffered per connection before request handlers wait.
const RESPONSE_BUFFER: usize = 64;

/// Pause after a failed accept, e.g. while the fd table is full.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a bridge connection needs to build its adapter.
#[derive(Clone)]
pub struct Bridge {
    hub: Arc<MultiplexingHub>,
    settings: AdapterSettings,
    direct: Option<Arc<dyn DirectFetch>>,
}

impl Bridge {
    pub fn new(
        hub: Arc<MultiplexingHub>,
        settings: AdapterSettings,
        direct: Option<Arc<dyn DirectFetch>>,
    ) -> Self {
        Self {
            hub,
            settings,
            direct,
        }
    }

    /// Accept connections until shutdown. Failed accepts are logged and
    /// retried.
    pub async fn serve(&self, listener: TcpListener, shutdown: watch::Receiver<bool>) {
        self.serve_incoming(|| listener.accept(), shutdown).await;
    }

    async fn serve_incoming<F, Fut>(&self, mut accept: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
    {
        loop {
            tokio::select! {
                accepted = accept() => match accepted {
                    Ok((stream, peer)) => {
                        let bridge = self.clone();
                        tokio::spawn(async move {
                            bridge.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept bridge connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = shutdown.changed() => {
                    info!("Bridge listener stopping");
                    return;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let adapter = Arc::new(
            InterceptionAdapter::attach(
                Arc::clone(&self.hub),
                self.settings.clone(),
                self.direct.clone(),
            )
            .await,
        );
        info!(peer = %peer, context = %adapter.context_id(), "Interception point connected");

        let (reader, mut writer) = stream.into_split();
        let (response_tx, mut response_rx) = mpsc::channel::<LocalResponse>(RESPONSE_BUFFER);

        tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                let mut line = match serde_json::to_string(&response) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(id = %response.id, error = %e, "Failed to encode envelope");
                        continue;
                    }
                };
                line.push('\n');
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Bridge read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let envelope: LocalRequest = match serde_json::from_str(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Dropping malformed envelope");
                    continue;
                }
            };
            debug!(id = %envelope.id, url = %envelope.req.url, "Envelope received");

            let adapter = Arc::clone(&adapter);
            let response_tx = response_tx.clone();
            tokio::spawn(async move {
                let response = adapter.handle_envelope(envelope).await;
                let _ = response_tx.send(response).await;
            });
        }

        adapter.detach().await;
        info!(peer = %peer, context = %adapter.context_id(), "Interception point disconnected");
    }
}
