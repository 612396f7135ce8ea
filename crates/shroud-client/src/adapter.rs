//! Interception adapter: decides what gets tunneled and what the caller
//! sees when the tunnel cannot answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use shroud_core::FallbackMode;
use shroud_core::config::AdapterSettings;
use shroud_proto::{HeaderList, LocalRequest, LocalResponse, ProxyRequest, ProxyResponse};

use crate::context::ContextId;
use crate::error::TunnelError;
use crate::hub::MultiplexingHub;

/// Header naming why a response was produced by the fallback path.
pub const FALLBACK_HEADER: &str = "x-shroud-fallback";

/// A request captured at an interception point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedRequest {
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    pub body: Option<Vec<u8>>,
}

impl InterceptedRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HeaderList::new(),
            body: None,
        }
    }

    /// The request as forwarded; GET and HEAD bodies are dropped.
    pub fn into_proxy_request(self) -> ProxyRequest {
        let mut request = ProxyRequest {
            url: self.url,
            method: self.method,
            headers: self.headers,
            body: self.body,
        };
        if request.is_bodyless() {
            request.body = None;
        }
        request
    }
}

impl From<ProxyRequest> for InterceptedRequest {
    fn from(request: ProxyRequest) -> Self {
        Self {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body: request.body,
        }
    }
}

/// What the adapter did with a request.
#[derive(Debug)]
pub enum Interception {
    /// Answered by the relay.
    Proxied(ProxyResponse),
    /// The tunnel failed; `response` came from the fallback policy.
    Fallback {
        response: ProxyResponse,
        reason: TunnelError,
    },
    /// Outside the interception scope; the host should handle it natively.
    Bypass(InterceptedRequest),
}

impl Interception {
    pub fn into_response(self) -> Option<ProxyResponse> {
        match self {
            Self::Proxied(response) | Self::Fallback { response, .. } => Some(response),
            Self::Bypass(_) => None,
        }
    }
}

/// Fetches a request directly, bypassing the tunnel.
#[async_trait]
pub trait DirectFetch: Send + Sync {
    async fn fetch(&self, request: &ProxyRequest) -> Result<ProxyResponse, String>;
}

/// [`DirectFetch`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestFetch {
    http: reqwest::Client,
}

impl ReqwestFetch {
    pub fn new() -> Result<Self, reqwest::Error> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl DirectFetch for ReqwestFetch {
    async fn fetch(&self, request: &ProxyRequest) -> Result<ProxyResponse, String> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| format!("invalid method {}: {e}", request.method))?;
        let mut builder = self.http.request(method, &request.url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let headers: HeaderList = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(ProxyResponse::new(status, headers, body.to_vec()))
    }
}

/// One interception point attached to the hub as its own context.
pub struct InterceptionAdapter {
    hub: Arc<MultiplexingHub>,
    context: ContextId,
    settings: AdapterSettings,
    direct: Option<Arc<dyn DirectFetch>>,
}

impl InterceptionAdapter {
    /// Announce a new context to the hub and wrap it.
    ///
    /// `direct` is only consulted in passthrough fallback mode.
    pub async fn attach(
        hub: Arc<MultiplexingHub>,
        settings: AdapterSettings,
        direct: Option<Arc<dyn DirectFetch>>,
    ) -> Self {
        let context = hub.announce().await;
        Self {
            hub,
            context,
            settings,
            direct,
        }
    }

    pub const fn context_id(&self) -> &ContextId {
        &self.context
    }

    /// Disconnect this adapter's context from the hub.
    pub async fn detach(&self) {
        self.hub.disconnect(&self.context).await;
    }

    pub fn should_intercept(&self, url: &str) -> bool {
        in_scope(&self.settings, url)
    }

    /// Tunnel an in-scope request, falling back on failure.
    ///
    /// Never takes longer than the configured adapter timeout.
    pub async fn handle(&self, request: InterceptedRequest) -> Interception {
        if !self.should_intercept(&request.url) {
            debug!(url = %request.url, "Request outside interception scope");
            return Interception::Bypass(request);
        }
        match self.tunnel(request.into_proxy_request(), Instant::now()).await {
            (response, None) => Interception::Proxied(response),
            (response, Some(reason)) => Interception::Fallback { response, reason },
        }
    }

    /// Answer one local envelope. The response carries the envelope's id and,
    /// when the fallback produced it, an `error` naming the failure.
    pub async fn handle_envelope(&self, envelope: LocalRequest) -> LocalResponse {
        let LocalRequest { id, req } = envelope;
        let started = Instant::now();
        let (response, reason) = if self.should_intercept(&req.url) {
            let request = InterceptedRequest::from(req).into_proxy_request();
            self.tunnel(request, started).await
        } else {
            let reason = TunnelError::OutOfScope(req.url.clone());
            self.fallback(&req, reason, started + self.settings.timeout()).await
        };

        let mut local = LocalResponse::from_proxy(id, response);
        local.error = reason.map(|e| e.to_string());
        local
    }

    /// The direct fetcher, when passthrough fallback is configured.
    fn passthrough(&self) -> Option<&dyn DirectFetch> {
        match (&self.settings.fallback, &self.direct) {
            (FallbackMode::Passthrough, Some(direct)) => Some(&**direct),
            _ => None,
        }
    }

    /// Time the tunnel may take. With passthrough the tail of the timeout
    /// is kept so the direct fetch still has time when the relay is silent.
    fn tunnel_budget(&self) -> Duration {
        let total = self.settings.timeout();
        if self.passthrough().is_some() {
            total.saturating_sub(self.settings.passthrough_budget())
        } else {
            total
        }
    }

    /// Submit through the hub. The second element is set when the response
    /// came from the fallback path.
    async fn tunnel(
        &self,
        request: ProxyRequest,
        started: Instant,
    ) -> (ProxyResponse, Option<TunnelError>) {
        let budget = self.tunnel_budget();
        let submitted =
            timeout_at(started + budget, self.hub.submit(&self.context, request.clone())).await;
        let reason = match submitted {
            Ok(Ok(response)) => return (response, None),
            Ok(Err(e)) => e,
            Err(_) => TunnelError::Elapsed(budget),
        };
        warn!(
            context = %self.context,
            url = %request.url,
            error = %reason,
            "Tunnel failed, using fallback"
        );
        self.fallback(&request, reason, started + self.settings.timeout()).await
    }

    async fn fallback(
        &self,
        request: &ProxyRequest,
        reason: TunnelError,
        deadline: Instant,
    ) -> (ProxyResponse, Option<TunnelError>) {
        if let Some(direct) = self.passthrough() {
            match timeout_at(deadline, direct.fetch(request)).await {
                Ok(Ok(mut response)) => {
                    response.headers.append(FALLBACK_HEADER, reason.kind());
                    return (response, Some(reason));
                }
                Ok(Err(e)) => warn!(url = %request.url, error = %e, "Direct fetch failed"),
                Err(_) => warn!(url = %request.url, "Direct fetch ran out of time"),
            }
        }
        let response = synthetic_response(self.settings.fallback_status, &reason);
        (response, Some(reason))
    }
}

fn synthetic_response(status: u16, reason: &TunnelError) -> ProxyResponse {
    let mut headers = HeaderList::new();
    headers.append("content-type", "text/plain; charset=utf-8");
    headers.append(FALLBACK_HEADER, reason.kind());
    ProxyResponse::new(status, headers, format!("Proxy error: {reason}").into_bytes())
}

/// Path component of an absolute or origin-relative URL, without query or
/// fragment.
fn url_path(url: &str) -> &str {
    let after_scheme = match url.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("/", |i| &rest[i..]),
        None => url,
    };
    after_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(after_scheme)
}

fn in_scope(settings: &AdapterSettings, url: &str) -> bool {
    let path = url_path(url);
    if settings
        .exclude_suffixes
        .iter()
        .any(|suffix| path.ends_with(suffix.as_str()))
    {
        return false;
    }
    path.starts_with(&settings.intercept_prefix)
}
