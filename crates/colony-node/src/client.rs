//! Outbound RPC client shared by master and worker.
//!
//! Every call goes through the circuit breaker of the peer it targets and is
//! counted in [`RuntimeMetrics`]. Once [`PeerClient::begin_shutdown`] has been
//! called, acknowledgement-style calls that fail are reported as
//! [`Delivery::Assumed`] instead of as errors.

use colony_observability::RuntimeMetrics;
use dashmap::DashMap;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::config::CircuitBreakerConfig;
use crate::error::{ErrorResponse, NodeError, NodeResult};

/// Outcome of a call whose answer only acknowledges receipt
#[derive(Debug)]
pub enum Delivery {
    Delivered,
    /// The call failed during shutdown and was treated as delivered
    Assumed,
    Failed(NodeError),
}

impl Delivery {
    pub fn is_failed(&self) -> bool {
        matches!(self, Delivery::Failed(_))
    }
}

#[derive(Clone)]
pub struct PeerClient {
    http: Client,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    breaker_config: CircuitBreakerConfig,
    shutting_down: Arc<AtomicBool>,
    metrics: Option<Arc<RuntimeMetrics>>,
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("peers", &self.breakers.len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl PeerClient {
    pub fn new(timeout: Duration, breaker_config: CircuitBreakerConfig) -> NodeResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(format!("colony-node/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NodeError::Server(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            breakers: Arc::new(DashMap::new()),
            breaker_config,
            shutting_down: Arc::new(AtomicBool::new(false)),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<RuntimeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Breaker for one peer base URL, created on first use
    pub fn breaker(&self, peer: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(peer.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config.clone())))
            .clone()
    }

    pub async fn post<Req, Resp>(
        &self,
        op: &'static str,
        peer: &str,
        path: &str,
        body: &Req,
    ) -> NodeResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let request = self.http.post(format!("{peer}{path}")).json(body);
        self.execute(op, peer, request).await
    }

    pub async fn get<Resp>(&self, op: &'static str, peer: &str, path: &str) -> NodeResult<Resp>
    where
        Resp: DeserializeOwned,
    {
        let request = self.http.get(format!("{peer}{path}"));
        self.execute(op, peer, request).await
    }

    /// POST whose only purpose is to be acknowledged
    pub async fn acknowledge<Req, Resp>(
        &self,
        op: &'static str,
        peer: &str,
        path: &str,
        body: &Req,
    ) -> Delivery
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        match self.post::<Req, Resp>(op, peer, path, body).await {
            Ok(_) => Delivery::Delivered,
            Err(err) if self.is_shutting_down() => {
                warn!(op, peer, error = %err, "Peer unreachable during shutdown, assuming delivered");
                Delivery::Assumed
            }
            Err(err) => Delivery::Failed(err),
        }
    }

    async fn execute<Resp>(
        &self,
        op: &'static str,
        peer: &str,
        request: reqwest::RequestBuilder,
    ) -> NodeResult<Resp>
    where
        Resp: DeserializeOwned,
    {
        let breaker = self.breaker(peer);
        if !breaker.is_allowed() {
            if let Some(metrics) = &self.metrics {
                metrics.record_rpc_rejected(op);
            }
            return Err(NodeError::CircuitOpen {
                peer: peer.to_string(),
            });
        }

        let started = Instant::now();
        let result = send(peer, request).await;
        match &result {
            // an error answer still means the peer is up
            Ok(_) => breaker.record_success(),
            Err(err) if err.is_retryable() => breaker.record_failure(),
            Err(_) => breaker.record_success(),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_rpc(op, result.is_ok(), started.elapsed());
        }
        if let Err(err) = &result {
            debug!(op, peer, error = %err, "RPC failed");
        }
        result
    }
}

async fn send<Resp>(peer: &str, request: reqwest::RequestBuilder) -> NodeResult<Resp>
where
    Resp: DeserializeOwned,
{
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<Resp>().await?);
    }

    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => (body.code, body.message),
        Err(_) => ("http".to_string(), text),
    };
    Err(NodeError::Remote {
        peer: peer.to_string(),
        status: status.as_u16(),
        code,
        message,
    })
}
