use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::analytics::{LoggingObserver, OutcomeObserver, Stats};
use crate::config::Config;
use crate::document::{Encoder, JsonEncoder};
use crate::error::{AppError, Result};
use crate::http::outcome::{DispatchReport, Outcome, OutcomeHandle};
use crate::http::pool::create_http_client;
use crate::http::rate_limiter::PermitPool;
use crate::transport::{HttpTransport, OutboundRequest, Transport};
use crate::utils::time::{elapsed_ms, now_instant};

pub const SIGNATURE_HEADER: &str = "signature";

/// Rate-limited submission of documents to the registry.
///
/// Every admitted submission spends one permit of the current window. The
/// permit gates admission only: it is spent before the request goes out, so
/// the number of requests in flight is not bounded.
pub struct SubmissionGate<E: Encoder = JsonEncoder> {
    pool: Arc<PermitPool>,
    transport: Arc<dyn Transport>,
    encoder: E,
    api_url: String,
    observers: Vec<Arc<dyn OutcomeObserver>>,
    stats: Arc<Stats>,
}

impl SubmissionGate<JsonEncoder> {
    /// Gate over the real registry transport described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let client = create_http_client(config)?;
        Self::new(
            config.window(),
            config.request_limit,
            config.api_url.clone(),
            Arc::new(HttpTransport::new(client)),
        )
    }

    pub fn new(
        window: Duration,
        request_limit: u32,
        api_url: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::with_encoder(window, request_limit, api_url, transport, JsonEncoder)
    }
}

impl<E: Encoder> SubmissionGate<E> {
    pub fn with_encoder(
        window: Duration,
        request_limit: u32,
        api_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        encoder: E,
    ) -> Result<Self> {
        let pool = PermitPool::start(request_limit as usize, window)?;
        let stats = Arc::new(Stats::new());
        let observers: Vec<Arc<dyn OutcomeObserver>> = vec![Arc::new(LoggingObserver), stats.clone()];

        Ok(Self {
            pool,
            transport,
            encoder,
            api_url: api_url.into(),
            observers,
            stats,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn OutcomeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn pool(&self) -> &Arc<PermitPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit one document, waiting only for admission.
    ///
    /// Encoding errors return before any permit is touched. Transport
    /// failures never surface here; they arrive through the returned handle
    /// and the observers. Dropping this future while it waits for a permit
    /// leaves the pool untouched.
    pub async fn submit<T>(&self, document: &T, signature: &str) -> Result<OutcomeHandle>
    where
        T: Serialize + ?Sized,
    {
        let body = match self.encoder.encode(document) {
            Ok(body) => body,
            Err(e) => {
                self.stats.inc_rejected();
                warn!("Exception during document encoding: {}", e);
                return Err(e);
            }
        };

        let wait_start = now_instant();
        self.pool.acquire().await?;
        let waited_ms = elapsed_ms(wait_start);

        let request = match self.build_request(body, signature) {
            Ok(request) => request,
            Err(e) => {
                // Nothing was admitted, so the permit goes back.
                self.pool.release();
                self.stats.inc_rejected();
                return Err(e);
            }
        };

        let id = Uuid::new_v4();
        self.stats.inc_admitted();
        self.stats.update_wait(waited_ms);
        debug!(%id, waited_ms, available = self.pool.available(), "Submission admitted");

        let (tx, rx) = oneshot::channel();
        let transport = self.transport.clone();
        let observers = self.observers.clone();

        tokio::spawn(async move {
            let started = now_instant();
            let outcome = match transport.send(request).await {
                Ok(response) => Outcome::Success {
                    status: response.status,
                    body: response.body,
                },
                Err(error) => Outcome::Failure { error },
            };

            let report = DispatchReport {
                id,
                outcome,
                latency_ms: elapsed_ms(started),
                completed_at: Utc::now(),
            };
            for observer in &observers {
                observer.on_outcome(&report);
            }

            // The caller may have dropped the handle; observers already saw it.
            let _ = tx.send(report);
        });

        Ok(OutcomeHandle::new(id, rx))
    }

    /// `submit` followed by waiting for the dispatch to complete.
    pub async fn submit_and_wait<T>(&self, document: &T, signature: &str) -> Result<DispatchReport>
    where
        T: Serialize + ?Sized,
    {
        self.submit(document, signature).await?.wait().await
    }

    /// Stop the window ticker; queued submissions fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn build_request(&self, body: Vec<u8>, signature: &str) -> Result<OutboundRequest> {
        let signature = HeaderValue::from_str(signature)
            .map_err(|e| AppError::InvalidCredential(format!("signature is not a valid header value: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(self.encoder.content_type()));
        headers.insert(SIGNATURE_HEADER, signature);

        Ok(OutboundRequest {
            url: self.api_url.clone(),
            headers,
            body,
        })
    }
}
