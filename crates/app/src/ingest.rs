//! Capture path for inbound webhook calls.
//!
//! The order is fixed: rate limit, listener lookup, normalization, insert,
//! then a retention job handed to the worker. Only the first four can fail
//! the caller.

use std::{net::IpAddr, sync::Arc};

use chrono::{DateTime, SubsecRound, Utc};
use hooksink_core::{
    normalizer::{RawExchange, RequestNormalizer},
    rate_limit::RateLimiter,
    Clock,
};
use hooksink_storage::{Database, ListenerError, RequestError};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::retention::RetentionHandle;

const UNKNOWN_IDENTITY: &str = "unknown";

/// Receipt for a captured request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub request_id: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("webhook listener not found")]
    ListenerNotFound,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("failed to look up listener: {0}")]
    Lookup(#[from] ListenerError),
    #[error("failed to persist request: {0}")]
    Persist(#[from] RequestError),
}

impl IngestError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::ListenerNotFound => "listener_not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::Lookup(_) | Self::Persist(_) => "storage",
        }
    }
}

#[derive(Clone)]
pub struct IngestionPipeline {
    database: Database,
    normalizer: Arc<RequestNormalizer>,
    limiter: RateLimiter,
    retention: RetentionHandle,
    clock: Clock,
}

impl IngestionPipeline {
    pub fn new(
        database: Database,
        normalizer: RequestNormalizer,
        limiter: RateLimiter,
        retention: RetentionHandle,
        clock: Clock,
    ) -> Self {
        Self {
            database,
            normalizer: Arc::new(normalizer),
            limiter,
            retention,
            clock,
        }
    }

    #[cfg(test)]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    #[cfg(test)]
    pub fn retention(&self) -> &RetentionHandle {
        &self.retention
    }

    /// Rate limit key for a caller: the resolved client IP, else the peer address.
    pub fn identity(&self, headers: &[(String, String)], peer: Option<IpAddr>) -> String {
        let ip = self
            .normalizer
            .ip_policy()
            .resolve(headers)
            .or_else(|| peer.map(|addr| addr.to_string()))
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string());
        format!("webhook:{ip}")
    }

    /// Counts one call against the caller's window.
    pub fn admit(
        &self,
        headers: &[(String, String)],
        peer: Option<IpAddr>,
    ) -> Result<(), IngestError> {
        let identity = self.identity(headers, peer);
        let admission = self.limiter.admit_with_sweep(&identity);
        if admission.swept > 0 {
            counter!("rate_limit_swept_total").increment(admission.swept as u64);
            debug!(stage = "rate_limit", swept = admission.swept, "expired rate limit entries removed");
        }
        if admission.allowed {
            return Ok(());
        }

        counter!("rate_limit_denied_total").increment(1);
        let status = self.limiter.status(&identity);
        let now = (self.clock)();
        // Round up so callers never retry a moment too early.
        let millis = (status.reset_at - now).num_milliseconds().max(0) as u64;
        let retry_after_secs = millis.div_ceil(1000).max(1);
        warn!(stage = "rate_limit", %identity, retry_after_secs, "webhook call rate limited");
        Err(IngestError::RateLimited { retry_after_secs })
    }

    /// Captures `exchange` for `listener_id` and schedules retention.
    pub async fn ingest(
        &self,
        listener_id: &str,
        exchange: &RawExchange<'_>,
    ) -> Result<Ingested, IngestError> {
        if self.database.listeners().find(listener_id).await?.is_none() {
            return Err(IngestError::ListenerNotFound);
        }

        let (draft, body_error) = self.normalizer.normalize_with_diagnostics(exchange);
        if let Some(err) = body_error {
            debug!(stage = "ingress", %listener_id, error = %err, "request body dropped");
        }

        let received_at = (self.clock)().trunc_subsecs(3);
        let record = draft.into_record(
            Uuid::new_v4().to_string(),
            listener_id.to_string(),
            received_at,
        );

        match self.database.requests().insert(&record).await {
            Ok(()) => {}
            // Listener removed between lookup and insert.
            Err(RequestError::MissingListener) => return Err(IngestError::ListenerNotFound),
            Err(err) => return Err(err.into()),
        }

        self.retention.submit(listener_id);

        Ok(Ingested {
            request_id: record.id,
            received_at,
        })
    }
}
