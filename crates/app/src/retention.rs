//! Per-listener retention cap, applied after every capture.
//!
//! Enforcement runs on a dedicated worker task fed through a bounded queue.
//! Ingestion only ever calls [`RetentionHandle::submit`], which never waits;
//! outcomes, including failures, are published on a broadcast channel.

use metrics::counter;
use thiserror::Error;
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use hooksink_storage::{Database, RequestError};

const QUEUE_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 256;

/// Trims a listener's stored requests down to `cap`, oldest first.
#[derive(Clone)]
pub struct RetentionEnforcer {
    database: Database,
    cap: u64,
}

impl RetentionEnforcer {
    pub fn new(database: Database, cap: u64) -> Self {
        Self { database, cap }
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Returns the number of requests evicted.
    ///
    /// Two overlapping runs may both delete the same excess; the cap is never
    /// undershot by more than that, and an overshoot left behind by a failed
    /// run is corrected by the next capture for the listener.
    pub async fn enforce(&self, listener_id: &str) -> Result<u64, RetentionError> {
        let repo = self.database.requests();
        let count = repo.count_for_listener(listener_id).await?;
        if count <= self.cap {
            return Ok(0);
        }

        let excess = count - self.cap;
        let ids = repo.oldest_ids(listener_id, excess).await?;
        let evicted = repo.delete_ids(&ids).await?;
        Ok(evicted)
    }
}

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("retention storage failure: {0}")]
    Storage(#[from] RequestError),
}

/// Outcome of one enforcement run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionEvent {
    Trimmed { listener_id: String, evicted: u64 },
    Failed { listener_id: String, error: String },
}

impl RetentionEvent {
    #[cfg(test)]
    pub fn listener_id(&self) -> &str {
        match self {
            Self::Trimmed { listener_id, .. } | Self::Failed { listener_id, .. } => listener_id,
        }
    }
}

/// Submission side of the retention queue.
#[derive(Clone)]
pub struct RetentionHandle {
    jobs: mpsc::Sender<String>,
    events: broadcast::Sender<RetentionEvent>,
}

impl RetentionHandle {
    /// Queues an enforcement run for `listener_id` without waiting.
    ///
    /// Jobs that do not fit are dropped; the next capture queues a new one.
    pub fn submit(&self, listener_id: &str) {
        match self.jobs.try_send(listener_id.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(listener_id)) => {
                counter!("retention_dropped_total", "reason" => "full").increment(1);
                warn!(stage = "retention", %listener_id, "retention queue full, job dropped");
            }
            Err(TrySendError::Closed(listener_id)) => {
                counter!("retention_dropped_total", "reason" => "closed").increment(1);
                warn!(stage = "retention", %listener_id, "retention worker stopped, job dropped");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RetentionEvent> {
        self.events.subscribe()
    }
}

/// Background consumer of the retention queue.
pub struct RetentionWorker {
    enforcer: RetentionEnforcer,
    jobs: mpsc::Receiver<String>,
    events: broadcast::Sender<RetentionEvent>,
}

impl RetentionWorker {
    pub fn new(enforcer: RetentionEnforcer) -> (Self, RetentionHandle) {
        Self::with_capacity(enforcer, QUEUE_CAPACITY)
    }

    pub fn with_capacity(enforcer: RetentionEnforcer, capacity: usize) -> (Self, RetentionHandle) {
        let (jobs_tx, jobs_rx) = mpsc::channel(capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = RetentionHandle {
            jobs: jobs_tx,
            events: events.clone(),
        };
        let worker = Self {
            enforcer,
            jobs: jobs_rx,
            events,
        };
        (worker, handle)
    }

    /// Runs the worker until every [`RetentionHandle`] is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(mut self) {
        while let Some(listener_id) = self.jobs.recv().await {
            let event = self.run_once(listener_id).await;
            // No subscribers is the normal case outside tests.
            let _ = self.events.send(event);
        }
        debug!(stage = "retention", "retention worker stopped");
    }

    async fn run_once(&self, listener_id: String) -> RetentionEvent {
        match self.enforcer.enforce(&listener_id).await {
            Ok(evicted) => {
                if evicted > 0 {
                    counter!("retention_evicted_total").increment(evicted);
                    info!(
                        stage = "retention",
                        %listener_id,
                        evicted,
                        cap = self.enforcer.cap(),
                        "trimmed listener to retention cap"
                    );
                }
                RetentionEvent::Trimmed {
                    listener_id,
                    evicted,
                }
            }
            Err(err) => {
                counter!("retention_failures_total").increment(1);
                error!(stage = "retention", %listener_id, error = %err, "retention run failed");
                RetentionEvent::Failed {
                    listener_id,
                    error: err.to_string(),
                }
            }
        }
    }
}
