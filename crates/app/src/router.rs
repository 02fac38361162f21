use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{any, delete, get},
    Router,
};
use chrono::{Duration, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;

use hooksink_core::{
    normalizer::{ClientIpPolicy, RequestNormalizer},
    rate_limit::{RateLimitConfig, RateLimiter, ShardedCounterStore},
    Clock,
};
use hooksink_storage::Database;
use hooksink_util::{AppConfig, IngestLimits};

use crate::ingest::IngestionPipeline;
use crate::registry::ListenerRegistry;
use crate::retention::{RetentionEnforcer, RetentionWorker};
use crate::{api, rate_limit, telemetry, webhook};

/// Knobs taken from [`AppConfig`] when assembling [`AppState`].
#[derive(Debug, Clone)]
pub struct StateSettings {
    pub limits: IngestLimits,
    pub client_ip_headers: Vec<String>,
    pub public_url: String,
}

impl StateSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            limits: config.limits.clone(),
            client_ip_headers: config.client_ip_headers.clone(),
            public_url: config.public_url.clone(),
        }
    }
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            limits: IngestLimits::default(),
            client_ip_headers: ClientIpPolicy::default().headers().to_vec(),
            public_url: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    pipeline: IngestionPipeline,
    registry: ListenerRegistry,
    public_url: Arc<str>,
    max_body_bytes: usize,
}

impl AppState {
    /// Builds the state and spawns the retention worker it feeds.
    ///
    /// The worker exits once every clone of the state is dropped.
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        settings: StateSettings,
    ) -> (Self, JoinHandle<()>) {
        Self::with_clock(metrics, storage, settings, Arc::new(Utc::now))
    }

    pub fn with_clock(
        metrics: PrometheusHandle,
        storage: Database,
        settings: StateSettings,
        clock: Clock,
    ) -> (Self, JoinHandle<()>) {
        let limits = &settings.limits;

        let enforcer = RetentionEnforcer::new(storage.clone(), limits.max_requests_per_listener);
        let (worker, retention) = RetentionWorker::new(enforcer);
        let worker = worker.spawn();

        let limiter = RateLimiter::new(
            Arc::new(ShardedCounterStore::default()),
            RateLimitConfig {
                window: Duration::milliseconds(
                    i64::try_from(limits.rate_limit_window_ms).unwrap_or(i64::MAX),
                ),
                max_requests: limits.rate_limit_max_requests,
                sweep_threshold: limits.rate_limit_sweep_threshold,
            },
            clock.clone(),
        );
        let normalizer = RequestNormalizer::new(ClientIpPolicy::new(settings.client_ip_headers));
        let pipeline = IngestionPipeline::new(
            storage.clone(),
            normalizer,
            limiter,
            retention,
            clock.clone(),
        );
        let registry = ListenerRegistry::new(storage.clone(), clock);

        let state = Self {
            metrics,
            storage,
            pipeline,
            registry,
            public_url: Arc::from(settings.public_url.trim_end_matches('/')),
            max_body_bytes: limits.max_body_bytes,
        };
        (state, worker)
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub fn retention(&self) -> &crate::retention::RetentionHandle {
        self.pipeline.retention()
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn webhook_url(&self, listener_id: &str) -> String {
        format!("{}/api/webhook/{listener_id}", self.public_url)
    }
}

pub fn app_router(state: AppState) -> Router {
    let webhooks = Router::new()
        .route("/api/webhook/:listener_id", any(webhook::handle))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::limit_webhooks,
        ))
        .layer(middleware::map_response(webhook::apply_cors));

    let management = Router::new()
        .route(
            "/api/listeners",
            get(api::list_listeners).post(api::create_listener),
        )
        .route(
            "/api/listeners/:id",
            get(api::get_listener).delete(api::delete_listener),
        )
        .route(
            "/api/listeners/:id/requests",
            get(api::list_requests).delete(api::delete_oldest_requests),
        )
        .route(
            "/api/listeners/:id/requests/:request_id",
            delete(api::delete_request),
        );

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .merge(webhooks)
        .merge(management)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::DateTime;
    use std::sync::Mutex;

    pub(crate) const FIXED_NOW: &str = "2024-01-01T00:00:00Z";

    pub(crate) struct TestContext {
        pub state: AppState,
        pub database: Database,
        pub now: Arc<Mutex<DateTime<Utc>>>,
    }

    impl TestContext {
        pub fn app(&self) -> Router {
            app_router(self.state.clone())
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().expect("clock poisoned");
            *now += by;
        }
    }

    pub(crate) async fn setup_context(settings: StateSettings) -> TestContext {
        let metrics = telemetry::init_metrics().expect("metrics init");
        // One connection keeps every query on the same in-memory database.
        let database = Database::connect_with("sqlite::memory:", 1)
            .await
            .expect("connect");
        database.run_migrations().await.expect("migrations");

        let now = Arc::new(Mutex::new(
            DateTime::parse_from_rfc3339(FIXED_NOW)
                .expect("fixed time")
                .with_timezone(&Utc),
        ));
        let clock: Clock = {
            let now = now.clone();
            Arc::new(move || *now.lock().expect("clock poisoned"))
        };

        let (state, _worker) =
            AppState::with_clock(metrics, database.clone(), settings, clock);
        TestContext {
            state,
            database,
            now,
        }
    }
}
