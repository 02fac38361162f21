use std::time::Instant;

use axum::{
    body::to_bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{error, info, warn};

use hooksink_core::normalizer::{RawExchange, RequestNormalizer};

use crate::ingest::IngestError;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookAck {
    success: bool,
    message: &'static str,
    request_id: String,
}

/// Accepts any method on `/api/webhook/:listener_id`.
pub async fn handle(
    State(state): State<AppState>,
    Path(listener_id): Path<String>,
    request: Request,
) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }

    let start = Instant::now();
    let (parts, body) = request.into_parts();
    let method = parts.method.as_str();
    let method_label = method_label(&parts.method);
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let headers = header_pairs(&parts.headers);

    // GET and DELETE bodies are never read.
    let bytes = if RequestNormalizer::carries_body(method) {
        match to_bytes(body, state.max_body_bytes()).await {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(stage = "ingress", %listener_id, error = %err, "webhook body could not be read");
                None
            }
        }
    } else {
        None
    };

    let exchange = RawExchange {
        method,
        path_and_query,
        headers,
        body: bytes.as_deref(),
    };

    let outcome = state.pipeline().ingest(&listener_id, &exchange).await;
    histogram!("webhook_ack_latency_seconds", "method" => method_label)
        .record(start.elapsed().as_secs_f64());

    match outcome {
        Ok(ingested) => {
            counter!("webhook_ingress_total", "method" => method_label).increment(1);
            info!(
                stage = "ingress",
                %listener_id,
                request_id = %ingested.request_id,
                received_at = %ingested.received_at,
                method,
                "webhook captured"
            );
            Json(WebhookAck {
                success: true,
                message: "Webhook received",
                request_id: ingested.request_id,
            })
            .into_response()
        }
        Err(err) => ingest_error_response(&listener_id, err),
    }
}

/// Maps a pipeline failure onto the HTTP response the caller sees.
pub(crate) fn ingest_error_response(listener_id: &str, err: IngestError) -> Response {
    counter!("webhook_rejected_total", "reason" => err.metric_label()).increment(1);
    match err {
        IngestError::ListenerNotFound => ProblemResponse::listener_not_found().into_response(),
        IngestError::RateLimited { retry_after_secs } => {
            let mut response = ProblemResponse::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "too many requests",
            )
            .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
            response
        }
        IngestError::Lookup(_) | IngestError::Persist(_) => {
            error!(stage = "ingress", %listener_id, error = %err, "failed to process webhook");
            ProblemResponse::internal("failed to process webhook").into_response()
        }
    }
}

/// Adds the permissive cross-origin headers to every webhook response.
pub async fn apply_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    response
}

/// Flattens a header map in wire order. Non-UTF-8 values are decoded lossily.
pub(crate) fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn method_label(method: &Method) -> &'static str {
    match *method {
        Method::GET => "GET",
        Method::POST => "POST",
        Method::PUT => "PUT",
        Method::PATCH => "PATCH",
        Method::DELETE => "DELETE",
        Method::HEAD => "HEAD",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest};
    use chrono::Duration;
    use http_body_util::BodyExt;
    use hooksink_core::types::Listener;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::retention::RetentionEvent;
    use crate::router::{
        test_support::{setup_context, TestContext},
        StateSettings,
    };
    use hooksink_util::IngestLimits;

    const LISTENER_ID: &str = "listener-1";

    async fn context_with(settings: StateSettings) -> TestContext {
        let ctx = setup_context(settings).await;
        ctx.database
            .listeners()
            .create(&Listener {
                id: LISTENER_ID.to_string(),
                name: Some("demo".to_string()),
                api_key: "wh_0123456789abcdef0123456789abcdef".to_string(),
                created_at: *ctx.now.lock().expect("clock poisoned"),
            })
            .await
            .expect("create listener");
        ctx
    }

    async fn context() -> TestContext {
        context_with(StateSettings::default()).await
    }

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("x-real-ip", "203.0.113.5")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body should read")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn assert_cors(response: &Response) {
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(
            headers["access-control-allow-methods"],
            "GET, POST, PUT, PATCH, DELETE, OPTIONS"
        );
        assert_eq!(headers["access-control-allow-headers"], "*");
    }

    #[tokio::test]
    async fn post_json_is_captured_canonically() {
        let ctx = context().await;

        let response = ctx
            .app()
            .oneshot(
                request("POST", "/api/webhook/listener-1?a=1&b=2")
                    .header("content-type", "application/json")
                    .header("user-agent", "stripe/1.0")
                    .body(Body::from(r#"{"z":true,"a":1}"#))
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors(&response);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "Webhook received");
        let request_id = body["requestId"].as_str().expect("request id").to_string();

        let stored = ctx
            .database
            .requests()
            .find(LISTENER_ID, &request_id)
            .await
            .expect("find")
            .expect("stored");
        assert_eq!(stored.method, "POST");
        assert_eq!(stored.path, "/api/webhook/listener-1?a=1&b=2");
        assert_eq!(stored.body.as_deref(), Some(r#"{"a":1,"z":true}"#));
        let params = stored.query_params.expect("query params");
        assert_eq!(params.get("a").map(String::as_str), Some("1"));
        assert_eq!(params.get("b").map(String::as_str), Some("2"));
        assert_eq!(stored.ip_address.as_deref(), Some("203.0.113.5"));
        assert_eq!(stored.user_agent.as_deref(), Some("stripe/1.0"));
        assert_eq!(
            stored.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn get_ignores_body_and_omits_empty_query() {
        let ctx = context().await;

        let response = ctx
            .app()
            .oneshot(
                request("GET", "/api/webhook/listener-1")
                    .header("content-type", "text/plain")
                    .body(Body::from("ignored"))
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let request_id = body["requestId"].as_str().expect("request id");
        let stored = ctx
            .database
            .requests()
            .find(LISTENER_ID, request_id)
            .await
            .expect("find")
            .expect("stored");
        assert_eq!(stored.body, None);
        assert_eq!(stored.query_params, None);
    }

    #[tokio::test]
    async fn unusual_verbs_and_malformed_bodies_are_captured() {
        let ctx = context().await;

        let response = ctx
            .app()
            .oneshot(
                request("PURGE", "/api/webhook/listener-1")
                    .header("content-type", "application/json")
                    .body(Body::from("{broken"))
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let stored = ctx
            .database
            .requests()
            .find(LISTENER_ID, body["requestId"].as_str().expect("request id"))
            .await
            .expect("find")
            .expect("stored");
        assert_eq!(stored.method, "PURGE");
        assert_eq!(stored.body, None);
    }

    #[tokio::test]
    async fn oversized_body_is_dropped_but_request_kept() {
        let ctx = context_with(StateSettings {
            limits: IngestLimits {
                max_body_bytes: 8,
                ..IngestLimits::default()
            },
            ..StateSettings::default()
        })
        .await;

        let response = ctx
            .app()
            .oneshot(
                request("PUT", "/api/webhook/listener-1")
                    .body(Body::from("this body is far too long"))
                    .unwrap(),
            )
            .await
            .expect("handler should respond");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let stored = ctx
            .database
            .requests()
            .find(LISTENER_ID, body["requestId"].as_str().expect("request id"))
            .await
            .expect("find")
            .expect("stored");
        assert_eq!(stored.body, None);
    }

    #[tokio::test]
    async fn unknown_listener_returns_404_with_cors() {
        let ctx = context().await;

        for method in ["GET", "POST", "DELETE"] {
            let response = ctx
                .app()
                .oneshot(
                    request(method, "/api/webhook/missing")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .expect("handler should respond");

            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_cors(&response);
            assert_eq!(
                response.headers()[header::CONTENT_TYPE],
                "application/problem+json"
            );
        }
    }

    #[tokio::test]
    async fn options_short_circuits_without_lookup() {
        let ctx = context_with(StateSettings {
            limits: IngestLimits {
                rate_limit_max_requests: 1,
                ..IngestLimits::default()
            },
            ..StateSettings::default()
        })
        .await;

        for _ in 0..3 {
            let response = ctx
                .app()
                .oneshot(
                    request("OPTIONS", "/api/webhook/does-not-exist")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .expect("handler should respond");

            assert_eq!(response.status(), StatusCode::NO_CONTENT);
            assert_cors(&response);
        }
        assert_eq!(ctx.state.pipeline().limiter().tracked_identities(), 0);
    }

    #[tokio::test]
    async fn rate_limited_callers_get_429_with_retry_after() {
        let ctx = context_with(StateSettings {
            limits: IngestLimits {
                rate_limit_max_requests: 2,
                ..IngestLimits::default()
            },
            ..StateSettings::default()
        })
        .await;

        for _ in 0..2 {
            let response = ctx
                .app()
                .oneshot(request("POST", "/api/webhook/listener-1").body(Body::empty()).unwrap())
                .await
                .expect("handler should respond");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = ctx
            .app()
            .oneshot(request("POST", "/api/webhook/listener-1").body(Body::empty()).unwrap())
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_cors(&response);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");

        // A different client address has its own window.
        let response = ctx
            .app()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/webhook/listener-1")
                    .header("x-forwarded-for", "198.51.100.1, 10.0.0.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::OK);

        ctx.advance(Duration::milliseconds(60_001));
        let response = ctx
            .app()
            .oneshot(request("POST", "/api/webhook/listener-1").body(Body::empty()).unwrap())
            .await
            .expect("handler should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn captures_trigger_retention_cap() {
        let ctx = context_with(StateSettings {
            limits: IngestLimits {
                max_requests_per_listener: 3,
                ..IngestLimits::default()
            },
            ..StateSettings::default()
        })
        .await;
        let mut events = ctx.state.retention().subscribe();

        for idx in 0..5 {
            ctx.advance(Duration::milliseconds(1));
            let response = ctx
                .app()
                .oneshot(
                    request("POST", &format!("/api/webhook/listener-1?n={idx}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .expect("handler should respond");
            assert_eq!(response.status(), StatusCode::OK);
        }

        let mut seen = 0;
        while seen < 5 {
            let event = tokio::time::timeout(std::time::Duration::from_secs(1), events.recv())
                .await
                .expect("event in time")
                .expect("event");
            assert!(matches!(event, RetentionEvent::Trimmed { .. }));
            seen += 1;
        }

        let requests = ctx.database.requests();
        assert_eq!(requests.count_for_listener(LISTENER_ID).await.expect("count"), 3);
        let page = requests
            .list_for_listener(LISTENER_ID, 10, 0)
            .await
            .expect("list");
        let paths: Vec<&str> = page.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/api/webhook/listener-1?n=4",
                "/api/webhook/listener-1?n=3",
                "/api/webhook/listener-1?n=2",
            ]
        );
    }
}
