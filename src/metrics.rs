//! Prometheus metrics for the gateway.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides the HTTP RED middleware, and
//! exposes the `/metrics` endpoint handler.  Recording helpers are no-ops
//! until a recorder is installed.

use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "s3browse_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "s3browse_http_request_duration_seconds";

/// Outbound calls to the object store (counter). Labels: method, status.
pub const UPSTREAM_REQUESTS_TOTAL: &str = "s3browse_upstream_requests_total";

/// Keys moved or deleted by bulk operations (counter). Labels: operation.
pub const BULK_OBJECTS_TOTAL: &str = "s3browse_bulk_objects_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    describe_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(UPSTREAM_REQUESTS_TOTAL, "Outbound object store requests");
    describe_counter!(BULK_OBJECTS_TOTAL, "Objects processed by bulk operations");
}

/// Count one outbound call. `status` is `None` when the call never got an answer.
pub fn record_upstream(method: &Method, status: Option<u16>) {
    let status = status.map_or_else(|| "error".to_string(), |s| s.to_string());
    counter!(UPSTREAM_REQUESTS_TOTAL, "method" => method.to_string(), "status" => status)
        .increment(1);
}

/// Count one key moved or deleted by a bulk operation.
pub fn record_bulk(operation: &'static str) {
    counter!(BULK_OBJECTS_TOTAL, "operation" => operation).increment(1);
}

// -- Metrics middleware -------------------------------------------------------

/// Records HTTP RED metrics for every request except `/metrics` itself.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

/// Map a request path onto its route template so object keys never become
/// label values.
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/s3" | "/s3/" => "/s3",
        "/api/stats" => "/api/stats",
        "/api/rename" => "/api/rename",
        "/api/delete-prefix" => "/api/delete-prefix",
        "/metrics" => "/metrics",
        "/openapi.json" => "/openapi.json",
        p if p.starts_with("/s3/") => "/s3/{key}",
        _ => "other",
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed\n").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_object_routes() {
        assert_eq!(normalize_path("/s3"), "/s3");
        assert_eq!(normalize_path("/s3/"), "/s3");
        assert_eq!(normalize_path("/s3/photos/2024/cat.jpg"), "/s3/{key}");
    }

    #[test]
    fn test_normalize_api_routes() {
        assert_eq!(normalize_path("/api/stats"), "/api/stats");
        assert_eq!(normalize_path("/api/rename"), "/api/rename");
        assert_eq!(normalize_path("/api/delete-prefix"), "/api/delete-prefix");
        assert_eq!(normalize_path("/openapi.json"), "/openapi.json");
    }

    #[test]
    fn test_normalize_unknown_collapses() {
        assert_eq!(normalize_path("/"), "other");
        assert_eq!(normalize_path("/s3x"), "other");
        assert_eq!(normalize_path("/api/unknown"), "other");
    }

    #[test]
    fn test_recording_without_recorder_is_harmless() {
        record_upstream(&Method::GET, Some(200));
        record_upstream(&Method::PUT, None);
        record_bulk("rename");
    }

    #[test]
    fn test_init_metrics_idempotent() {
        let first = init_metrics().unwrap() as *const PrometheusHandle;
        let second = init_metrics().unwrap() as *const PrometheusHandle;
        assert_eq!(first, second);
        record_bulk("delete-prefix");
        let rendered = PROMETHEUS_HANDLE.get().unwrap().render();
        assert!(rendered.contains(BULK_OBJECTS_TOTAL));
    }
}
