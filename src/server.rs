//! Axum router construction and route handlers.
//!
//! The [`app`] function wires the object proxy routes (`/s3`, `/s3/*key`),
//! the bulk API (`/api/*`), and the operational endpoints onto one
//! [`axum::Router`].  Object and listing requests are forwarded verbatim;
//! the `/api` routes run the aggregation and bulk engines and answer JSON.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;

use crate::bulk::{self, DeletePrefixRequest, DeletePrefixResponse, RenameRequest, RenameResponse};
use crate::errors::{generate_request_id, GatewayError};
use crate::forward::forward;
use crate::keys::{bucket_path, translate_request_path};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::stats;
use crate::AppState;

/// Methods announced in preflight answers.
pub const ALLOWED_METHODS: &str = "GET, HEAD, PUT, DELETE, POST, OPTIONS";

/// Request headers announced in preflight answers.
pub const ALLOWED_HEADERS: &str =
    "Content-Type, Content-Length, Range, If-None-Match, If-Modified-Since, Accept, User-Agent";

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the gateway.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "s3browse gateway API",
        version = "0.1.0",
        description = "Single-bucket S3 gateway with bulk prefix operations"
    ),
    paths(
        handle_list,
        handle_object,
        handle_stats,
        handle_rename,
        handle_delete_prefix,
    ),
    tags(
        (name = "Proxy", description = "Object and listing requests forwarded to the bucket"),
        (name = "Bulk", description = "Prefix statistics, rename and delete"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with every gateway route.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/s3", any(handle_list))
        .route("/s3/", any(handle_object))
        .route("/s3/*key", any(handle_object))
        .route("/api/stats", get(handle_stats).fallback(method_not_allowed))
        .route("/api/rename", post(handle_rename).fallback(method_not_allowed))
        .route(
            "/api/delete-prefix",
            post(handle_delete_prefix).fallback(method_not_allowed),
        )
        .route("/openapi.json", get(openapi_json));
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .with_state(state)
        // Inner layers run first; the metrics layer is outermost.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        // Uploads stream through unbounded.
        .layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Answers CORS preflight for any path and stamps every other response
/// with the permissive CORS headers and an `x-request-id`.
async fn common_headers_middleware(req: Request<Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        insert_cors(headers);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOWED_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        );
        return response;
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    insert_cors(headers);
    if !headers.contains_key("x-request-id") {
        if let Ok(id) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", id);
        }
    }
    response
}

fn insert_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    let varies_on_origin = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(|v| v == "*" || v.eq_ignore_ascii_case("origin"));
    if !varies_on_origin {
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
    }
}

async fn method_not_allowed() -> GatewayError {
    GatewayError::MethodNotAllowed
}

async fn openapi_json() -> Response {
    match ApiDoc::openapi().to_pretty_json() {
        Ok(doc) => (StatusCode::OK, [("content-type", "application/json")], doc).into_response(),
        Err(e) => GatewayError::Internal(e.into()).into_response(),
    }
}

// -- Proxy handlers -----------------------------------------------------------

/// `GET|HEAD /s3` -- Forward a bucket listing, query string verbatim.
#[utoipa::path(
    get,
    path = "/s3",
    tag = "Proxy",
    operation_id = "ListBucket",
    responses(
        (status = 200, description = "Upstream listing XML, relayed as-is"),
        (status = 405, description = "Method other than GET or HEAD"),
        (status = 502, description = "Upstream unreachable")
    )
)]
async fn handle_list(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    if method != Method::GET && method != Method::HEAD {
        return Err(GatewayError::MethodNotAllowed);
    }
    let path = bucket_path(state.bucket());
    forward(&state, method, &path, uri.query(), None, None, None, &headers).await
}

/// `GET|HEAD|PUT|DELETE /s3/{key}` -- Forward an object request.
#[utoipa::path(
    get,
    path = "/s3/{key}",
    tag = "Proxy",
    operation_id = "ObjectProxy",
    params(
        ("key" = String, Path, description = "Object key; slashes separate segments"),
    ),
    responses(
        (status = 200, description = "Upstream answer, relayed as-is"),
        (status = 400, description = "Malformed percent-encoding in the key"),
        (status = 405, description = "Unsupported method"),
        (status = 502, description = "Upstream unreachable")
    )
)]
async fn handle_object(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, GatewayError> {
    if !matches!(
        method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE
    ) {
        return Err(GatewayError::MethodNotAllowed);
    }
    let path = translate_request_path(state.bucket(), uri.path())?;
    match method {
        Method::PUT => {
            let content_length = headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            forward(
                &state,
                method,
                &path,
                uri.query(),
                Some(body),
                content_length,
                content_type.as_deref(),
                &headers,
            )
            .await
        }
        _ => forward(&state, method, &path, uri.query(), None, None, None, &headers).await,
    }
}

// -- Bulk API handlers --------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StatsParams {
    #[serde(default)]
    prefix: String,
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body).map_err(|e| GatewayError::BadRequest(format!("invalid JSON: {e}")))
}

fn took_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// `GET /api/stats?prefix=<p>` -- Usage statistics under a prefix.
#[utoipa::path(
    get,
    path = "/api/stats",
    tag = "Bulk",
    operation_id = "PrefixStats",
    params(
        ("prefix" = Option<String>, Query, description = "Key prefix; empty means the whole bucket"),
    ),
    responses(
        (status = 200, description = "Aggregation report as JSON"),
        (status = 502, description = "A listing page failed")
    )
)]
async fn handle_stats(
    State(state): State<Arc<AppState>>,
    params: Result<Query<StatsParams>, axum::extract::rejection::QueryRejection>,
) -> Result<Response, GatewayError> {
    let Query(params) = params.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    let report = stats::aggregate(&state, &params.prefix).await?;
    Ok(Json(report).into_response())
}

/// `POST /api/rename` -- Rename one key or every key under a prefix.
#[utoipa::path(
    post,
    path = "/api/rename",
    tag = "Bulk",
    operation_id = "Rename",
    request_body(content = String, description = r#"{"src": "...", "dst": "...", "isPrefix": bool}"#, content_type = "application/json"),
    responses(
        (status = 200, description = r#"{"moved": n, "tookMs": ms}"#),
        (status = 400, description = "Malformed body or missing src/dst"),
        (status = 502, description = "A copy or delete failed; earlier keys stay moved")
    )
)]
async fn handle_rename(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let started = Instant::now();
    let req: RenameRequest = parse_json(&body)?;
    let moved = bulk::rename(&state, &req).await?.into_result().map_err(|e| {
        warn!("rename '{}' -> '{}' stopped: {}", req.src, req.dst, e);
        e
    })?;
    Ok(Json(RenameResponse {
        moved,
        took_ms: took_ms(started),
    })
    .into_response())
}

/// `POST /api/delete-prefix` -- Delete every key under a prefix.
#[utoipa::path(
    post,
    path = "/api/delete-prefix",
    tag = "Bulk",
    operation_id = "DeletePrefix",
    request_body(content = String, description = r#"{"prefix": "..."}"#, content_type = "application/json"),
    responses(
        (status = 200, description = r#"{"deleted": n, "tookMs": ms}"#),
        (status = 400, description = "Malformed body"),
        (status = 502, description = "A delete failed; earlier keys stay deleted")
    )
)]
async fn handle_delete_prefix(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let started = Instant::now();
    let req: DeletePrefixRequest = parse_json(&body)?;
    let deleted = bulk::delete_prefix(&state, &req.prefix)
        .await?
        .into_result()
        .map_err(|e| {
            warn!("delete-prefix '{}' stopped: {}", req.prefix, e);
            e
        })?;
    Ok(Json(DeletePrefixResponse {
        deleted,
        took_ms: took_ms(started),
    })
    .into_response())
}
