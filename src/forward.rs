//! Request forwarding to the upstream object store.
//!
//! An inbound request is rebuilt against the configured endpoint, given a
//! whitelisted subset of its headers, signed, and sent.  The upstream
//! response is streamed back with hop-by-hop headers stripped and CORS
//! headers added.  Bodies are never buffered in either direction.

use axum::body::Body;
use axum::response::Response;
use chrono::Utc;
use http::header::{
    ACCEPT, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, CONTENT_LENGTH,
    CONTENT_TYPE, HOST, IF_MODIFIED_SINCE, IF_NONE_MATCH, RANGE, USER_AGENT,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tracing::{debug, warn};

use crate::errors::GatewayError;
use crate::keys::TranslatedPath;
use crate::signer::{SigningParams, CONTENT_SHA256_HEADER, S3_SERVICE, UNSIGNED_PAYLOAD};
use crate::AppState;

/// Inbound headers copied onto the outbound request.
pub const FORWARDED_REQUEST_HEADERS: [HeaderName; 6] = [
    RANGE,
    IF_NONE_MATCH,
    IF_MODIFIED_SINCE,
    ACCEPT,
    USER_AGENT,
    CONTENT_TYPE,
];

/// Headers meaningful for a single hop only; never relayed.
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Response headers a browser client may read.
pub const EXPOSED_HEADERS: &str = "ETag, Last-Modified, Content-Length, Content-Type";

/// One outbound call to the object store.
pub struct Outbound<'a> {
    pub method: Method,
    pub path: &'a TranslatedPath,
    pub query: Option<&'a str>,
    pub headers: HeaderMap,
    pub body: Option<reqwest::Body>,
    pub content_length: Option<u64>,
}

impl<'a> Outbound<'a> {
    /// A body-less request with no extra headers.
    pub fn new(method: Method, path: &'a TranslatedPath) -> Self {
        Self {
            method,
            path,
            query: None,
            headers: HeaderMap::new(),
            body: None,
            content_length: None,
        }
    }
}

impl AppState {
    /// Build the upstream URL: endpoint + wire path + verbatim query.
    pub fn upstream_url(
        &self,
        wire_path: &str,
        query: Option<&str>,
    ) -> Result<reqwest::Url, GatewayError> {
        let mut url = self.origin.clone();
        if url.cannot_be_a_base() {
            return Err(GatewayError::RequestBuild(format!(
                "endpoint '{}' cannot carry a path",
                self.origin
            )));
        }
        url.set_path(wire_path);
        // URL parsing folds `.`/`..` segments (escaped or not) into their
        // parent; such a key cannot be addressed without naming another one.
        if url.path() != wire_path {
            return Err(GatewayError::BadPath(format!(
                "path '{wire_path}' contains a '.' or '..' segment"
            )));
        }
        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }

    /// Build and sign an outbound request.
    pub fn build_request(&self, outbound: Outbound<'_>) -> Result<reqwest::Request, GatewayError> {
        let url = self.upstream_url(&outbound.path.wire, outbound.query)?;
        let mut request = reqwest::Request::new(outbound.method, url);

        let headers = request.headers_mut();
        *headers = outbound.headers;
        let host = HeaderValue::from_str(&self.host_header)
            .map_err(|e| GatewayError::RequestBuild(format!("host header: {e}")))?;
        headers.insert(HOST, host);
        if let Some(len) = outbound.content_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
        headers.insert(
            HeaderName::from_static(CONTENT_SHA256_HEADER),
            HeaderValue::from_static(UNSIGNED_PAYLOAD),
        );
        *request.body_mut() = outbound.body;

        let params = SigningParams {
            credentials: &self.credentials,
            region: &self.config.upstream.region,
            service: S3_SERVICE,
            time: Utc::now(),
        };
        self.signer
            .sign(&mut request, &params)
            .map_err(|e| GatewayError::Signing(e.to_string()))?;
        Ok(request)
    }

    /// Build, sign, and execute an outbound request. Any upstream status is
    /// returned as-is; only transport failures are errors.
    pub async fn send_signed(
        &self,
        outbound: Outbound<'_>,
    ) -> Result<reqwest::Response, GatewayError> {
        let method = outbound.method.clone();
        let request = self.build_request(outbound)?;
        debug!(
            "proxy {} -> {}{}",
            method,
            request.url().path(),
            request
                .url()
                .query()
                .map(|q| format!("?{q}"))
                .unwrap_or_default()
        );

        let response = self.client.execute(request).await.map_err(|e| {
            warn!("upstream {} failed: {}", method, e);
            crate::metrics::record_upstream(&method, None);
            GatewayError::UpstreamUnavailable(e.to_string())
        })?;
        crate::metrics::record_upstream(&method, Some(response.status().as_u16()));
        Ok(response)
    }
}

/// Copy the whitelisted inbound headers. An explicit `content_type`
/// overrides the inbound one.
pub fn forwarded_headers(inbound: &HeaderMap, content_type: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in FORWARDED_REQUEST_HEADERS.iter() {
        if let Some(value) = inbound.get(name) {
            if !value.is_empty() {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
    if let Some(ct) = content_type.filter(|ct| !ct.is_empty()) {
        if let Ok(value) = HeaderValue::from_str(ct) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    headers
}

/// Whether `name` is a hop-by-hop header.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Upstream response headers minus hop-by-hop ones, plus CORS.
pub fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 2);
    for (name, value) in upstream.iter() {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_HEADERS),
    );
    headers
}

/// Turn an upstream response into the inbound response. The status is
/// relayed verbatim; the body is streamed unless the method was HEAD.
pub fn relay_response(method: &Method, upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = relay_headers(upstream.headers());
    let body = if *method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(upstream.bytes_stream())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Forward one inbound request to `path` and relay the answer.
///
/// `content_length` is set on the outbound request only when known; an
/// unknown length (chunked upload) streams without one.
#[allow(clippy::too_many_arguments)]
pub async fn forward(
    state: &AppState,
    method: Method,
    path: &TranslatedPath,
    query: Option<&str>,
    body: Option<Body>,
    content_length: Option<u64>,
    content_type: Option<&str>,
    inbound_headers: &HeaderMap,
) -> Result<Response, GatewayError> {
    let outbound = Outbound {
        method: method.clone(),
        path,
        query,
        headers: forwarded_headers(inbound_headers, content_type),
        body: body.map(|b| reqwest::Body::wrap_stream(b.into_data_stream())),
        content_length,
    };
    let upstream = state.send_signed(outbound).await?;
    Ok(relay_response(&method, upstream))
}
