//! AWS Signature Version 4 request signing.
//!
//! Signs outbound requests to the object store with static credentials.
//! The payload is never hashed: every request carries the
//! `UNSIGNED-PAYLOAD` marker so bodies can stream in both directions.
//!
//! The core algorithm follows the AWS SigV4 specification:
//! 1. Build a canonical request
//! 2. Build a string-to-sign
//! 3. Derive a signing key via HMAC chain
//! 4. Compute the signature and attach the `Authorization` header
//!
//! The canonical URI is the request path exactly as built by the caller.
//! Paths are escaped once, per segment, by [`crate::keys`]; the signer must
//! not escape them again.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, HOST};
use sha2::{Digest, Sha256};

use crate::keys::escape_query_value;

type HmacSha256 = Hmac<Sha256>;

/// Payload hash marker for requests whose body is not hashed.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Header carrying the payload hash.
pub const CONTENT_SHA256_HEADER: &str = "x-amz-content-sha256";

/// Header carrying the signing timestamp.
pub const AMZ_DATE_HEADER: &str = "x-amz-date";

/// Service identifier used in the credential scope.
pub const S3_SERVICE: &str = "s3";

/// Static access key pair.
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Everything the signer needs besides the request itself.
#[derive(Debug, Clone, Copy)]
pub struct SigningParams<'a> {
    pub credentials: &'a Credentials,
    pub region: &'a str,
    pub service: &'a str,
    pub time: DateTime<Utc>,
}

/// Signs an outbound request in place.
pub trait RequestSigner: Send + Sync + 'static {
    /// Attach authentication headers to `request`.
    fn sign(&self, request: &mut reqwest::Request, params: &SigningParams<'_>)
        -> anyhow::Result<()>;
}

/// SigV4 header signer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigV4Signer;

impl RequestSigner for SigV4Signer {
    fn sign(
        &self,
        request: &mut reqwest::Request,
        params: &SigningParams<'_>,
    ) -> anyhow::Result<()> {
        let amz_date = params.time.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = params.time.format("%Y%m%d").to_string();

        request.headers_mut().insert(
            HeaderName::from_static(AMZ_DATE_HEADER),
            HeaderValue::from_str(&amz_date)?,
        );

        let host = match request.headers().get(HOST) {
            Some(v) => v.to_str()?.to_string(),
            None => host_header_for(request.url())
                .ok_or_else(|| anyhow::anyhow!("request URL has no host"))?,
        };

        let payload_hash = request
            .headers()
            .get(CONTENT_SHA256_HEADER)
            .map(|v| v.to_str())
            .transpose()?
            .unwrap_or(UNSIGNED_PAYLOAD)
            .to_string();

        let headers = headers_to_sign(request, &host)?;
        let signed_headers = headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = build_canonical_request(
            request.method().as_str(),
            request.url().path(),
            request.url().query().unwrap_or(""),
            &headers,
            &signed_headers,
            &payload_hash,
        );

        let credential_scope = format!(
            "{date_stamp}/{}/{}/aws4_request",
            params.region, params.service
        );
        let string_to_sign = build_string_to_sign(&amz_date, &credential_scope, &canonical_request);
        let signing_key = derive_signing_key(
            &params.credentials.secret_access_key,
            &date_stamp,
            params.region,
            params.service,
        );
        let signature = compute_signature(&signing_key, &string_to_sign);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            params.credentials.access_key_id
        );
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&authorization)?);
        Ok(())
    }
}

/// The `Host` header value for `url`: host, plus the port when it is not
/// the scheme default.
pub fn host_header_for(url: &reqwest::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Collect `(lowercase-name, value)` pairs to sign: `host`, `content-type`,
/// and every `x-amz-*` header, sorted by name.
fn headers_to_sign(
    request: &reqwest::Request,
    host: &str,
) -> anyhow::Result<Vec<(String, String)>> {
    let mut headers = vec![("host".to_string(), host.to_string())];
    for name in request.headers().keys() {
        let lower = name.as_str();
        if lower == CONTENT_TYPE.as_str() || lower.starts_with("x-amz-") {
            let values = request
                .headers()
                .get_all(name)
                .iter()
                .map(|v| v.to_str().map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?;
            headers.push((lower.to_string(), values.join(",")));
        }
    }
    headers.sort();
    headers.dedup_by(|a, b| a.0 == b.0);
    Ok(headers)
}

// ── Canonical request construction ──────────────────────────────────

/// Build the canonical request string.
///
/// ```text
/// HTTPMethod + '\n' +
/// CanonicalURI + '\n' +
/// CanonicalQueryString + '\n' +
/// CanonicalHeaders + '\n' +
/// SignedHeaders + '\n' +
/// HashedPayload
/// ```
pub fn build_canonical_request(
    method: &str,
    uri: &str,
    query_string: &str,
    headers: &[(String, String)],
    signed_headers_str: &str,
    payload_hash: &str,
) -> String {
    let canonical_uri = if uri.is_empty() { "/" } else { uri };
    let canonical_query = build_canonical_query_string(query_string);

    let mut canonical_headers = String::new();
    for name in signed_headers_str.split(';') {
        if let Some((hname, hval)) = headers.iter().find(|(n, _)| n == name) {
            canonical_headers.push_str(hname);
            canonical_headers.push(':');
            canonical_headers.push_str(&collapse_whitespace(hval));
            canonical_headers.push('\n');
        }
    }

    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers_str}\n{payload_hash}"
    )
}

/// Build the canonical query string from a raw query string.
///
/// Each name and value is decoded (`+` counts as a space, as in form
/// encoding) and re-encoded with S3 rules, then the pairs are sorted.
/// Parameters with no value use an empty value: `acl=`.
pub fn build_canonical_query_string(query_string: &str) -> String {
    let mut params: Vec<(String, String)> = query_string
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            (
                escape_query_value(&query_decode(k)),
                escape_query_value(&query_decode(v)),
            )
        })
        .collect();
    params.sort();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn query_decode(s: &str) -> String {
    let spaced = s.replace('+', " ");
    percent_encoding::percent_decode_str(&spaced)
        .decode_utf8_lossy()
        .into_owned()
}

// ── String to sign ──────────────────────────────────────────────────

/// Build the string to sign.
///
/// ```text
/// AWS4-HMAC-SHA256 + '\n' +
/// Timestamp + '\n' +
/// CredentialScope + '\n' +
/// HexEncode(SHA256(CanonicalRequest))
/// ```
pub fn build_string_to_sign(
    timestamp: &str,
    credential_scope: &str,
    canonical_request: &str,
) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("AWS4-HMAC-SHA256\n{timestamp}\n{credential_scope}\n{hash}")
}

// ── Signing key derivation ──────────────────────────────────────────

/// Derive the signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC-SHA256("AWS4" + secret, dateStamp)
/// kRegion  = HMAC-SHA256(kDate, region)
/// kService = HMAC-SHA256(kRegion, service)
/// kSigning = HMAC-SHA256(kService, "aws4_request")
/// ```
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Compute HMAC-SHA256.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute the signature: HexEncode(HMAC-SHA256(SigningKey, StringToSign)).
pub fn compute_signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

/// Collapse consecutive whitespace in a header value to a single space,
/// and trim leading/trailing whitespace.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Tests ───────────────────────────────────────────────────────────
