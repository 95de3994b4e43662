//! Object key translation.
//!
//! An object request needs two spellings of the same path: the logical one
//! (`/bucket/dir/file name.txt`) and the wire one, where each segment is
//! percent-escaped on its own (`/bucket/dir/file%20name.txt`).  Segments are
//! escaped independently so that `/` stays a structural separator and is
//! never turned into `%2F`.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::errors::GatewayError;

/// Route prefix under which object keys are addressed.
pub const OBJECT_ROUTE_PREFIX: &str = "/s3/";

/// Percent-encoding set for a single path segment: everything except the
/// RFC 3986 unreserved characters.
const SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A path in both its logical and wire forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedPath {
    /// Unescaped path, prefixed by `/bucket`.
    pub logical: String,
    /// Per-segment escaped path, prefixed by the escaped bucket.
    pub wire: String,
}

/// Escape one path segment. The dot segments `.` and `..` are spelled out
/// as `%2E` escapes so they name a key segment rather than a directory step.
pub fn escape_segment(segment: &str) -> String {
    match segment {
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => utf8_percent_encode(segment, SEGMENT_ENCODE_SET).to_string(),
    }
}

/// Escape a string for use as a query parameter value.
pub fn escape_query_value(value: &str) -> String {
    utf8_percent_encode(value, SEGMENT_ENCODE_SET).to_string()
}

/// Percent-decode `input`, rejecting `%` escapes that are not followed by two
/// hex digits and byte sequences that are not UTF-8.
pub fn strict_decode(input: &str) -> Result<String, GatewayError> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                let end = (i + 3).min(bytes.len());
                return Err(GatewayError::BadPath(format!(
                    "invalid escape {:?}",
                    String::from_utf8_lossy(&bytes[i..end])
                )));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    percent_decode_str(input)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| GatewayError::BadPath(format!("key is not valid UTF-8: {e}")))
}

/// Build the path pair for the bucket itself (used by the listing route).
pub fn bucket_path(bucket: &str) -> TranslatedPath {
    TranslatedPath {
        logical: format!("/{bucket}"),
        wire: format!("/{}", escape_segment(bucket)),
    }
}

/// Build the path pair for a logical key. Empty segments are dropped, so
/// repeated, leading, or trailing slashes collapse.
pub fn translate_key(bucket: &str, key: &str) -> TranslatedPath {
    let mut path = bucket_path(bucket);
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        path.logical.push('/');
        path.logical.push_str(segment);
        path.wire.push('/');
        path.wire.push_str(&escape_segment(segment));
    }
    path
}

/// Append a trailing `/` to a non-empty prefix that lacks one.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

/// Like [`translate_key`], but a trailing `/` survives so that folder
/// markers can be addressed directly.
pub fn object_path(bucket: &str, key: &str) -> TranslatedPath {
    let mut path = translate_key(bucket, key);
    if key.ends_with('/') && key.split('/').any(|s| !s.is_empty()) {
        path.logical.push('/');
        path.wire.push('/');
    }
    path
}

/// Translate the raw (still escaped) path of an inbound object request.
///
/// `raw_path` must start with [`OBJECT_ROUTE_PREFIX`] or be exactly `/s3`;
/// anything after the prefix is decoded and re-escaped per segment.
pub fn translate_request_path(bucket: &str, raw_path: &str) -> Result<TranslatedPath, GatewayError> {
    let key_part = raw_path
        .strip_prefix(OBJECT_ROUTE_PREFIX)
        .or_else(|| raw_path.strip_prefix("/s3"))
        .unwrap_or(raw_path)
        .trim_start_matches('/');
    let decoded = strict_decode(key_part)?;
    Ok(translate_key(bucket, &decoded))
}

/// Value for the `x-amz-copy-source` header naming `key` in `bucket`.
pub fn copy_source(bucket: &str, key: &str) -> String {
    object_path(bucket, key).wire
}

/// Invert a wire path back to its logical spelling.
pub fn decode_wire_path(wire: &str) -> Result<String, GatewayError> {
    let segments = wire
        .split('/')
        .map(strict_decode)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(segments.join("/"))
}
