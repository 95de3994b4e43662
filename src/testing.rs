//! In-memory S3 stand-in for tests.
//!
//! Serves the handful of calls the gateway makes (ListObjectsV2, object
//! GET/HEAD/PUT/DELETE, copy via `x-amz-copy-source`) on an ephemeral
//! loopback port, records every request it receives, and can be told to
//! fail specific operations.

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::percent_decode_str;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::AppState;

/// Bucket name every mock serves.
pub const TEST_BUCKET: &str = "bucket";

/// One stored object.
#[derive(Debug, Clone)]
pub struct MockObject {
    pub data: Bytes,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
}

/// One request as the mock saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    /// Raw, still-escaped path.
    pub path: String,
    pub query: String,
    pub headers: HeaderMap,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

#[derive(Default)]
struct MockInner {
    objects: BTreeMap<String, MockObject>,
    requests: Vec<Recorded>,
    fail_copy_from: HashSet<String>,
    fail_delete: HashSet<String>,
    fail_list_after: Option<usize>,
    list_calls: usize,
}

/// Handle on a running mock store.
#[derive(Clone)]
pub struct MockStore {
    inner: Arc<Mutex<MockInner>>,
    pub addr: SocketAddr,
}

impl MockStore {
    /// Bind on `127.0.0.1:0` and serve in the background.
    pub async fn start() -> Self {
        let inner = Arc::new(Mutex::new(MockInner::default()));
        let app = Router::new().fallback(handle).with_state(inner.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock store");
        let addr = listener.local_addr().expect("mock store addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock store serve");
        });
        Self { inner, addr }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn insert(&self, key: &str, data: &[u8], content_type: &str) {
        self.insert_at(key, data, content_type, Utc::now());
    }

    pub fn insert_at(&self, key: &str, data: &[u8], content_type: &str, at: DateTime<Utc>) {
        let object = MockObject {
            data: Bytes::copy_from_slice(data),
            content_type: content_type.to_string(),
            last_modified: at,
            etag: etag_for(data),
        };
        self.lock().objects.insert(key.to_string(), object);
    }

    pub fn get(&self, key: &str) -> Option<MockObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.lock().requests.clone()
    }

    /// Requests with the given method, in arrival order.
    pub fn requests_with(&self, method: Method) -> Vec<Recorded> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    /// Any copy whose source is `key` answers 500.
    pub fn fail_copy_from(&self, key: &str) {
        self.lock().fail_copy_from.insert(key.to_string());
    }

    /// Any delete of `key` answers 500.
    pub fn fail_delete_of(&self, key: &str) {
        self.lock().fail_delete.insert(key.to_string());
    }

    /// Listing calls after the first `pages` answer 500.
    pub fn fail_list_after(&self, pages: usize) {
        self.lock().fail_list_after = Some(pages);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockInner> {
        self.inner.lock().expect("mock store lock")
    }
}

fn test_config(endpoint: String) -> Config {
    let mut config = Config::default();
    config.upstream.endpoint = endpoint;
    config.upstream.region = "us-east-1".to_string();
    config.upstream.access_key_id = "AKIDEXAMPLE".to_string();
    config.upstream.secret_access_key = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string();
    config.upstream.bucket = TEST_BUCKET.to_string();
    config
}

/// Gateway state pointed at `mock`.
pub fn test_state(mock: &MockStore) -> AppState {
    AppState::new(test_config(mock.endpoint())).expect("test state")
}

/// Gateway state pointed at a port nothing listens on.
pub fn unreachable_state() -> AppState {
    AppState::new(test_config("http://127.0.0.1:1".to_string())).expect("test state")
}

fn etag_for(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(&Sha256::digest(data)[..16]))
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn query_params(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

/// Key addressed by a raw `/bucket/...` path; `None` for the bucket itself.
fn key_of(raw_path: &str) -> Option<String> {
    let rest = raw_path.strip_prefix(&format!("/{TEST_BUCKET}"))?;
    let rest = rest.strip_prefix('/')?;
    if rest.is_empty() {
        None
    } else {
        Some(decode(rest))
    }
}

fn status(code: StatusCode, message: &str) -> Response {
    (code, message.to_string()).into_response()
}

async fn handle(
    State(inner): State<Arc<Mutex<MockInner>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut store = inner.lock().expect("mock store lock");
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or_default().to_string();
    store.requests.push(Recorded {
        method: method.clone(),
        path: path.clone(),
        query: query.clone(),
        headers: headers.clone(),
    });

    let Some(key) = key_of(&path) else {
        if method == Method::GET && query_params(&query).contains_key("list-type") {
            return list_objects(&mut store, &query);
        }
        return status(StatusCode::NOT_IMPLEMENTED, "bucket operation");
    };

    match method {
        Method::GET | Method::HEAD => match store.objects.get(&key) {
            Some(obj) => Response::builder()
                .status(StatusCode::OK)
                .header("content-type", obj.content_type.as_str())
                .header("content-length", obj.data.len().to_string())
                .header("etag", obj.etag.as_str())
                .header(
                    "last-modified",
                    httpdate::fmt_http_date(obj.last_modified.into()),
                )
                .body(Body::from(obj.data.clone()))
                .unwrap_or_else(|_| status(StatusCode::INTERNAL_SERVER_ERROR, "build")),
            None => status(StatusCode::NOT_FOUND, "NoSuchKey"),
        },
        Method::PUT => {
            if let Some(source) = headers.get("x-amz-copy-source") {
                let source = decode(source.to_str().unwrap_or_default());
                let Some(src_key) = source
                    .strip_prefix(&format!("/{TEST_BUCKET}/"))
                    .map(str::to_string)
                else {
                    return status(StatusCode::BAD_REQUEST, "InvalidArgument");
                };
                if store.fail_copy_from.contains(&src_key) {
                    return status(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
                }
                let Some(mut obj) = store.objects.get(&src_key).cloned() else {
                    return status(StatusCode::NOT_FOUND, "NoSuchKey");
                };
                obj.last_modified = Utc::now();
                let etag = obj.etag.clone();
                store.objects.insert(key, obj);
                return copy_result(&etag);
            }
            let content_type = headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("binary/octet-stream")
                .to_string();
            let etag = etag_for(&body);
            store.objects.insert(
                key,
                MockObject {
                    data: body,
                    content_type,
                    last_modified: Utc::now(),
                    etag: etag.clone(),
                },
            );
            Response::builder()
                .status(StatusCode::OK)
                .header("etag", etag)
                .body(Body::empty())
                .unwrap_or_else(|_| status(StatusCode::INTERNAL_SERVER_ERROR, "build"))
        }
        Method::DELETE => {
            if store.fail_delete.contains(&key) {
                return status(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
            }
            store.objects.remove(&key);
            status(StatusCode::NO_CONTENT, "")
        }
        _ => status(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed"),
    }
}

fn list_objects(store: &mut MockInner, query: &str) -> Response {
    store.list_calls += 1;
    if let Some(limit) = store.fail_list_after {
        if store.list_calls > limit {
            return status(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
        }
    }

    let params = query_params(query);
    let prefix = params.get("prefix").cloned().unwrap_or_default();
    let max_keys: usize = params
        .get("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);
    let after = params
        .get("continuation-token")
        .and_then(|t| hex::decode(t).ok())
        .and_then(|b| String::from_utf8(b).ok());

    let mut matching = store
        .objects
        .iter()
        .filter(|(k, _)| k.starts_with(&prefix))
        .filter(|(k, _)| after.as_ref().map_or(true, |a| k.as_str() > a.as_str()));
    let page: Vec<_> = matching.by_ref().take(max_keys).collect();
    let truncated = matching.next().is_some();
    let next_token = if truncated {
        page.last().map(|(k, _)| hex::encode(k.as_bytes()))
    } else {
        None
    };

    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
    let root = BytesStart::new("ListBucketResult")
        .with_attributes([("xmlns", "http://s3.amazonaws.com/doc/2006-03-01/")]);
    write(&mut writer, Event::Start(root));
    text_element(&mut writer, "Name", TEST_BUCKET);
    text_element(&mut writer, "Prefix", &prefix);
    text_element(&mut writer, "KeyCount", &page.len().to_string());
    text_element(&mut writer, "MaxKeys", &max_keys.to_string());
    text_element(&mut writer, "IsTruncated", &truncated.to_string());
    for (key, obj) in &page {
        write(&mut writer, Event::Start(BytesStart::new("Contents")));
        text_element(&mut writer, "Key", key);
        text_element(
            &mut writer,
            "LastModified",
            &obj.last_modified.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        text_element(&mut writer, "ETag", &obj.etag);
        text_element(&mut writer, "Size", &obj.data.len().to_string());
        text_element(&mut writer, "StorageClass", "STANDARD");
        write(&mut writer, Event::End(BytesEnd::new("Contents")));
    }
    if let Some(token) = next_token {
        text_element(&mut writer, "NextContinuationToken", &token);
    }
    write(&mut writer, Event::End(BytesEnd::new("ListBucketResult")));

    xml_response(writer)
}

fn copy_result(etag: &str) -> Response {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
    write(&mut writer, Event::Start(BytesStart::new("CopyObjectResult")));
    text_element(
        &mut writer,
        "LastModified",
        &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    text_element(&mut writer, "ETag", etag);
    write(&mut writer, Event::End(BytesEnd::new("CopyObjectResult")));
    xml_response(writer)
}

fn xml_response(writer: Writer<Cursor<Vec<u8>>>) -> Response {
    let body = writer.into_inner().into_inner();
    (
        StatusCode::OK,
        [("content-type", "application/xml")],
        body,
    )
        .into_response()
}

fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) {
    writer.write_event(event).expect("xml event");
}

fn text_element(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) {
    write(writer, Event::Start(BytesStart::new(tag)));
    write(writer, Event::Text(BytesText::new(text)));
    write(writer, Event::End(BytesEnd::new(tag)));
}
