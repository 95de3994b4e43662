//! Paginated bucket listing.
//!
//! Issues ListObjectsV2 calls with a fixed page size, following
//! continuation tokens until a page comes back without one.  A failed or
//! unparsable page aborts the whole listing; nothing partial is returned
//! and no page is retried.

use chrono::{DateTime, Utc};
use http::Method;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::errors::GatewayError;
use crate::forward::Outbound;
use crate::keys::{bucket_path, escape_query_value};
use crate::AppState;

/// Objects requested per listing call.
pub const PAGE_SIZE: u32 = 1000;

/// One object from a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
}

impl ListEntry {
    /// A zero-byte object whose key ends in `/`.
    pub fn is_folder_marker(&self) -> bool {
        self.key.ends_with('/') && self.size == 0
    }
}

/// One listing response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ListEntry>,
    pub next_token: Option<String>,
}

/// Fields of one `<Contents>` element collected so far.
#[derive(Default)]
struct PartialEntry {
    key: Option<String>,
    size: Option<String>,
    last_modified: Option<String>,
    etag: Option<String>,
}

impl PartialEntry {
    fn finish(self) -> Result<ListEntry, String> {
        let key = self.key.ok_or("<Contents> without <Key>")?;
        let size = match self.size {
            Some(size) => size
                .trim()
                .parse()
                .map_err(|e| format!("bad <Size> for '{key}': {e}"))?,
            None => 0,
        };
        let last_modified = self
            .last_modified
            .ok_or_else(|| format!("<Contents> for '{key}' without <LastModified>"))?;
        let last_modified = DateTime::parse_from_rfc3339(last_modified.trim())
            .map_err(|e| format!("bad <LastModified> for '{key}': {e}"))?
            .with_timezone(&Utc);
        Ok(ListEntry {
            key,
            size,
            last_modified,
            etag: self.etag.unwrap_or_default(),
        })
    }
}

/// Parse a ListObjectsV2 XML body. Unknown elements are ignored.
///
/// Text is read untrimmed: S3 keys may begin or end with whitespace.
pub fn parse_list_page(xml: &str) -> Result<ListPage, GatewayError> {
    read_list_page(xml).map_err(|message| GatewayError::ListingFailed {
        status: 200,
        message: format!("unparsable listing: {message}"),
    })
}

fn read_list_page(xml: &str) -> Result<ListPage, String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(false);

    let mut page = ListPage::default();
    let mut stack: Vec<String> = Vec::new();
    let mut entry: Option<PartialEntry> = None;
    let mut text = String::new();

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                if name == "Contents" && stack.len() == 1 {
                    entry = Some(PartialEntry::default());
                }
                stack.push(name);
                text.clear();
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                stack.push(name);
                text.clear();
                close_element(&stack, &mut entry, &mut page, &text)?;
                stack.pop();
            }
            Event::Text(e) => {
                text.push_str(&e.unescape().map_err(|e| e.to_string())?);
            }
            Event::CData(e) => {
                text.push_str(&reader.decoder().decode(&e).map_err(|e| e.to_string())?);
            }
            Event::End(_) => {
                close_element(&stack, &mut entry, &mut page, &text)?;
                stack.pop();
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(page)
}

/// Store the text of the innermost open element where it belongs.
fn close_element(
    stack: &[String],
    entry: &mut Option<PartialEntry>,
    page: &mut ListPage,
    text: &str,
) -> Result<(), String> {
    let path: Vec<&str> = stack.iter().map(String::as_str).collect();
    match path.as_slice() {
        [_, "Contents"] => {
            if let Some(done) = entry.take() {
                page.entries.push(done.finish()?);
            }
        }
        [_, "Contents", field] => {
            if let Some(current) = entry.as_mut() {
                let value = Some(text.to_string());
                match *field {
                    "Key" => current.key = value,
                    "Size" => current.size = value,
                    "LastModified" => current.last_modified = value,
                    "ETag" => current.etag = value,
                    _ => {}
                }
            }
        }
        [_, "NextContinuationToken"] => {
            page.next_token = Some(text.to_string()).filter(|t| !t.is_empty());
        }
        _ => {}
    }
    Ok(())
}

/// Query string for one listing call.
pub fn list_query(prefix: &str, token: Option<&str>) -> String {
    let mut query = format!("list-type=2&max-keys={PAGE_SIZE}");
    if !prefix.is_empty() {
        query.push_str("&prefix=");
        query.push_str(&escape_query_value(prefix));
    }
    if let Some(token) = token {
        query.push_str("&continuation-token=");
        query.push_str(&escape_query_value(token));
    }
    query
}

/// Fetch a single page of keys under `prefix`.
pub async fn list_page(
    state: &AppState,
    prefix: &str,
    token: Option<&str>,
) -> Result<ListPage, GatewayError> {
    let path = bucket_path(state.bucket());
    let query = list_query(prefix, token);
    let mut outbound = Outbound::new(Method::GET, &path);
    outbound.query = Some(&query);

    let response = state.send_signed(outbound).await?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable(format!("listing body: {e}")))?;
    if !status.is_success() {
        return Err(GatewayError::ListingFailed {
            status: status.as_u16(),
            message: body.chars().take(512).collect(),
        });
    }
    parse_list_page(&body)
}

/// Walks the pages of one listing in order.
pub struct PageCursor<'a> {
    state: &'a AppState,
    prefix: String,
    token: Option<String>,
    exhausted: bool,
    pages: usize,
}

impl<'a> PageCursor<'a> {
    pub fn new(state: &'a AppState, prefix: impl Into<String>) -> Self {
        Self {
            state,
            prefix: prefix.into(),
            token: None,
            exhausted: false,
            pages: 0,
        }
    }

    /// Fetch the next page, or `None` once the previous page carried no
    /// continuation token.
    pub async fn next_page(&mut self) -> Result<Option<ListPage>, GatewayError> {
        if self.exhausted {
            return Ok(None);
        }
        let page = list_page(self.state, &self.prefix, self.token.as_deref()).await?;
        self.pages += 1;
        debug!(
            "listed page {} of prefix '{}': {} entries, more={}",
            self.pages,
            self.prefix,
            page.entries.len(),
            page.next_token.is_some()
        );
        self.token = page.next_token.clone();
        self.exhausted = self.token.is_none();
        Ok(Some(page))
    }

    /// Pages fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }
}

/// Every entry under `prefix`, in listing order.
pub async fn list_entries(state: &AppState, prefix: &str) -> Result<Vec<ListEntry>, GatewayError> {
    let mut cursor = PageCursor::new(state, prefix);
    let mut entries = Vec::new();
    while let Some(page) = cursor.next_page().await? {
        entries.extend(page.entries);
    }
    Ok(entries)
}

/// Every key under `prefix`, in listing order.
pub async fn list_keys(state: &AppState, prefix: &str) -> Result<Vec<String>, GatewayError> {
    Ok(list_entries(state, prefix)
        .await?
        .into_iter()
        .map(|e| e.key)
        .collect())
}
