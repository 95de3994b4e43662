//! Prefix usage statistics.
//!
//! [`aggregate`] walks every listing page under a prefix and folds the
//! entries into running tallies: totals, per-kind buckets keyed on the file
//! extension, per-top-level-folder buckets, and the newest/oldest
//! modification times.  Nothing is cached between requests.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::errors::GatewayError;
use crate::keys::normalize_prefix;
use crate::listing::{ListEntry, PageCursor};
use crate::AppState;

/// Folder buckets kept in a report, largest first.
pub const MAX_FOLDERS: usize = 1000;

/// Coarse file classification by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Video,
    Audio,
    Doc,
    Archive,
    Code,
    Other,
}

const KIND_TABLE: &[(FileKind, &[&str])] = &[
    (
        FileKind::Image,
        &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "avif", "tif", "tiff", "ico", "heic"],
    ),
    (
        FileKind::Video,
        &[
            "mp4", "mkv", "webm", "avi", "mov", "m4v", "mpg", "mpeg", "flv", "3gp", "wmv", "ogv",
            "mts", "m2ts", "ts", "vob",
        ],
    ),
    (
        FileKind::Audio,
        &["mp3", "wav", "flac", "aac", "ogg", "oga", "m4a", "opus", "wma", "aiff", "mid"],
    ),
    (
        FileKind::Doc,
        &[
            "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp", "rtf", "txt",
            "md", "csv", "epub",
        ],
    ),
    (
        FileKind::Archive,
        &["zip", "rar", "7z", "tar", "gz", "tgz", "bz2", "tbz", "xz", "txz", "zst"],
    ),
    (
        FileKind::Code,
        &[
            "rs", "go", "js", "mjs", "jsx", "tsx", "py", "java", "kt", "c", "h", "cpp", "hpp", "cs",
            "rb", "php", "sh", "html", "css", "json", "yaml", "yml", "toml", "xml", "sql",
        ],
    ),
];

fn extension_table() -> &'static HashMap<&'static str, FileKind> {
    static TABLE: OnceLock<HashMap<&'static str, FileKind>> = OnceLock::new();
    TABLE.get_or_init(|| {
        KIND_TABLE
            .iter()
            .flat_map(|(kind, exts)| exts.iter().map(move |ext| (*ext, *kind)))
            .collect()
    })
}

impl FileKind {
    /// Classify `key` by the text after its final `.`, case-insensitively.
    pub fn of_key(key: &str) -> FileKind {
        let Some((_, ext)) = key.rsplit_once('.') else {
            return FileKind::Other;
        };
        extension_table()
            .get(ext.to_ascii_lowercase().as_str())
            .copied()
            .unwrap_or(FileKind::Other)
    }
}

/// Object count and byte total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub count: u64,
    pub bytes: u64,
}

impl Tally {
    fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
    }
}

/// One top-level folder bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderTally {
    pub folder: String,
    pub count: u64,
    pub bytes: u64,
}

/// Result of `GET /api/stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub prefix: String,
    pub count: u64,
    pub total_bytes: u64,
    pub took_ms: u64,
    pub by_type: BTreeMap<FileKind, Tally>,
    pub by_folder: Vec<FolderTally>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest: Option<DateTime<Utc>>,
}

/// Running tallies for one prefix.
#[derive(Debug, Default)]
pub struct Aggregator {
    prefix: String,
    total: Tally,
    by_type: BTreeMap<FileKind, Tally>,
    by_folder: HashMap<String, Tally>,
    newest: Option<DateTime<Utc>>,
    oldest: Option<DateTime<Utc>>,
}

impl Aggregator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Fold one listing entry in. Folder markers are ignored.
    pub fn observe(&mut self, entry: &ListEntry) {
        if entry.is_folder_marker() {
            return;
        }
        self.total.add(entry.size);
        self.by_type
            .entry(FileKind::of_key(&entry.key))
            .or_default()
            .add(entry.size);

        let rest = entry.key.strip_prefix(&self.prefix).unwrap_or(&entry.key);
        if let Some((first, _)) = rest.split_once('/') {
            self.by_folder
                .entry(format!("{first}/"))
                .or_default()
                .add(entry.size);
        }

        let at = entry.last_modified;
        if self.newest.map_or(true, |n| at > n) {
            self.newest = Some(at);
        }
        if self.oldest.map_or(true, |o| at < o) {
            self.oldest = Some(at);
        }
    }

    /// Close the tallies into a report.
    pub fn finish(self, elapsed: Duration) -> StatsReport {
        let mut by_folder: Vec<FolderTally> = self
            .by_folder
            .into_iter()
            .map(|(folder, t)| FolderTally {
                folder,
                count: t.count,
                bytes: t.bytes,
            })
            .collect();
        by_folder.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.folder.cmp(&b.folder)));
        by_folder.truncate(MAX_FOLDERS);

        StatsReport {
            prefix: self.prefix,
            count: self.total.count,
            total_bytes: self.total.bytes,
            took_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            by_type: self.by_type,
            by_folder,
            newest: self.newest,
            oldest: self.oldest,
        }
    }
}

/// Aggregate every object under `prefix`, page by page.
pub async fn aggregate(state: &AppState, prefix: &str) -> Result<StatsReport, GatewayError> {
    let started = Instant::now();
    let prefix = normalize_prefix(prefix);
    let mut cursor = PageCursor::new(state, prefix.clone());
    let mut aggregator = Aggregator::new(prefix.clone());
    while let Some(page) = cursor.next_page().await? {
        for entry in &page.entries {
            aggregator.observe(entry);
        }
    }
    let report = aggregator.finish(started.elapsed());
    info!(
        "stats for '{}': {} objects, {} bytes over {} page(s) in {}ms",
        prefix,
        report.count,
        report.total_bytes,
        cursor.pages_fetched(),
        report.took_ms
    );
    Ok(report)
}
