//! Prefix rename and prefix delete.
//!
//! Both operations list their keys up front, then walk them strictly in
//! order, one upstream call at a time.  Every key carries a [`StepState`]
//! in a [`BulkReport`], so a run that stops part-way says exactly which
//! keys were moved or deleted.  The first failed step ends the run; steps
//! already applied stay applied.

use std::time::Instant;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::GatewayError;
use crate::forward::Outbound;
use crate::keys::{copy_source, normalize_prefix, object_path};
use crate::listing::list_entries;
use crate::AppState;

const COPY_SOURCE_HEADER: &str = "x-amz-copy-source";

/// Progress of one key through a bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Copied,
    Deleted,
}

/// One key scheduled by a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStep {
    pub key: String,
    /// Destination key for a rename; `None` for a plain delete.
    pub target: Option<String>,
    pub state: StepState,
}

/// Outcome of a bulk run.
#[derive(Debug)]
pub struct BulkReport {
    pub operation: &'static str,
    pub steps: Vec<KeyStep>,
    /// The error that stopped the run, if any.
    pub failure: Option<GatewayError>,
}

impl BulkReport {
    fn planned(operation: &'static str, steps: Vec<KeyStep>) -> Self {
        Self {
            operation,
            steps,
            failure: None,
        }
    }

    /// Keys that went all the way to `Deleted`.
    pub fn processed(&self) -> u64 {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Deleted)
            .count() as u64
    }

    /// Keys never touched.
    pub fn pending(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Pending)
            .count()
    }

    /// The processed count, or the stopping error annotated with it.
    pub fn into_result(self) -> Result<u64, GatewayError> {
        let processed = self.processed();
        match self.failure {
            None => Ok(processed),
            Some(source) => Err(GatewayError::Partial {
                processed,
                source: Box::new(source),
            }),
        }
    }
}

/// Body of `POST /api/rename`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub is_prefix: bool,
}

/// Answer to `POST /api/rename`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameResponse {
    pub moved: u64,
    pub took_ms: u64,
}

/// Body of `POST /api/delete-prefix`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeletePrefixRequest {
    pub prefix: String,
}

/// Answer to `POST /api/delete-prefix`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePrefixResponse {
    pub deleted: u64,
    pub took_ms: u64,
}

/// Server-side copy of `src` onto `dst` within the bucket.
pub async fn copy_object(state: &AppState, src: &str, dst: &str) -> Result<(), GatewayError> {
    let path = object_path(state.bucket(), dst);
    let source = HeaderValue::from_str(&copy_source(state.bucket(), src))
        .map_err(|e| GatewayError::RequestBuild(format!("copy source: {e}")))?;
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static(COPY_SOURCE_HEADER), source);

    let mut outbound = Outbound::new(Method::PUT, &path);
    outbound.headers = headers;
    outbound.content_length = Some(0);

    let status = state.send_signed(outbound).await?.status().as_u16();
    match status {
        200 | 201 => Ok(()),
        _ => Err(GatewayError::UpstreamRejected {
            operation: "copy",
            key: src.to_string(),
            status,
        }),
    }
}

/// Delete one object.
pub async fn delete_object(state: &AppState, key: &str) -> Result<(), GatewayError> {
    let path = object_path(state.bucket(), key);
    let status = state
        .send_signed(Outbound::new(Method::DELETE, &path))
        .await?
        .status()
        .as_u16();
    match status {
        200 | 204 => Ok(()),
        _ => Err(GatewayError::UpstreamRejected {
            operation: "delete",
            key: key.to_string(),
            status,
        }),
    }
}

async fn apply(state: &AppState, step: &mut KeyStep) -> Result<(), GatewayError> {
    if let Some(target) = &step.target {
        copy_object(state, &step.key, target).await?;
        step.state = StepState::Copied;
    }
    delete_object(state, &step.key).await?;
    step.state = StepState::Deleted;
    Ok(())
}

/// Apply every step in order, stopping at the first failure.
async fn run(state: &AppState, mut report: BulkReport) -> BulkReport {
    let started = Instant::now();
    for step in report.steps.iter_mut() {
        debug!(
            "{} '{}'{}",
            report.operation,
            step.key,
            step.target
                .as_ref()
                .map(|t| format!(" -> '{t}'"))
                .unwrap_or_default()
        );
        if let Err(e) = apply(state, step).await {
            warn!("{} of '{}' failed: {}", report.operation, step.key, e);
            report.failure = Some(e);
            break;
        }
        crate::metrics::record_bulk(report.operation);
    }
    info!(
        "{}: {} of {} object(s) done in {}ms{}",
        report.operation,
        report.processed(),
        report.steps.len(),
        started.elapsed().as_millis(),
        if report.failure.is_some() { " (stopped)" } else { "" }
    );
    report
}

/// Plan the steps of a rename.
///
/// A single-key rename yields one step. A prefix rename lists everything
/// under `src/`, skips folder markers, and maps each key onto `dst/`.
pub async fn plan_rename(state: &AppState, req: &RenameRequest) -> Result<Vec<KeyStep>, GatewayError> {
    if !req.is_prefix {
        if req.src.is_empty() || req.dst.is_empty() {
            return Err(GatewayError::BadRequest("src and dst are required".into()));
        }
        if req.src == req.dst {
            return Err(GatewayError::BadRequest("src and dst are the same key".into()));
        }
        return Ok(vec![KeyStep {
            key: req.src.clone(),
            target: Some(req.dst.clone()),
            state: StepState::Pending,
        }]);
    }

    let src = normalize_prefix(&req.src);
    let dst = normalize_prefix(&req.dst);
    if src == dst {
        return Err(GatewayError::BadRequest("src and dst are the same prefix".into()));
    }
    let steps = list_entries(state, &src)
        .await?
        .into_iter()
        .filter(|e| !e.is_folder_marker())
        .filter_map(|e| {
            let rest = e.key.strip_prefix(&src)?;
            Some(KeyStep {
                target: Some(format!("{dst}{rest}")),
                key: e.key,
                state: StepState::Pending,
            })
        })
        .collect();
    Ok(steps)
}

/// Rename one key or every key under a prefix.
pub async fn rename(state: &AppState, req: &RenameRequest) -> Result<BulkReport, GatewayError> {
    let steps = plan_rename(state, req).await?;
    Ok(run(state, BulkReport::planned("rename", steps)).await)
}

/// Delete every key under `prefix`, folder markers included.
pub async fn delete_prefix(state: &AppState, prefix: &str) -> Result<BulkReport, GatewayError> {
    let prefix = normalize_prefix(prefix);
    let steps = list_entries(state, &prefix)
        .await?
        .into_iter()
        .map(|e| KeyStep {
            key: e.key,
            target: None,
            state: StepState::Pending,
        })
        .collect();
    Ok(run(state, BulkReport::planned("delete-prefix", steps)).await)
}
