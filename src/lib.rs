//! s3browse library: a single-bucket gateway in front of an S3-compatible
//! object store.
//!
//! The crate exposes a transparent forwarding proxy for object and listing
//! requests, plus bulk operations (usage statistics, prefix rename, prefix
//! delete) built on repeated listing calls.

use std::sync::Arc;

pub mod bulk;
pub mod config;
pub mod errors;
pub mod forward;
pub mod keys;
pub mod listing;
pub mod metrics;
pub mod server;
pub mod signer;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::Config;
use crate::signer::{Credentials, RequestSigner, SigV4Signer};

/// Shared, immutable request context passed to all handlers via
/// `axum::extract::State`.
pub struct AppState {
    /// Validated gateway configuration.
    pub config: Config,
    /// Parsed upstream endpoint; outbound URLs are built from it.
    pub origin: reqwest::Url,
    /// Fixed `Host` header sent upstream, independent of the inbound host.
    pub host_header: String,
    /// Pooled HTTP client. No client-side timeout is configured.
    pub client: reqwest::Client,
    /// Signs every outbound request.
    pub signer: Arc<dyn RequestSigner>,
    /// Static upstream credentials.
    pub credentials: Credentials,
}

impl AppState {
    /// Build the context with the SigV4 signer.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_signer(config, Arc::new(SigV4Signer))
    }

    /// Build the context with a caller-provided signer.
    pub fn with_signer(config: Config, signer: Arc<dyn RequestSigner>) -> anyhow::Result<Self> {
        let origin = reqwest::Url::parse(config.upstream.endpoint.trim_end_matches('/'))?;
        let host_header = signer::host_header_for(&origin)
            .ok_or_else(|| anyhow::anyhow!("endpoint '{origin}' has no host"))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;
        let credentials = Credentials::new(
            config.upstream.access_key_id.clone(),
            config.upstream.secret_access_key.clone(),
        );

        Ok(Self {
            config,
            origin,
            host_header,
            client,
            signer,
            credentials,
        })
    }

    /// The one bucket this gateway fronts.
    pub fn bucket(&self) -> &str {
        &self.config.upstream.bucket
    }
}
