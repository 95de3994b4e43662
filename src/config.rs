//! Configuration loading and types for the gateway.
//!
//! Configuration is read from an optional YAML file and then overlaid with
//! the `S3_*` / `PORT` environment variables.  The resulting [`Config`] is
//! validated once at startup and never mutated afterwards.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// The single upstream bucket and its static credentials.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Upstream object store configuration.
///
/// Every field is required; [`Config::validate`] rejects empty values.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpstreamConfig {
    /// Base URL of the S3-compatible endpoint, e.g. `https://s3.example.com`.
    #[serde(default)]
    pub endpoint: String,

    /// Region used in the signing scope.
    #[serde(default)]
    pub region: String,

    /// Static access key id.
    #[serde(alias = "access_key", default)]
    pub access_key_id: String,

    /// Static secret access key.
    #[serde(alias = "secret_key", default)]
    pub secret_access_key: String,

    /// The one bucket this gateway fronts.
    #[serde(default)]
    pub bucket: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8088
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Environment overlay -----------------------------------------------------

/// Environment variables recognised by [`Config::apply_env_overrides`].
pub const ENV_ENDPOINT: &str = "S3_ENDPOINT";
pub const ENV_REGION: &str = "S3_REGION";
pub const ENV_ACCESS_KEY_ID: &str = "S3_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "S3_SECRET_ACCESS_KEY";
pub const ENV_BUCKET: &str = "S3_BUCKET";
pub const ENV_PORT: &str = "PORT";

impl Config {
    /// Overlay values from the process environment.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Overlay values from an arbitrary lookup. Blank values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get(ENV_ENDPOINT) {
            self.upstream.endpoint = v;
        }
        if let Some(v) = get(ENV_REGION) {
            self.upstream.region = v;
        }
        if let Some(v) = get(ENV_ACCESS_KEY_ID) {
            self.upstream.access_key_id = v;
        }
        if let Some(v) = get(ENV_SECRET_ACCESS_KEY) {
            self.upstream.secret_access_key = v;
        }
        if let Some(v) = get(ENV_BUCKET) {
            self.upstream.bucket = v;
        }
        if let Some(v) = get(ENV_PORT) {
            self.server.port = v
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {ENV_PORT} value '{v}': {e}"))?;
        }
        Ok(())
    }

    /// Check that every upstream value is present and the endpoint is a
    /// usable absolute URL. Trailing slashes on the endpoint are trimmed.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        let up = &mut self.upstream;
        for (name, value) in [
            (ENV_ENDPOINT, &up.endpoint),
            (ENV_REGION, &up.region),
            (ENV_ACCESS_KEY_ID, &up.access_key_id),
            (ENV_SECRET_ACCESS_KEY, &up.secret_access_key),
            (ENV_BUCKET, &up.bucket),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("missing configuration: {name}");
            }
        }

        up.endpoint = up.endpoint.trim().trim_end_matches('/').to_string();
        let parsed = reqwest::Url::parse(&up.endpoint)
            .map_err(|e| anyhow::anyhow!("invalid {ENV_ENDPOINT} '{}': {e}", up.endpoint))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            anyhow::bail!(
                "invalid {ENV_ENDPOINT} '{}': expected an http(s) URL with a host",
                up.endpoint
            );
        }
        Ok(())
    }
}

// -- Loader ------------------------------------------------------------------

/// Load configuration from `path` (if the file exists), overlay the
/// environment, and validate the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let mut config = read_config_file(path)?;
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Parse the YAML file at `path`. A missing file yields the defaults.
pub fn read_config_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn full_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            (ENV_ENDPOINT, "https://garage.local:3900/"),
            (ENV_REGION, "garage"),
            (ENV_ACCESS_KEY_ID, "GKexample"),
            (ENV_SECRET_ACCESS_KEY, "secret"),
            (ENV_BUCKET, "photos"),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.logging.level, "info");
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_yaml_file_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 9000\nupstream:\n  endpoint: http://localhost:9000\n  region: us-east-1\n  access_key: ak\n  secret_key: sk\n  bucket: data\nlogging:\n  format: json\n"
        )
        .unwrap();

        let mut config = read_config_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.upstream.access_key_id, "ak");
        assert_eq!(config.upstream.secret_access_key, "sk");
        assert_eq!(config.upstream.bucket, "data");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = read_config_file("/nonexistent/s3browse.yaml").unwrap();
        assert!(config.upstream.endpoint.is_empty());
    }

    #[test]
    fn test_env_overrides_and_trailing_slash() {
        let env = full_env();
        let mut config = Config::default();
        config
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.upstream.endpoint, "https://garage.local:3900");
        assert_eq!(config.upstream.bucket, "photos");
        assert_eq!(config.server.port, 8088);
    }

    #[test]
    fn test_port_override() {
        let mut config = Config::default();
        config
            .apply_overrides_from(|k| (k == ENV_PORT).then(|| " 7070 ".to_string()))
            .unwrap();
        assert_eq!(config.server.port, 7070);

        let err = config
            .apply_overrides_from(|k| (k == ENV_PORT).then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_missing_value_is_named() {
        let mut env = full_env();
        env.remove(ENV_BUCKET);
        let mut config = Config::default();
        config
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "missing configuration: S3_BUCKET");
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let mut env = full_env();
        env.insert(ENV_ENDPOINT, "ftp://example.com");
        let mut config = Config::default();
        config
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!(config.validate().is_err());
    }
}
