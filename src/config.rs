//! Server configuration: CLI flags overlaid on an optional TOML file,
//! loaded with `toml`/`serde`, extending a plain `ServerConfig` struct
//! with path-translation rules and decompression settings.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::translate::RewriteRule;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// On-disk representation of the rewrite-rule table and decompression
/// settings.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    rules: Vec<RuleEntry>,
    #[serde(default)]
    compressed_suffix: Option<String>,
    #[serde(default)]
    max_connections: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    logical_prefix: String,
    host_prefix: PathBuf,
}

/// Resolved server configuration.
///
/// There is deliberately no idle-connection timeout here: the core event
/// loop blocks on readiness with no timeout and performs no retransmission
/// — abandoned transfers are reaped only via control-channel
/// events, the same way a blocking `select()` with no timeout would.
#[derive(Debug, Clone)]
pub struct Config {
    pub readonly: bool,
    pub addrs: Vec<(IpAddr, Option<u16>)>,
    pub rules: Vec<RewriteRule>,
    pub compressed_suffix: String,
    pub max_connections: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            readonly: false,
            addrs: vec![(IpAddr::from([127, 0, 0, 1]), Some(69))],
            rules: vec![RewriteRule::new("", ".")],
            compressed_suffix: ".zst".to_owned(),
            max_connections: None,
        }
    }
}

impl Config {
    /// Loads rewrite rules and decompression settings from a TOML file,
    /// overlaying them onto the given base configuration. CLI flags for
    /// addresses/readonly/timeout are applied by the caller afterward so
    /// they take precedence over the file.
    pub fn merge_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;

        if !file.rules.is_empty() {
            self.rules = file
                .rules
                .into_iter()
                .map(|r| RewriteRule::new(r.logical_prefix, r.host_prefix))
                .collect();
        }
        if let Some(suffix) = file.compressed_suffix {
            self.compressed_suffix = suffix;
        }
        if let Some(max) = file.max_connections {
            self.max_connections = Some(max);
        }
        Ok(self)
    }
}
