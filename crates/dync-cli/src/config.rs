//! YAML configuration loading for the dync server and client binaries.
//!
//! This is deliberately thin: CLI argument parsing and YAML loading are
//! collaborator concerns the upload coordinator itself never touches (see
//! the core crate's documentation). Recognized keys mirror the original
//! implementation's config schema one-for-one.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use dync_storage::{DropboxConfig, DropboxRule};
use serde::Deserialize;

fn default_true() -> bool {
    true
}

/// Top-level `storage.dropboxes[]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DropboxRuleConfig {
    /// Regular expression matched against the cleaned file name.
    pub regexp: String,
    /// Absolute destination directory for files matching this rule.
    pub path: PathBuf,
    /// Restrict this rule to uploads from these origins.
    #[serde(default)]
    pub origin: Option<Vec<String>>,
    /// Whether this rule applies to directory uploads.
    #[serde(default = "default_true")]
    pub match_dir: bool,
    /// Whether this rule applies to file uploads.
    #[serde(default = "default_true")]
    pub match_file: bool,
    /// Whether the cleaned name must carry exactly one valid barcode.
    #[serde(default = "default_true")]
    pub requires_barcode: bool,
}

impl From<DropboxRuleConfig> for DropboxRule {
    fn from(rule: DropboxRuleConfig) -> Self {
        DropboxRule {
            regexp: rule.regexp,
            path: rule.path,
            origin: rule.origin,
            match_file: rule.match_file,
            match_dir: rule.match_dir,
            requires_barcode: rule.requires_barcode,
        }
    }
}

/// The `storage` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// Root under which plain destinations may fall back.
    pub path: PathBuf,
    /// Root for `passthrough`-directed uploads.
    pub manual: PathBuf,
    /// Ordered list of dropbox rules; first match wins.
    #[serde(default)]
    pub dropboxes: Vec<DropboxRuleConfig>,
}

/// The `options` section: daemon collaborator knobs the server process
/// consults on startup but the upload coordinator never reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptionsSection {
    /// Path to write the server's pid to on startup.
    pub pidfile: Option<PathBuf>,
    /// Process umask to apply before creating any staging files.
    pub umask: Option<u32>,
    /// Directory of trusted bearer-token certificates. Defaults to
    /// accepting no peers, which is only useful for local testing.
    pub certs_dir: Option<PathBuf>,
}

/// The `logging` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// `tracing-subscriber` `EnvFilter` directive, e.g. `"info"` or
    /// `"dync_core=debug,dync_storage=info"`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional path to also write logs to, in addition to stderr.
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: default_log_level(),
            file: None,
        }
    }
}

/// The server's full YAML configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind endpoint, e.g. `tcp://0.0.0.0:8889`.
    pub address: String,
    /// Parent of per-upload staging directories.
    pub tmp_dir: PathBuf,
    /// Destination resolution rules.
    pub storage: StorageSection,
    /// Daemon/auth collaborator options.
    #[serde(default)]
    pub options: OptionsSection,
    /// Logging collaborator configuration.
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ServerConfig {
    /// Load and parse a YAML config file from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML
    /// matching this schema.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        let config: ServerConfig = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Parse [`Self::address`] as a `tcp://host:port` endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is missing the `tcp://` scheme or is
    /// not a valid socket address.
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let rest = self
            .address
            .strip_prefix("tcp://")
            .ok_or_else(|| anyhow::anyhow!("address must use the tcp:// scheme: {}", self.address))?;
        rest.parse()
            .map_err(|e| anyhow::anyhow!("invalid address {}: {e}", self.address))
    }

    /// Build the [`DropboxConfig`] the upload coordinator's storage layer
    /// consumes, and eagerly validate it (every rule's regex compiles,
    /// every directory exists).
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration fails validation.
    pub fn dropbox_config(&self) -> anyhow::Result<DropboxConfig> {
        let config = DropboxConfig {
            path: self.storage.path.clone(),
            manual: self.storage.manual.clone(),
            dropboxes: self
                .storage
                .dropboxes
                .iter()
                .cloned()
                .map(DropboxRule::from)
                .collect(),
        };
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid storage configuration: {e}"))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
address: "tcp://0.0.0.0:8889"
tmp_dir: /tmp/dync-staging
storage:
  path: /tmp/dropbox
  manual: /tmp/dropbox/manual
  dropboxes:
    - regexp: ".*\\.raw$"
      path: /tmp/dropbox/raw
      requires_barcode: false
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.address, "tcp://0.0.0.0:8889");
        assert_eq!(config.storage.dropboxes.len(), 1);
        assert!(!config.storage.dropboxes[0].requires_barcode);
        assert!(config.storage.dropboxes[0].match_file);
        assert!(config.options.pidfile.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn bind_addr_requires_tcp_scheme() {
        let config = ServerConfig {
            address: "0.0.0.0:8889".to_string(),
            tmp_dir: PathBuf::from("/tmp"),
            storage: StorageSection {
                path: PathBuf::from("/tmp"),
                manual: PathBuf::from("/tmp"),
                dropboxes: vec![],
            },
            options: OptionsSection::default(),
            logging: LoggingSection::default(),
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn bind_addr_parses_tcp_scheme() {
        let config = ServerConfig {
            address: "tcp://127.0.0.1:9000".to_string(),
            tmp_dir: PathBuf::from("/tmp"),
            storage: StorageSection {
                path: PathBuf::from("/tmp"),
                manual: PathBuf::from("/tmp"),
                dropboxes: vec![],
            },
            options: OptionsSection::default(),
            logging: LoggingSection::default(),
        };
        assert_eq!(config.bind_addr().unwrap(), "127.0.0.1:9000".parse().unwrap());
    }
}
