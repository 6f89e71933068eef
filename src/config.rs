//! Server configuration.
//!
//! Defaults can be overridden by a JSON file named through the
//! `PRINTSCP_CONFIG` environment variable (or `--config`), and any file
//! value can in turn be overridden by a CLI flag.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Smallest max-PDU length the server will configure or negotiate.
pub const MIN_PDU_LENGTH: u32 = 16 * 1024;
/// Largest max-PDU length the server will configure or negotiate.
pub const MAX_PDU_LENGTH: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// TCP port to listen on
    pub port: u16,
    /// Application Entity title of this SCP (1..=16 ASCII characters)
    pub ae_title: String,
    /// Maximum number of simultaneous associations
    pub max_associations: usize,
    /// Maximum PDU length offered during negotiation
    pub max_pdu_length: u32,
    /// Seconds without a PDU in an open association before an A-ABORT
    pub idle_timeout_secs: u64,
    /// Seconds allowed for an ordinary request handler
    pub request_timeout_secs: u64,
    /// Seconds allowed for a print action (page assembly + sink submission)
    pub print_timeout_secs: u64,
    /// Directory where assembled pages and job records are written
    pub output_dir: PathBuf,
    /// Maximum in-memory pixel data per association, in bytes
    pub max_pixel_bytes: usize,
    /// Seconds a finished Print Job stays queryable through N-GET
    pub job_retention_secs: u64,
    /// Printer Name reported through N-GET on the Printer SOP Class
    pub printer_name: String,
    /// Largest Max Density honored without a warning status
    pub max_density: u16,
    /// Interpret `STANDARD\a,b` as rows,columns instead of columns,rows
    pub standard_format_rows_first: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 11112,
            ae_title: "PRINTSCP".to_string(),
            max_associations: 16,
            max_pdu_length: MIN_PDU_LENGTH,
            idle_timeout_secs: 60,
            request_timeout_secs: 30,
            print_timeout_secs: 120,
            output_dir: PathBuf::from("prints"),
            max_pixel_bytes: 256 * 1024 * 1024,
            job_retention_secs: 300,
            printer_name: "PRINTSCP".to_string(),
            max_density: 300,
            standard_format_rows_first: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ServerConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(config)
    }

    /// Load configuration from the file named by `PRINTSCP_CONFIG`,
    /// falling back to defaults when the variable is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os("PRINTSCP_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let title = self.ae_title.trim();
        if title.is_empty() || title.len() > 16 || !title.is_ascii() {
            return Err(ConfigError::Invalid(format!(
                "AE title {:?} must be 1..=16 ASCII characters",
                self.ae_title
            )));
        }
        if !(MIN_PDU_LENGTH..=MAX_PDU_LENGTH).contains(&self.max_pdu_length) {
            return Err(ConfigError::Invalid(format!(
                "max PDU length {} outside {}..={}",
                self.max_pdu_length, MIN_PDU_LENGTH, MAX_PDU_LENGTH
            )));
        }
        if self.max_associations == 0 {
            return Err(ConfigError::Invalid(
                "max associations must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout_secs == 0 || self.print_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn print_timeout(&self) -> Duration {
        Duration::from_secs(self.print_timeout_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_long_ae_title() {
        let config = ServerConfig {
            ae_title: "THIS_TITLE_IS_TOO_LONG".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_tiny_pdu() {
        let config = ServerConfig {
            max_pdu_length: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("printscp.json");
        std::fs::write(&path, r#"{"port": 10104, "ae_title": "EPSON3"}"#).unwrap();
        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 10104);
        assert_eq!(config.ae_title, "EPSON3");
        // everything else keeps its default
        assert_eq!(config.max_associations, 16);
    }
}
