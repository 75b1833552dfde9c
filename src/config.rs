//! Configuration file support for poultrymetrics-admin
//!
//! Reads from .poultrymetrics/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Where the installation's SQLite database lives
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Worker/employee linking
    #[serde(default)]
    pub linker: LinkerConfig,

    /// Outbound mail
    #[serde(default)]
    pub mail: MailConfig,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct DatabaseConfig {
    /// Database file. Relative paths are taken from the working directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Table names and defaults used when linking a worker login to an employee
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct LinkerConfig {
    /// Role that gets an employee record
    /// Default: "worker"
    #[serde(default = "default_worker_role")]
    pub worker_role: String,

    #[serde(default = "default_users_table")]
    pub users_table: String,

    #[serde(default = "default_employees_table")]
    pub employees_table: String,

    /// Written to `employees.status` on insert, when that column exists
    /// Default: "active"
    #[serde(default = "default_status")]
    pub default_status: String,
}

fn default_worker_role() -> String {
    "worker".to_string()
}

fn default_users_table() -> String {
    "users".to_string()
}

fn default_employees_table() -> String {
    "employees".to_string()
}

fn default_status() -> String {
    "active".to_string()
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            worker_role: default_worker_role(),
            users_table: default_users_table(),
            employees_table: default_employees_table(),
            default_status: default_status(),
        }
    }
}

/// Which delivery mechanism `mail::transport_from_config` builds
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MailTransportKind {
    /// Pipe messages into a sendmail-compatible binary
    Sendmail,
    /// Only log messages
    Log,
    /// Mail is off; every send fails with a clear error
    #[default]
    None,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct MailConfig {
    #[serde(default)]
    pub transport: MailTransportKind,

    /// Default: "/usr/sbin/sendmail"
    #[serde(default = "default_sendmail_path")]
    pub sendmail_path: PathBuf,

    #[serde(default)]
    pub from_address: Option<String>,

    /// Default: "PoultryMetrics"
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

fn default_sendmail_path() -> PathBuf {
    PathBuf::from("/usr/sbin/sendmail")
}

fn default_from_name() -> String {
    "PoultryMetrics".to_string()
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            transport: MailTransportKind::default(),
            sendmail_path: default_sendmail_path(),
            from_address: None,
            from_name: default_from_name(),
        }
    }
}

impl Config {
    /// Load config from .poultrymetrics/config.toml
    /// Returns default config if file doesn't exist
    pub fn load() -> Self {
        if let Some(path) = Self::find_config_path() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config")
                    }
                },
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not read config"),
            }
        }
        Self::default()
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".poultrymetrics").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }
}
