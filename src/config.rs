//! Runtime configuration

use crate::error::ConfigError;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the server answers the `AUTH` command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No credentials configured
    #[default]
    None,
    /// Credentials checked against the configured pair, `AUTH PLAIN`
    Plain,
    /// Credentials checked against the configured pair, `AUTH LOGIN`
    Login,
}

impl AuthMode {
    /// Whether this mode carries credentials that a client must match
    pub fn requires_credentials(self) -> bool {
        !matches!(self, AuthMode::None)
    }
}

/// TLS toggle. Only recorded; the server always speaks plaintext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    None,
    StartTls,
    Tls,
}

/// Settings that affect the SMTP listener. A change to any of them
/// requires a server restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SmtpConfig {
    /// Interface to bind
    pub host: String,
    /// Port to bind, 0 lets the OS pick one
    pub port: u16,
    /// Name announced in the greeting and HELO/EHLO replies
    pub hostname: String,
    pub auth_mode: AuthMode,
    pub username: String,
    pub password: String,
    pub tls_mode: TlsMode,
    /// Socket read timeout in seconds, 0 disables it
    #[serde(rename = "readTimeout")]
    pub read_timeout_secs: u64,
    /// Socket write timeout in seconds, 0 disables it
    #[serde(rename = "writeTimeout")]
    pub write_timeout_secs: u64,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    /// Accept any credentials presented with `AUTH`
    pub allow_insecure_auth: bool,
}

impl SmtpConfig {
    pub const DEFAULT_PORT: u16 = 1025;
    pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
    pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;
    pub const DEFAULT_MAX_RECIPIENTS: usize = 50;

    /// `host:port` string suitable for binding
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        timeout(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        timeout(self.write_timeout_secs)
    }
}

fn timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: Self::DEFAULT_PORT,
            hostname: "localhost".to_owned(),
            auth_mode: AuthMode::None,
            username: String::new(),
            password: String::new(),
            tls_mode: TlsMode::None,
            read_timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            write_timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            max_message_bytes: Self::DEFAULT_MAX_MESSAGE_BYTES,
            max_recipients: Self::DEFAULT_MAX_RECIPIENTS,
            allow_insecure_auth: true,
        }
    }
}

/// External spam scanner settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpamConfig {
    pub enabled: bool,
    pub binary: PathBuf,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: crate::spam::default_binary_path(),
        }
    }
}

/// Snapshot persistence settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistenceConfig {
    pub enabled: bool,
    /// Snapshot file, required when `enabled` is set
    pub path: Option<PathBuf>,
}

/// Everything the binary reads from its settings file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub smtp: SmtpConfig,
    pub spam_assassin: SpamConfig,
    pub persistence: PersistenceConfig,
}

impl Settings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("no settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&data)?)
    }
}
