//! Provider configuration
//!
//! Settings are merged from the built-in defaults, an optional TOML file and
//! `CIE_PKCS11_*` environment variables, later sources winning.

use std::path::PathBuf;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Prefix of the environment variables read by the provider
pub const ENV_PREFIX: &str = "CIE_PKCS11_";

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "CIE_PKCS11_CONFIG";

/// Card backend the provider talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Readers of the platform PC/SC service
    #[default]
    Pcsc,
    /// The in-process virtual CIE
    Virtual,
}

/// How card connections are shared with other processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareMode {
    /// Other processes may connect, transactions keep exchanges atomic
    #[default]
    Shared,
    /// The provider holds the card for itself
    Exclusive,
}

/// Provider settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Card backend
    pub backend: BackendKind,
    /// Log filter used when `RUST_LOG` is not set
    pub log_level: String,
    /// Append log output to this file instead of stderr
    pub log_file: Option<PathBuf>,
    /// Only readers whose name contains this string become slots
    pub reader_filter: Option<String>,
    /// Poll interval of slot event waits, in milliseconds
    pub slot_poll_interval_ms: u64,
    /// PC/SC share mode
    pub share_mode: ShareMode,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Pcsc,
            log_level: "info".to_string(),
            log_file: None,
            reader_filter: None,
            slot_poll_interval_ms: 500,
            share_mode: ShareMode::Shared,
        }
    }
}

impl ProviderConfig {
    /// Load the configuration from the default sources
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// The merged configuration sources
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = config_path() {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    /// Poll interval of slot event waits
    pub const fn slot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.slot_poll_interval_ms)
    }
}

/// Location of the configuration file
///
/// `CIE_PKCS11_CONFIG` wins over `~/.cie-pkcs11/cie-pkcs11.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }
    std::env::home_dir().map(|home| home.join(".cie-pkcs11").join("cie-pkcs11.toml"))
}
