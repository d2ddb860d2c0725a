use crate::core::error::{Error, Result};
use crate::core::iptables::IptablesTools;
use crate::core::rule::{
    DEFAULT_MAX_IPV4_NETWORK_SIZE, DEFAULT_MAX_IPV6_NETWORK_SIZE, NetworkLimits,
};
use crate::utils::default_config_path;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_CHAIN: &str = "USER_ACCESS";

/// Engine configuration: which chain to manage and how
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default = "default_chain")]
    pub chain: String,
    /// Append rules with `-m state --state NEW`
    #[serde(default)]
    pub stateful: bool,
    /// Explicit tool locations; searched in `PATH` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iptables_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6tables_path: Option<PathBuf>,
    /// Smallest allowed IPv4 source prefix (default /16)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ipv4_network_size: Option<u8>,
    /// Smallest allowed IPv6 source prefix (default /48)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ipv6_network_size: Option<u8>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain: default_chain(),
            stateful: false,
            iptables_path: None,
            ip6tables_path: None,
            max_ipv4_network_size: None,
            max_ipv6_network_size: None,
        }
    }
}

fn default_chain() -> String {
    DEFAULT_CHAIN.to_string()
}

impl EngineConfig {
    /// # Errors
    ///
    /// Returns [`Error::InvalidLimits`] if a floor exceeds its family's width.
    pub fn limits(&self) -> Result<NetworkLimits> {
        NetworkLimits::new(
            self.max_ipv4_network_size
                .unwrap_or(DEFAULT_MAX_IPV4_NETWORK_SIZE),
            self.max_ipv6_network_size
                .unwrap_or(DEFAULT_MAX_IPV6_NETWORK_SIZE),
        )
    }

    /// Tool set for the configured chain. Paths that are not configured are
    /// looked up in `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ToolNotFound`] or [`Error::InvalidChainName`].
    pub fn tools(&self) -> Result<IptablesTools> {
        let locate = |configured: &Option<PathBuf>, name: &str| {
            configured
                .clone()
                .or_else(|| crate::utils::find_binary(name))
                .ok_or_else(|| Error::ToolNotFound(name.to_string()))
        };
        let iptables = locate(&self.iptables_path, "iptables")?;
        let ip6tables = locate(&self.ip6tables_path, "ip6tables")?;
        IptablesTools::new(self.chain.clone(), iptables, ip6tables, self.stateful)
    }

    /// Checks everything that can be checked without touching the system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChainName`] or [`Error::InvalidLimits`].
    pub fn validate(&self) -> Result<()> {
        crate::validators::validate_chain_name(&self.chain).map_err(|message| {
            Error::InvalidChainName {
                name: self.chain.clone(),
                message,
            }
        })?;
        self.limits()?;
        Ok(())
    }
}

/// Loads and validates the configuration from `path`.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read, [`Error::Config`] for
/// malformed JSON, or a validation error.
pub fn load_config_from(path: &Path) -> Result<EngineConfig> {
    let json = std::fs::read_to_string(path)?;
    let config: EngineConfig = serde_json::from_str(&json)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Loads the configuration from `path`, or from the XDG config directory.
///
/// A missing file at the default location yields the defaults; a missing
/// file that was asked for explicitly is an error.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = path {
        return load_config_from(path);
    }

    if let Some(path) = default_config_path()
        && path.is_file()
    {
        debug!("Loading configuration from {}", path.display());
        return load_config_from(&path);
    }

    debug!("No configuration file, using defaults");
    Ok(EngineConfig::default())
}
