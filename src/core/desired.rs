//! Desired-state documents
//!
//! The command-line front end reads the rules to enforce from a JSON file:
//!
//! ```json
//! {
//!   "services": [
//!     { "code": "ssh", "name": "SSH", "ports": [{ "protocol": "tcp", "port": 22 }] }
//!   ],
//!   "rules": [
//!     { "owner": "alice", "service": "ssh", "source": "192.0.2.10",
//!       "expires": "2026-12-31T23:59:59", "comment": "home" },
//!     { "service": "ssh", "source": "2001:db8::/48" }
//!   ]
//! }
//! ```
//!
//! A rule without an owner is shared. Expiry timestamps are UTC.

use crate::core::error::{Error, Result};
use crate::core::rule::{NetworkLimits, Owner, Rule};
use crate::core::service::{Service, ServiceCatalog, ServiceDefinition};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Format of rule expiry timestamps, always UTC
pub const EXPIRY_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Serialized form of a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub service: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl RuleDefinition {
    pub fn from_rule(rule: &Rule) -> Self {
        Self {
            owner: rule.owner().user().map(str::to_string),
            service: rule.service().code().to_string(),
            source: rule.source().to_string(),
            expires: rule.expiry().map(|e| e.format(EXPIRY_FORMAT).to_string()),
            comment: rule.comment().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DesiredState {
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// Parses an expiry timestamp in [`EXPIRY_FORMAT`].
///
/// # Errors
///
/// Returns [`Error::InvalidExpiry`] if the text does not follow the format.
pub fn parse_expiry(text: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), EXPIRY_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| Error::InvalidExpiry(text.to_string()))
}

/// Renders an expiry the way hashes and logs show it
pub fn format_expiry(expiry: DateTime<Utc>) -> String {
    expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl DesiredState {
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for malformed JSON.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads and parses a document with blocking I/O.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, or
    /// [`Error::Serialization`] for malformed JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the document to `path` atomically: a temp file in the same
    /// directory is written, synced and renamed over the target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if serialization fails, or
    /// [`Error::Io`] if the temp file cannot be written or renamed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut temp = NamedTempFile::new_in(dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o644);
            temp.as_file().set_permissions(perms)?;
        }

        temp.write_all(json.as_bytes())?;
        temp.write_all(b"\n")?;
        temp.flush()?;
        temp.as_file().sync_all()?;

        temp.persist(path).map_err(|e| Error::Io(e.error))?;
        debug!("Saved {} rules to {}", self.rules.len(), path.display());
        Ok(())
    }

    /// Replaces the document's rules, keeping its services.
    pub fn set_rules(&mut self, rules: impl IntoIterator<Item = Rule>) {
        self.rules = rules
            .into_iter()
            .map(|rule| RuleDefinition::from_rule(&rule))
            .collect();
    }

    /// Builds the service catalog from the document's definitions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceDefinition`] for an invalid or duplicate service.
    pub fn catalog(&self) -> Result<ServiceCatalog> {
        let services = self
            .services
            .iter()
            .cloned()
            .map(Service::try_from)
            .collect::<Result<Vec<_>>>()?;
        ServiceCatalog::new(services)
    }

    /// Resolves every rule against `catalog`, applying `limits`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownService`] for a service code missing from the catalog
    /// - [`Error::InvalidOwner`], [`Error::InvalidAddress`] or
    ///   [`Error::InvalidExpiry`] for a malformed rule
    pub fn rules(&self, catalog: &ServiceCatalog, limits: NetworkLimits) -> Result<Vec<Rule>> {
        self.rules
            .iter()
            .map(|def| -> Result<Rule> {
                let service = catalog
                    .get(&def.service)
                    .ok_or_else(|| Error::UnknownService(def.service.clone()))?
                    .clone();
                let owner = match &def.owner {
                    Some(name) => {
                        crate::validators::validate_owner(name).map_err(Error::InvalidOwner)?;
                        Owner::User(name.clone())
                    }
                    None => Owner::Shared,
                };
                let expiry = def.expires.as_deref().map(parse_expiry).transpose()?;
                Ok(Rule::new(owner, service, &def.source, expiry, def.comment.as_deref())?
                    .with_limits(limits))
            })
            .collect()
    }

    /// Catalog and rules in one step.
    ///
    /// # Errors
    ///
    /// See [`DesiredState::catalog`] and [`DesiredState::rules`].
    pub fn resolve(&self, limits: NetworkLimits) -> Result<(ServiceCatalog, Vec<Rule>)> {
        let catalog = self.catalog()?;
        let rules = self.rules(&catalog, limits)?;
        Ok((catalog, rules))
    }
}
