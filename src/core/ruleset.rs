//! In-memory collection of desired rules, addressed by content hash
//!
//! Callers outside the process (an RPC layer, a rules file) identify rules by
//! [`Rule::content_hash`]. `RuleSet` provides the update/delete operations on
//! top of that identification.

use crate::core::error::{Error, Result};
use crate::core::rule::{NetworkLimits, Owner, Rule};
use crate::core::service::Service;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Fields of a rule as supplied by a caller creating or updating it
#[derive(Debug, Clone)]
pub struct RuleChange<'a> {
    pub owner: Owner,
    pub service: Service,
    pub source: &'a str,
    pub expiry: Option<DateTime<Utc>>,
    pub comment: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    limits: NetworkLimits,
}

impl RuleSet {
    pub fn new(limits: NetworkLimits) -> Self {
        Self {
            rules: Vec::new(),
            limits,
        }
    }

    /// Wraps existing rules; each keeps its own limits.
    pub fn from_rules(rules: Vec<Rule>, limits: NetworkLimits) -> Self {
        Self { rules, limits }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn into_rules(self) -> Vec<Rule> {
        self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Index of the rule carrying `hash`
    pub fn find_by_hash(&self, hash: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.content_hash() == hash)
    }

    /// Creates a rule, or updates the one identified by `existing`.
    ///
    /// Returns the content hash of the stored rule. The network size is
    /// checked against the limits before anything is stored.
    ///
    /// # Errors
    ///
    /// - [`Error::RuleNotFound`] if `existing` names no rule
    /// - [`Error::InvalidAddress`] if the source does not parse
    /// - [`Error::NetworkTooLarge`] if the source network exceeds the limits
    /// - [`Error::InvalidComment`] if the comment cannot be stored in the chain
    pub fn upsert(&mut self, existing: Option<&str>, change: RuleChange<'_>) -> Result<String> {
        if let Owner::User(name) = &change.owner {
            crate::validators::validate_owner(name).map_err(Error::InvalidOwner)?;
        }

        let candidate = match existing {
            Some(hash) => {
                let idx = self
                    .find_by_hash(hash)
                    .ok_or_else(|| Error::RuleNotFound(hash.to_string()))?;
                let mut updated = self.rules[idx].clone();
                updated.set_service(change.service);
                updated.set_source(change.source)?;
                updated.set_expiry(change.expiry);
                updated.set_comment(change.comment);
                (Some(idx), updated)
            }
            None => {
                let rule = Rule::new(
                    change.owner,
                    change.service,
                    change.source,
                    change.expiry,
                    change.comment,
                )?
                .with_limits(self.limits);
                (None, rule)
            }
        };

        let (slot, rule) = candidate;
        rule.network_size_valid(true)?;
        rule.validate_comment()?;

        let hash = rule.content_hash();
        match slot {
            Some(idx) => {
                debug!("Updated rule {} -> {hash}", existing.unwrap_or_default());
                self.rules[idx] = rule;
            }
            None => {
                debug!("Added rule {hash}");
                self.rules.push(rule);
            }
        }
        Ok(hash)
    }

    /// Removes and returns the rule identified by `hash`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuleNotFound`] if no rule carries the hash.
    pub fn remove_by_hash(&mut self, hash: &str) -> Result<Rule> {
        let idx = self
            .find_by_hash(hash)
            .ok_or_else(|| Error::RuleNotFound(hash.to_string()))?;
        Ok(self.rules.remove(idx))
    }

    /// Rules visible to `user`: their own plus every shared rule
    pub fn for_owner<'a>(&'a self, user: &'a str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules.iter().filter(move |r| match r.owner() {
            Owner::User(name) => name == user,
            Owner::Shared => true,
        })
    }
}
