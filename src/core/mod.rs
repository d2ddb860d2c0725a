//! Core reconciliation functionality
//!
//! This module contains the types and logic for keeping an iptables chain in
//! line with a set of per-user access rules. It provides:
//!
//! - [`service`]: Services as named sets of protocol/port pairs
//! - [`rule`]: Desired rules, their matching and validity checks
//! - [`ruleset`]: Content-hash addressed rule collections
//! - [`chain`]: Parser for the chain listing
//! - [`iptables`]: Tool invocations and the command runner seam
//! - [`reconcile`]: Pure diff of desired against live rules
//! - [`engine`]: Apply, simulate and query on top of the diff
//! - [`desired`]: JSON desired-state documents
//! - [`error`]: Error types for all of the above

pub mod chain;
pub mod desired;
pub mod engine;
pub mod error;
pub mod iptables;
pub mod reconcile;
pub mod rule;
pub mod ruleset;
pub mod service;

#[cfg(test)]
pub mod test_helpers;
