//! chainwarden - per-user access rules for an iptables chain
//!
//! Reconciles a declarative set of access rules (service + source address,
//! owned by a user or shared, optionally expiring) against the rules
//! installed in an iptables/ip6tables chain, and applies the minimal set of
//! deletions and appends that makes them agree.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, chain parser, reconciliation and apply engine
//! - [`elevation`] - Privilege escalation for the firewall tools
//! - [`validators`] - Input validation for command-line bound values
//! - [`config`] - Engine configuration loading
//! - [`utils`] - XDG directories and binary lookup
//!
//! # Safety Features
//!
//! - Deletes by position run highest first, so earlier positions stay valid
//! - Validation (comments, network sizes) happens before any mutation
//! - Every apply stops at the first failing command and reports its progress
//! - Tools are invoked without a shell

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::engine::{ApplyReport, Engine, PlannedOp, RuleStatus};
pub use core::error::{Error, Result};
pub use core::iptables::{CommandRunner, IptablesTools, SystemRunner};
pub use core::rule::{Owner, Rule};
pub use core::service::{IpVersion, Protocol, Service, ServiceCatalog};
