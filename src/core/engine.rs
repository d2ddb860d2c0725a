//! Apply / simulate engine
//!
//! [`Engine`] reads both chains, diffs them against the desired rules
//! ([`crate::core::reconcile`]) and turns the result into an ordered list of
//! [`PlannedOp`]s. `set` executes that list, `simulate` renders it.
//!
//! Operation order:
//! 1. Forced only: flush the IPv4 chain, then the IPv6 chain
//! 2. Per IP version (IPv4 first): deletes by position, highest first, then
//!    appends in desired order
//!
//! Deleting high to low keeps the positions of the remaining deletes valid.
//! Execution stops at the first failing command; nothing is rolled back.

use crate::core::chain::{LiveRule, parse_chain_listing};
use crate::core::error::{Error, Result};
use crate::core::iptables::{CommandRunner, Invocation, IptablesTools, run_checked};
use crate::core::reconcile::{self, SyncPlan};
use crate::core::rule::{Rule, SourceAddress};
use crate::core::service::{IpVersion, Protocol, ServiceCatalog};
use chrono::Utc;
use std::fmt;
use strum::IntoEnumIterator;
use tracing::{debug, info};

/// One step of an apply sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOp {
    Flush(IpVersion),
    Delete {
        version: IpVersion,
        position: u32,
    },
    Append {
        version: IpVersion,
        protocol: Protocol,
        port: u16,
        source: SourceAddress,
        comment: Option<String>,
    },
}

impl PlannedOp {
    pub fn version(&self) -> IpVersion {
        match self {
            PlannedOp::Flush(version)
            | PlannedOp::Delete { version, .. }
            | PlannedOp::Append { version, .. } => *version,
        }
    }

    pub fn invocation(&self, tools: &IptablesTools) -> Invocation {
        match self {
            PlannedOp::Flush(version) => tools.flush(*version),
            PlannedOp::Delete { version, position } => tools.delete(*version, *position),
            PlannedOp::Append {
                version,
                protocol,
                port,
                source,
                comment,
            } => tools.append(*version, *protocol, *port, source, comment.as_deref()),
        }
    }
}

impl fmt::Display for PlannedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedOp::Flush(version) => write!(f, "flush {version} chain"),
            PlannedOp::Delete { version, position } => {
                write!(f, "delete {version} rule #{position}")
            }
            PlannedOp::Append {
                version,
                protocol,
                port,
                source,
                ..
            } => write!(
                f,
                "add {version} rule {}/{port} from {source}",
                protocol.display_name()
            ),
        }
    }
}

/// Orders a plan into the operations that carry it out.
pub fn plan_operations(plan: &SyncPlan<'_>) -> Vec<PlannedOp> {
    let mut ops = Vec::new();

    if plan.forced {
        ops.extend(IpVersion::iter().map(PlannedOp::Flush));
    }

    for version in IpVersion::iter() {
        let family = plan.family(version);

        let mut positions: Vec<u32> = family.to_remove.iter().map(|r| r.position).collect();
        positions.sort_unstable_by(|a, b| b.cmp(a));
        ops.extend(
            positions
                .into_iter()
                .map(|position| PlannedOp::Delete { version, position }),
        );

        for pending in &family.to_add {
            for &(protocol, port) in &pending.missing {
                ops.push(PlannedOp::Append {
                    version,
                    protocol,
                    port,
                    source: *pending.rule.source(),
                    comment: pending.rule.comment().map(str::to_string),
                });
            }
        }
    }

    ops
}

/// Runs `ops` in order, stopping at the first failure.
///
/// # Errors
///
/// Returns [`Error::PartialApply`] naming the failed operation and how many
/// operations completed before it.
pub fn execute<R: CommandRunner + ?Sized>(
    runner: &R,
    tools: &IptablesTools,
    ops: &[PlannedOp],
) -> Result<()> {
    let total = ops.len();
    for (completed, op) in ops.iter().enumerate() {
        let invocation = op.invocation(tools);
        run_checked(runner, &invocation).map_err(|source| Error::PartialApply {
            operation: op.to_string(),
            completed,
            total,
            source: Box::new(source),
        })?;
    }
    Ok(())
}

/// Outcome of [`Engine::set`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Operations executed, in order
    pub applied: Vec<PlannedOp>,
    /// Rules left out of a forced apply, with the reason
    pub skipped: Vec<String>,
}

impl ApplyReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

/// A desired rule and whether the chain currently carries all of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleStatus<'a> {
    pub rule: &'a Rule,
    pub in_effect: bool,
}

pub struct Engine<R> {
    tools: IptablesTools,
    catalog: ServiceCatalog,
    runner: R,
}

impl<R: CommandRunner> Engine<R> {
    pub fn new(tools: IptablesTools, catalog: ServiceCatalog, runner: R) -> Self {
        Self {
            tools,
            catalog,
            runner,
        }
    }

    pub fn tools(&self) -> &IptablesTools {
        &self.tools
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Lists and parses one chain.
    ///
    /// # Errors
    ///
    /// [`Error::Tool`] if the list command fails, [`Error::Format`] if its
    /// output cannot be parsed.
    pub fn read_chain(&self, version: IpVersion) -> Result<Vec<LiveRule>> {
        let output = run_checked(&self.runner, &self.tools.list(version))?;
        parse_chain_listing(&output, self.tools.chain(), version, &self.catalog)
    }

    /// Managed rules of both chains, IPv4 first.
    ///
    /// # Errors
    ///
    /// See [`Engine::read_chain`].
    pub fn live_rules(&self) -> Result<Vec<LiveRule>> {
        let mut rules = self.read_chain(IpVersion::V4)?;
        rules.extend(self.read_chain(IpVersion::V6)?);
        Ok(rules)
    }

    /// Diffs `rules` against fresh snapshots of both chains. A forced sync
    /// reads nothing.
    ///
    /// # Errors
    ///
    /// Chain read errors, and the validation errors of [`reconcile::diff`].
    pub fn sync<'a>(&self, rules: &'a [Rule], force: bool) -> Result<SyncPlan<'a>> {
        let now = Utc::now();
        if force {
            return Ok(reconcile::forced(rules, now));
        }
        let live_v4 = self.read_chain(IpVersion::V4)?;
        let live_v6 = self.read_chain(IpVersion::V6)?;
        reconcile::diff(rules, live_v4, live_v6, now)
    }

    /// Makes the chains match `rules`.
    ///
    /// # Errors
    ///
    /// Errors from [`Engine::sync`] before anything is changed, or
    /// [`Error::PartialApply`] if a command fails mid-sequence.
    pub fn set(&self, rules: &[Rule], force: bool) -> Result<ApplyReport> {
        let plan = self.sync(rules, force)?;
        let skipped = plan
            .skipped
            .iter()
            .map(|s| format!("{}: {}", s.rule, s.reason))
            .collect();

        if !plan.changes_needed {
            info!("No changes needed");
            return Ok(ApplyReport {
                applied: Vec::new(),
                skipped,
            });
        }

        let ops = plan_operations(&plan);
        execute(&self.runner, &self.tools, &ops)?;
        let v4 = ops.iter().filter(|op| op.version() == IpVersion::V4).count();
        info!(
            "Applied {} firewall changes ({v4} IPv4, {} IPv6)",
            ops.len(),
            ops.len() - v4
        );

        Ok(ApplyReport {
            applied: ops,
            skipped,
        })
    }

    /// Command lines `set` would run, or `None` when nothing would change.
    ///
    /// # Errors
    ///
    /// See [`Engine::sync`].
    pub fn simulate(&self, rules: &[Rule], force: bool) -> Result<Option<Vec<String>>> {
        let plan = self.sync(rules, force)?;
        if !plan.changes_needed {
            return Ok(None);
        }
        let lines = plan_operations(&plan)
            .iter()
            .map(|op| op.invocation(&self.tools).to_string())
            .collect();
        Ok(Some(lines))
    }

    /// Current versus desired view: every matched or pending rule with
    /// whether it is fully in effect.
    ///
    /// # Errors
    ///
    /// See [`Engine::sync`].
    pub fn query<'a>(&self, rules: &'a [Rule]) -> Result<Vec<RuleStatus<'a>>> {
        let plan = self.sync(rules, false)?;
        Ok(plan
            .statuses()
            .into_iter()
            .map(|(rule, in_effect)| RuleStatus { rule, in_effect })
            .collect())
    }

    /// # Errors
    ///
    /// See [`Engine::sync`].
    pub fn needs_update(&self, rules: &[Rule]) -> Result<bool> {
        let plan = self.sync(rules, false)?;
        debug!("Update needed: {}", plan.changes_needed);
        Ok(plan.changes_needed)
    }

    /// Append command lines for every rule, IPv4 rules first. Expired rules
    /// are commented out with `# `.
    pub fn readable(&self, rules: &[Rule]) -> Vec<String> {
        let now = Utc::now();
        let mut lines = Vec::new();
        for version in IpVersion::iter() {
            for rule in rules.iter().filter(|r| r.family() == version) {
                let prefix = if rule.has_expired_at(now) { "# " } else { "" };
                for (protocol, port) in rule.service().enumerate() {
                    let invocation =
                        self.tools
                            .append(version, protocol, port, rule.source(), rule.comment());
                    lines.push(format!("{prefix}{invocation}"));
                }
            }
        }
        lines
    }
}
