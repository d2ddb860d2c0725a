//! Diff of desired rules against the live chains
//!
//! Everything here is pure: the caller supplies both chain snapshots and the
//! reference time, and gets back a [`SyncPlan`] describing what matches, what
//! has to go and what has to be added. Turning the plan into tool invocations
//! is the engine's job.
//!
//! A desired rule expands into one live rule per (protocol, port) pair of its
//! service. Each live rule consumes one pair of the first desired rule that
//! matches it and still has that pair open, so a duplicated live entry is
//! removed while all entries of a multi-port service match.

use crate::core::chain::LiveRule;
use crate::core::error::{Error, Result};
use crate::core::rule::Rule;
use crate::core::service::{IpVersion, Protocol};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// A live rule accounted for by a desired rule
#[derive(Debug, Clone)]
pub struct MatchedRule<'a> {
    pub live: LiveRule,
    /// Index into the desired rules
    pub index: usize,
    pub rule: &'a Rule,
}

/// A desired rule with pairs missing from its chain
#[derive(Debug, Clone)]
pub struct PendingRule<'a> {
    /// Index into the desired rules
    pub index: usize,
    pub rule: &'a Rule,
    /// Pairs to append, in service enumeration order
    pub missing: Vec<(Protocol, u16)>,
}

/// A desired rule left out of a forced plan
#[derive(Debug)]
pub struct SkippedRule<'a> {
    pub rule: &'a Rule,
    pub reason: Error,
}

/// Diff result for one IP version
#[derive(Debug, Clone, Default)]
pub struct FamilyPlan<'a> {
    pub matched: Vec<MatchedRule<'a>>,
    pub to_remove: Vec<LiveRule>,
    pub to_add: Vec<PendingRule<'a>>,
}

impl FamilyPlan<'_> {
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SyncPlan<'a> {
    pub v4: FamilyPlan<'a>,
    pub v6: FamilyPlan<'a>,
    pub changes_needed: bool,
    /// Chains are flushed and rebuilt from scratch
    pub forced: bool,
    pub skipped: Vec<SkippedRule<'a>>,
}

impl<'a> SyncPlan<'a> {
    pub fn family(&self, version: IpVersion) -> &FamilyPlan<'a> {
        match version {
            IpVersion::V4 => &self.v4,
            IpVersion::V6 => &self.v6,
        }
    }

    fn family_mut(&mut self, version: IpVersion) -> &mut FamilyPlan<'a> {
        match version {
            IpVersion::V4 => &mut self.v4,
            IpVersion::V6 => &mut self.v6,
        }
    }

    /// Every matched or pending desired rule with whether it is fully in
    /// effect, in desired order.
    pub fn statuses(&self) -> Vec<(&'a Rule, bool)> {
        let mut entries: Vec<(usize, &'a Rule, bool)> = Vec::new();
        for family in [&self.v4, &self.v6] {
            for pending in &family.to_add {
                entries.push((pending.index, pending.rule, false));
            }
        }
        for family in [&self.v4, &self.v6] {
            for matched in &family.matched {
                if !entries.iter().any(|(idx, _, _)| *idx == matched.index) {
                    entries.push((matched.index, matched.rule, true));
                }
            }
        }
        entries.sort_by_key(|(idx, _, _)| *idx);
        entries
            .into_iter()
            .map(|(_, rule, in_effect)| (rule, in_effect))
            .collect()
    }
}

/// Computes the changes needed to bring both chains in line with `desired`.
///
/// Expired rules (relative to `now`) are ignored, so their live entries are
/// removed.
///
/// # Errors
///
/// - [`Error::InvalidComment`] if any non-expired rule has an unusable comment
/// - [`Error::NetworkTooLarge`] if a rule that needs adding exceeds its limits
pub fn diff<'a>(
    desired: &'a [Rule],
    live_v4: Vec<LiveRule>,
    live_v6: Vec<LiveRule>,
    now: DateTime<Utc>,
) -> Result<SyncPlan<'a>> {
    // Open pairs per desired rule; None for expired rules
    let mut open: Vec<Option<Vec<(Protocol, u16)>>> = Vec::with_capacity(desired.len());
    for rule in desired {
        if rule.has_expired_at(now) {
            open.push(None);
            continue;
        }
        rule.validate_comment()?;
        open.push(Some(rule.service().enumerate().collect()));
    }
    let active = open.iter().filter(|o| o.is_some()).count();

    let mut plan = SyncPlan::default();

    for (version, live_rules) in [(IpVersion::V4, live_v4), (IpVersion::V6, live_v6)] {
        let family = plan.family_mut(version);
        for live in live_rules {
            let pair = (live.protocol, live.port);
            let found = desired.iter().enumerate().find(|(idx, rule)| {
                open[*idx].as_ref().is_some_and(|pairs| pairs.contains(&pair))
                    && rule.matches(&live.service, &live.source, live.comment.as_deref())
            });

            match found {
                Some((index, rule)) => {
                    if let Some(pairs) = open[index].as_mut() {
                        pairs.retain(|p| *p != pair);
                    }
                    family.matched.push(MatchedRule { live, index, rule });
                }
                None => {
                    debug!("Active {live} not found in desired rules");
                    family.to_remove.push(live);
                }
            }
        }
    }

    for (index, (rule, pairs)) in desired.iter().zip(open).enumerate() {
        let Some(missing) = pairs.filter(|p| !p.is_empty()) else {
            continue;
        };
        rule.network_size_valid(true)?;
        plan.family_mut(rule.family()).to_add.push(PendingRule {
            index,
            rule,
            missing,
        });
    }

    plan.changes_needed = !plan.v4.is_empty() || !plan.v6.is_empty();

    debug!(
        "Out of {active} rules, {} need to be added. {} active rules to remove.",
        plan.v4.to_add.len() + plan.v6.to_add.len(),
        plan.v4.to_remove.len() + plan.v6.to_remove.len()
    );

    Ok(plan)
}

/// Plans a full rebuild: every valid, non-expired rule with all its pairs.
///
/// Rules failing the comment or network size check are skipped with a
/// warning instead of failing the plan.
pub fn forced(desired: &[Rule], now: DateTime<Utc>) -> SyncPlan<'_> {
    let mut plan = SyncPlan {
        changes_needed: true,
        forced: true,
        ..SyncPlan::default()
    };

    for (index, rule) in desired.iter().enumerate() {
        if rule.has_expired_at(now) {
            continue;
        }

        let check = rule
            .validate_comment()
            .and_then(|()| rule.network_size_valid(true).map(|_| ()));
        if let Err(reason) = check {
            warn!("Skipping rule '{rule}': {reason}");
            plan.skipped.push(SkippedRule { rule, reason });
            continue;
        }

        plan.family_mut(rule.family()).to_add.push(PendingRule {
            index,
            rule,
            missing: rule.service().enumerate().collect(),
        });
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::SourceAddress;
    use crate::core::service::Service;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn ssh() -> Service {
        Service::new("ssh", "SSH", vec![(Protocol::Tcp, vec![22])]).unwrap()
    }

    fn web() -> Service {
        Service::new(
            "web",
            "Web",
            vec![(Protocol::Tcp, vec![80, 443]), (Protocol::Udp, vec![443])],
        )
        .unwrap()
    }

    fn live(position: u32, service: &Service, protocol: Protocol, port: u16, source: &str) -> LiveRule {
        LiveRule {
            position,
            protocol,
            port,
            service: service.clone(),
            source: SourceAddress::parse(source).unwrap(),
            comment: None,
        }
    }

    #[test]
    fn test_empty_chain_adds_everything() {
        let desired = vec![
            Rule::user("alice", ssh(), "192.0.2.10/32", None, None).unwrap(),
            Rule::shared(ssh(), "2001:db8::1", None, None).unwrap(),
        ];
        let plan = diff(&desired, vec![], vec![], now()).unwrap();
        assert!(plan.changes_needed);
        assert_eq!(plan.v4.to_add.len(), 1);
        assert_eq!(plan.v6.to_add.len(), 1);
        assert_eq!(plan.v4.to_add[0].missing, vec![(Protocol::Tcp, 22)]);
    }

    #[test]
    fn test_exact_match_needs_no_changes() {
        let desired = vec![Rule::user("alice", ssh(), "192.0.2.10", None, None).unwrap()];
        let live_v4 = vec![live(1, &ssh(), Protocol::Tcp, 22, "192.0.2.10")];
        let plan = diff(&desired, live_v4, vec![], now()).unwrap();
        assert!(!plan.changes_needed);
        assert_eq!(plan.v4.matched.len(), 1);
        assert_eq!(plan.statuses(), vec![(&desired[0], true)]);
    }

    #[test]
    fn test_multi_port_service_matches_every_entry() {
        let desired = vec![Rule::user("alice", web(), "192.0.2.10", None, None).unwrap()];
        let live_v4 = vec![
            live(1, &web(), Protocol::Tcp, 80, "192.0.2.10"),
            live(2, &web(), Protocol::Tcp, 443, "192.0.2.10"),
            live(3, &web(), Protocol::Udp, 443, "192.0.2.10"),
        ];
        let plan = diff(&desired, live_v4, vec![], now()).unwrap();
        assert!(!plan.changes_needed);
        assert_eq!(plan.v4.matched.len(), 3);
    }

    #[test]
    fn test_partial_service_adds_only_missing_pairs() {
        let desired = vec![Rule::user("alice", web(), "192.0.2.10", None, None).unwrap()];
        let live_v4 = vec![live(1, &web(), Protocol::Tcp, 443, "192.0.2.10")];
        let plan = diff(&desired, live_v4, vec![], now()).unwrap();
        assert!(plan.changes_needed);
        assert_eq!(
            plan.v4.to_add[0].missing,
            vec![(Protocol::Tcp, 80), (Protocol::Udp, 443)]
        );
        assert_eq!(plan.statuses(), vec![(&desired[0], false)]);
    }

    #[test]
    fn test_duplicate_live_entry_is_removed() {
        let desired = vec![Rule::user("alice", ssh(), "192.0.2.10", None, None).unwrap()];
        let live_v4 = vec![
            live(1, &ssh(), Protocol::Tcp, 22, "192.0.2.10"),
            live(2, &ssh(), Protocol::Tcp, 22, "192.0.2.10"),
        ];
        let plan = diff(&desired, live_v4, vec![], now()).unwrap();
        assert!(plan.changes_needed);
        assert_eq!(plan.v4.to_remove.len(), 1);
        assert_eq!(plan.v4.to_remove[0].position, 2);
        assert!(plan.v4.to_add.is_empty());
    }

    #[test]
    fn test_expired_rule_is_removed_not_added() {
        let expired = Rule::user(
            "alice",
            ssh(),
            "192.0.2.10",
            Some(now() - Duration::minutes(5)),
            None,
        )
        .unwrap();
        let desired = vec![expired];
        let live_v4 = vec![live(1, &ssh(), Protocol::Tcp, 22, "192.0.2.10")];
        let plan = diff(&desired, live_v4, vec![], now()).unwrap();
        assert!(plan.changes_needed);
        assert_eq!(plan.v4.to_remove.len(), 1);
        assert!(plan.v4.to_add.is_empty());
        assert!(plan.statuses().is_empty());
    }

    #[test]
    fn test_comment_mismatch_replaces_rule() {
        let desired = vec![Rule::user("alice", ssh(), "192.0.2.10", None, Some("home")).unwrap()];
        let mut stale = live(1, &ssh(), Protocol::Tcp, 22, "192.0.2.10");
        stale.comment = Some("old".to_string());
        let plan = diff(&desired, vec![stale], vec![], now()).unwrap();
        assert_eq!(plan.v4.to_remove.len(), 1);
        assert_eq!(plan.v4.to_add.len(), 1);
    }

    #[test]
    fn test_oversized_network_is_fatal() {
        let desired = vec![Rule::user("alice", ssh(), "10.0.0.0/8", None, None).unwrap()];
        let result = diff(&desired, vec![], vec![], now());
        assert!(matches!(result, Err(Error::NetworkTooLarge { .. })));
    }

    #[test]
    fn test_invalid_comment_is_fatal_even_when_matched() {
        let long = "c".repeat(300);
        let desired = vec![Rule::user("alice", ssh(), "192.0.2.10", None, Some(&long)).unwrap()];
        let result = diff(&desired, vec![], vec![], now());
        assert!(matches!(result, Err(Error::InvalidComment(_))));
    }

    #[test]
    fn test_forced_skips_violations() {
        let desired = vec![
            Rule::user("alice", ssh(), "10.0.0.0/8", None, None).unwrap(),
            Rule::user("alice", web(), "192.0.2.10", None, None).unwrap(),
            Rule::user(
                "bob",
                ssh(),
                "192.0.2.20",
                Some(now() - Duration::days(1)),
                None,
            )
            .unwrap(),
        ];
        let plan = forced(&desired, now());
        assert!(plan.changes_needed);
        assert!(plan.forced);
        assert_eq!(plan.skipped.len(), 1);
        assert!(matches!(plan.skipped[0].reason, Error::NetworkTooLarge { .. }));
        assert_eq!(plan.v4.to_add.len(), 1);
        assert_eq!(plan.v4.to_add[0].missing.len(), 3);
    }

    #[test]
    fn test_statuses_follow_desired_order() {
        let desired = vec![
            Rule::shared(ssh(), "2001:db8::1", None, None).unwrap(),
            Rule::user("alice", ssh(), "192.0.2.10", None, None).unwrap(),
        ];
        let live_v6 = vec![live(1, &ssh(), Protocol::Tcp, 22, "2001:db8::1")];
        let plan = diff(&desired, vec![], live_v6, now()).unwrap();
        assert_eq!(
            plan.statuses(),
            vec![(&desired[0], true), (&desired[1], false)]
        );
    }
}
