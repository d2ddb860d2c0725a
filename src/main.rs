//! chainwarden - per-user access rules for an iptables chain
//!
//! Reads a desired-state document (services and rules) and keeps the
//! configured iptables/ip6tables chain in line with it.
//!
//! # Usage
//!
//! ```bash
//! chainwarden --rules rules.json status            # Is the chain in sync?
//! chainwarden --rules rules.json simulate          # Commands apply would run
//! chainwarden --rules rules.json apply             # Make the chain match
//! chainwarden --rules rules.json apply --force     # Flush and rebuild
//! chainwarden --rules rules.json query --owner alice
//! chainwarden --rules rules.json readable          # All rules as iptables commands
//! chainwarden --rules rules.json live              # Managed rules in the chain
//! chainwarden --rules rules.json services          # Known services
//!
//! # Editing the document, rules are addressed by their hash (see `query`)
//! chainwarden --rules rules.json add --owner alice --service ssh --source 192.0.2.10
//! chainwarden --rules rules.json update <HASH> --expires 2026-12-31T23:59:59
//! chainwarden --rules rules.json delete <HASH>
//! ```
//!
//! Logging goes to stderr; use `--log-level debug` or `RUST_LOG` to see every
//! executed command.

use chainwarden::config::load_config;
use chainwarden::core::desired::{DesiredState, format_expiry, parse_expiry};
use chainwarden::core::error::IptablesErrorPattern;
use chainwarden::core::rule::NetworkLimits;
use chainwarden::core::ruleset::{RuleChange, RuleSet};
use chainwarden::{Engine, Error, Owner, Rule, Service, ServiceCatalog, SystemRunner};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chainwarden")]
#[command(about = "Reconciles per-user access rules against an iptables chain", long_about = None)]
struct Cli {
    /// Engine configuration (default: ~/.config/chainwarden/config.json)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Desired-state document with services and rules
    #[arg(short, long, value_name = "FILE", global = true)]
    rules: Option<PathBuf>,

    /// Log filter, e.g. `info` or `chainwarden=debug` (overrides RUST_LOG)
    #[arg(long, value_name = "FILTER", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether the chain matches the desired rules
    Status,
    /// Print the commands apply would run
    Simulate {
        /// Flush both chains and re-add every rule
        #[arg(short, long)]
        force: bool,
    },
    /// Make the chain match the desired rules
    Apply {
        /// Flush both chains and re-add every rule
        #[arg(short, long)]
        force: bool,
    },
    /// Show desired rules with their hash and whether each is in effect
    Query {
        /// Only rules visible to this user (their own and shared ones)
        #[arg(short, long, value_name = "USER")]
        owner: Option<String>,
    },
    /// Print every rule as iptables commands, expired ones commented out
    Readable,
    /// List the managed rules currently in the chain
    Live,
    /// List the services rules can refer to
    Services,
    /// Add a rule to the document
    Add {
        /// Owning user; the rule is shared when omitted
        #[arg(short, long, value_name = "USER")]
        owner: Option<String>,
        #[command(flatten)]
        fields: RuleFields,
    },
    /// Change a rule in the document; omitted fields keep their value
    Update {
        /// Content hash of the rule
        hash: String,
        #[command(flatten)]
        fields: RuleFields,
    },
    /// Remove a rule from the document
    Delete {
        /// Content hash of the rule
        hash: String,
    },
}

#[derive(Args)]
struct RuleFields {
    /// Service code
    #[arg(short, long, value_name = "CODE")]
    service: Option<String>,
    /// Source address or network
    #[arg(long, value_name = "ADDR")]
    source: Option<String>,
    /// Expiry in UTC (%Y-%m-%dT%H:%M:%S), or `never`
    #[arg(short, long, value_name = "WHEN")]
    expires: Option<String>,
    /// Comment stored with the rule in the chain; empty to clear
    #[arg(long, value_name = "TEXT")]
    comment: Option<String>,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match handle_cli(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(stderr) = e.tool_stderr() {
                let translation = IptablesErrorPattern::match_error(stderr);
                eprintln!("{}", translation.user_message);
                for suggestion in &translation.suggestions {
                    eprintln!("  - {suggestion}");
                }
                if let Some(url) = &translation.help_url {
                    eprintln!("  See: {url}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn handle_cli(cli: &Cli) -> Result<(), Error> {
    let config = load_config(cli.config.as_deref())?;
    let limits = config.limits()?;

    let rules_path = cli
        .rules
        .as_deref()
        .ok_or_else(|| Error::Config("no desired-state document given, use --rules FILE".into()))?;
    let state = DesiredState::load(rules_path)?;
    let (catalog, rules) = state.resolve(limits)?;

    match &cli.command {
        Commands::Services => {
            for service in catalog.iter() {
                println!("{:<12} {service}", service.code());
            }
            return Ok(());
        }
        Commands::Add { owner, fields } => {
            let owner = owner.clone().map_or(Owner::Shared, Owner::User);
            return edit_rules(rules_path, state, rules, limits, |set| {
                let service = lookup_service(&catalog, fields.service.as_deref())?;
                let source = fields
                    .source
                    .as_deref()
                    .ok_or_else(|| Error::Config("--source is required".into()))?;
                let expiry = fields.expires.as_deref().map(parse_expiry_arg).transpose()?;
                set.upsert(
                    None,
                    RuleChange {
                        owner,
                        service,
                        source,
                        expiry: expiry.flatten(),
                        comment: fields.comment.as_deref(),
                    },
                )
            });
        }
        Commands::Update { hash, fields } => {
            return edit_rules(rules_path, state, rules, limits, |set| {
                let idx = set
                    .find_by_hash(hash)
                    .ok_or_else(|| Error::RuleNotFound(hash.clone()))?;
                let current = &set.rules()[idx];
                let service = match fields.service.as_deref() {
                    Some(code) => lookup_service(&catalog, Some(code))?,
                    None => current.service().clone(),
                };
                let source = fields
                    .source
                    .clone()
                    .unwrap_or_else(|| current.source().to_string());
                let expiry = match fields.expires.as_deref() {
                    Some(text) => parse_expiry_arg(text)?,
                    None => current.expiry(),
                };
                let comment = fields
                    .comment
                    .clone()
                    .or_else(|| current.comment().map(str::to_string));
                let owner = current.owner().clone();
                set.upsert(
                    Some(hash.as_str()),
                    RuleChange {
                        owner,
                        service,
                        source: &source,
                        expiry,
                        comment: comment.as_deref(),
                    },
                )
            });
        }
        Commands::Delete { hash } => {
            return edit_rules(rules_path, state, rules, limits, |set| {
                let removed = set.remove_by_hash(hash)?;
                println!("Removed: {removed}");
                Ok(String::new())
            });
        }
        _ => {}
    }

    let engine = Engine::new(config.tools()?, catalog, SystemRunner);

    match &cli.command {
        Commands::Status => {
            let chain = engine.tools().chain();
            if engine.needs_update(&rules)? {
                println!("Chain {chain} is out of sync, run 'apply' to update it.");
            } else {
                println!("Chain {chain} is up to date ({} rules).", rules.len());
            }
        }
        Commands::Simulate { force } => match engine.simulate(&rules, *force)? {
            Some(lines) => {
                for line in lines {
                    println!("{line}");
                }
            }
            None => println!("No changes needed."),
        },
        Commands::Apply { force } => {
            let report = engine.set(&rules, *force)?;
            for skipped in &report.skipped {
                eprintln!("Skipped {skipped}");
            }
            if report.is_empty() {
                println!("No changes needed.");
            } else {
                for op in &report.applied {
                    println!("✓ {op}");
                }
                println!("✓ {} changes applied.", report.applied.len());
            }
        }
        Commands::Query { owner } => {
            let visible: Vec<Rule> = match owner {
                Some(user) => RuleSet::from_rules(rules.clone(), limits)
                    .for_owner(user)
                    .cloned()
                    .collect(),
                None => rules.clone(),
            };
            for status in engine.query(&visible)? {
                let marker = if status.in_effect { "active " } else { "pending" };
                let expiry = status
                    .rule
                    .expiry()
                    .map_or_else(|| "never".to_string(), format_expiry);
                println!("[{marker}] {}", status.rule.content_hash());
                println!("          {} (expires {expiry})", status.rule);
            }
        }
        Commands::Readable => {
            for line in engine.readable(&rules) {
                println!("{line}");
            }
        }
        Commands::Live => {
            for live in engine.live_rules()? {
                println!("{live}");
            }
        }
        Commands::Services | Commands::Add { .. } | Commands::Update { .. } | Commands::Delete { .. } => {}
    }
    Ok(())
}

/// Applies `edit` to the document's rules and writes the document back.
fn edit_rules(
    path: &Path,
    mut state: DesiredState,
    rules: Vec<Rule>,
    limits: NetworkLimits,
    edit: impl FnOnce(&mut RuleSet) -> Result<String, Error>,
) -> Result<(), Error> {
    let mut set = RuleSet::from_rules(rules, limits);
    let hash = edit(&mut set)?;
    state.set_rules(set.into_rules());
    state.save(path)?;
    if !hash.is_empty() {
        println!("{hash}");
    }
    Ok(())
}

fn lookup_service(catalog: &ServiceCatalog, code: Option<&str>) -> Result<Service, Error> {
    let code = code.ok_or_else(|| Error::Config("--service is required".into()))?;
    catalog
        .get(code)
        .cloned()
        .ok_or_else(|| Error::UnknownService(code.to_string()))
}

/// `never` clears the expiry
fn parse_expiry_arg(text: &str) -> Result<Option<DateTime<Utc>>, Error> {
    if text.eq_ignore_ascii_case("never") {
        Ok(None)
    } else {
        parse_expiry(text).map(Some)
    }
}
