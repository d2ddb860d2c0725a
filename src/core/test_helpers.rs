//! Shared test utilities for core module tests
//!
//! Provides an in-memory stand-in for iptables/ip6tables and common builders.
//! This module is only compiled in test mode.

use crate::core::engine::Engine;
use crate::core::error::Result;
use crate::core::iptables::{CommandOutput, CommandRunner, Invocation, IptablesTools};
use crate::core::rule::SourceAddress;
use crate::core::service::{IpVersion, Protocol, Service, ServiceCatalog};
use std::cell::RefCell;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::remove_var("CHAINWARDEN_TEST_NO_ELEVATION");
///     std::env::set_var("CHAINWARDEN_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("CHAINWARDEN_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

pub const TEST_CHAIN: &str = "USER_ACCESS";

/// One row of a fake chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeEntry {
    pub target: String,
    pub protocol: String,
    pub source: String,
    pub port: u16,
    pub stateful: bool,
    pub comment: Option<String>,
}

impl FakeEntry {
    pub fn accept(protocol: Protocol, port: u16, source: &str) -> Self {
        Self {
            target: "ACCEPT".to_string(),
            protocol: protocol.as_str().to_string(),
            source: source.to_string(),
            port,
            stateful: false,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    fn render(&self, num: usize, version: IpVersion) -> String {
        let mut description = format!("{} dpt:{}", self.protocol, self.port);
        if self.stateful {
            description.push_str(" state NEW");
        }
        if let Some(comment) = &self.comment {
            description.push_str(&format!(" /* {comment} */"));
        }
        match version {
            IpVersion::V4 => format!(
                "{num:<4} {:<10} {:<4} --  {:<20} {:<20} {description}",
                self.target, self.protocol, self.source, "0.0.0.0/0"
            ),
            IpVersion::V6 => format!(
                "{num:<4} {:<10} {:<4}     {:<20} {:<20} {description}",
                self.target, self.protocol, self.source, "::/0"
            ),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    v4: Vec<FakeEntry>,
    v6: Vec<FakeEntry>,
    log: Vec<Invocation>,
    mutations: usize,
    fail_mutation: Option<usize>,
}

impl FakeState {
    fn entries(&mut self, version: IpVersion) -> &mut Vec<FakeEntry> {
        match version {
            IpVersion::V4 => &mut self.v4,
            IpVersion::V6 => &mut self.v6,
        }
    }
}

/// In-memory iptables/ip6tables understanding `-L`, `-A`, `-D` and `-F`
/// on a single chain
#[derive(Debug)]
pub struct FakeIptables {
    chain: String,
    state: RefCell<FakeState>,
}

fn ok(stdout: String) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout,
        stderr: String::new(),
    }
}

fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl FakeIptables {
    pub fn new() -> Self {
        Self {
            chain: TEST_CHAIN.to_string(),
            state: RefCell::new(FakeState::default()),
        }
    }

    pub fn push(&self, version: IpVersion, entry: FakeEntry) {
        self.state.borrow_mut().entries(version).push(entry);
    }

    pub fn entries(&self, version: IpVersion) -> Vec<FakeEntry> {
        self.state.borrow_mut().entries(version).clone()
    }

    /// Makes the mutating call with this 0-based index fail
    pub fn fail_mutation(&self, index: usize) {
        self.state.borrow_mut().fail_mutation = Some(index);
    }

    /// Every invocation seen so far, rendered
    pub fn log(&self) -> Vec<String> {
        self.state.borrow().log.iter().map(ToString::to_string).collect()
    }

    /// Rendered invocations other than listings
    pub fn mutations(&self) -> Vec<String> {
        self.state
            .borrow()
            .log
            .iter()
            .filter(|inv| inv.args.first().is_some_and(|a| a != "-n"))
            .map(ToString::to_string)
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.borrow_mut().log.clear();
    }

    pub fn listing(&self, version: IpVersion) -> String {
        let mut state = self.state.borrow_mut();
        let entries = state.entries(version);
        let mut out = format!(
            "Chain {} (1 references)\nnum  target     prot opt source               destination\n",
            self.chain
        );
        for (idx, entry) in entries.iter().enumerate() {
            out.push_str(&entry.render(idx + 1, version));
            out.push('\n');
        }
        out
    }

    fn append(args: &[String]) -> Option<FakeEntry> {
        let mut entry = FakeEntry::accept(Protocol::Tcp, 0, "");
        let mut iter = args.iter().skip(2);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-p" => entry.protocol = iter.next()?.clone(),
                "--source" => {
                    // iptables lists single hosts without their prefix
                    let source = SourceAddress::parse(iter.next()?).ok()?;
                    let full = match source.family() {
                        IpVersion::V4 => 32,
                        IpVersion::V6 => 128,
                    };
                    entry.source = if source.prefix() == full {
                        source.network().ip().to_string()
                    } else {
                        source.network().to_string()
                    };
                }
                "--dport" => entry.port = iter.next()?.parse().ok()?,
                "--state" => entry.stateful = iter.next()? == "NEW",
                "--comment" => entry.comment = Some(iter.next()?.clone()),
                "-j" => entry.target = iter.next()?.clone(),
                "-m" => {
                    iter.next()?;
                }
                _ => return None,
            }
        }
        Some(entry)
    }
}

impl Default for FakeIptables {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for FakeIptables {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        self.state.borrow_mut().log.push(invocation.clone());

        let args = &invocation.args;
        let version = invocation.version;

        if args.len() == 4 && args[..3] == ["-n", "--line-numbers", "-L"] {
            if args[3] != self.chain {
                return Ok(failed("iptables: No chain/target/match by that name."));
            }
            return Ok(ok(self.listing(version)));
        }

        if args.get(1) != Some(&self.chain) {
            return Ok(failed("iptables: No chain/target/match by that name."));
        }

        let mut state = self.state.borrow_mut();
        let index = state.mutations;
        state.mutations += 1;
        if state.fail_mutation == Some(index) {
            return Ok(failed("iptables: Resource temporarily unavailable."));
        }

        match args[0].as_str() {
            "-A" => match Self::append(args) {
                Some(entry) => {
                    state.entries(version).push(entry);
                    Ok(ok(String::new()))
                }
                None => Ok(failed("iptables v1.8.10 (legacy): Bad argument")),
            },
            "-D" => {
                let position: usize = args.get(2).and_then(|p| p.parse().ok()).unwrap_or(0);
                let entries = state.entries(version);
                if position == 0 || position > entries.len() {
                    return Ok(failed("iptables: Index of deletion too big."));
                }
                entries.remove(position - 1);
                Ok(ok(String::new()))
            }
            "-F" => {
                state.entries(version).clear();
                Ok(ok(String::new()))
            }
            _ => Ok(failed("iptables: unknown option")),
        }
    }
}

pub fn ssh_service() -> Service {
    Service::new("ssh", "SSH", vec![(Protocol::Tcp, vec![22])]).unwrap()
}

pub fn web_service() -> Service {
    Service::new(
        "web",
        "Web",
        vec![(Protocol::Tcp, vec![80, 443]), (Protocol::Udp, vec![443])],
    )
    .unwrap()
}

pub fn test_catalog() -> ServiceCatalog {
    ServiceCatalog::new(vec![ssh_service(), web_service()]).unwrap()
}

pub fn test_tools(stateful: bool) -> IptablesTools {
    IptablesTools::new(TEST_CHAIN, "iptables", "ip6tables", stateful).unwrap()
}

/// Engine driving `fake` without configuring statefulness
pub fn test_engine(fake: &FakeIptables) -> Engine<&FakeIptables> {
    Engine::new(test_tools(false), test_catalog(), fake)
}
