//! iptables / ip6tables invocations
//!
//! [`IptablesTools`] renders the four verbs the engine needs (list, append,
//! delete by position, flush) as [`Invocation`]s. A [`CommandRunner`] executes
//! them; [`SystemRunner`] spawns the real tools, blocking until they exit.

use crate::core::error::{Error, Result};
use crate::core::rule::SourceAddress;
use crate::core::service::{IpVersion, Protocol};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One tool invocation, as an argv vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub version: IpVersion,
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Quotes `arg` for a POSIX shell when it contains whitespace or quotes.
fn shell_quote(arg: &str) -> Cow<'_, str> {
    let needs_quoting = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\'));
    if needs_quoting {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    } else {
        Cow::Borrowed(arg)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program.to_string_lossy()))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Captured result of a finished tool process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes tool invocations. Every call blocks until the process exits.
pub trait CommandRunner {
    /// Runs the invocation once.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be started; a
    /// non-zero exit is reported through [`CommandOutput::exit_code`].
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        (**self).run(invocation)
    }
}

/// Runs the real tools, elevating privileges when needed
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let output = crate::elevation::elevated_command(&invocation.program, &invocation.args)?
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolNotFound(invocation.program.display().to_string())
                } else {
                    Error::Io(e)
                }
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs `invocation` and returns its stdout.
///
/// # Errors
///
/// Returns [`Error::Tool`] with the exit code and stderr on a non-zero exit,
/// or the runner's own error if the process could not be started.
pub fn run_checked<R: CommandRunner + ?Sized>(runner: &R, invocation: &Invocation) -> Result<String> {
    debug!("Executing: '{invocation}'");
    let output = runner.run(invocation)?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(Error::Tool {
            command: invocation.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }
}

/// Renders invocations against the managed chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesTools {
    chain: String,
    iptables: PathBuf,
    ip6tables: PathBuf,
    stateful: bool,
}

impl IptablesTools {
    /// # Errors
    ///
    /// Returns [`Error::InvalidChainName`] if iptables would reject `chain`.
    pub fn new(
        chain: impl Into<String>,
        iptables: impl Into<PathBuf>,
        ip6tables: impl Into<PathBuf>,
        stateful: bool,
    ) -> Result<Self> {
        let chain = chain.into();
        crate::validators::validate_chain_name(&chain).map_err(|message| {
            Error::InvalidChainName {
                name: chain.clone(),
                message,
            }
        })?;
        Ok(Self {
            chain,
            iptables: iptables.into(),
            ip6tables: ip6tables.into(),
            stateful,
        })
    }

    /// Locates `iptables` and `ip6tables` in `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ToolNotFound`] if either tool is missing, or
    /// [`Error::InvalidChainName`] for a bad chain name.
    pub fn discover(chain: impl Into<String>, stateful: bool) -> Result<Self> {
        let iptables = crate::utils::find_binary("iptables")
            .ok_or_else(|| Error::ToolNotFound("iptables".to_string()))?;
        let ip6tables = crate::utils::find_binary("ip6tables")
            .ok_or_else(|| Error::ToolNotFound("ip6tables".to_string()))?;
        Self::new(chain, iptables, ip6tables, stateful)
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn stateful(&self) -> bool {
        self.stateful
    }

    pub fn program(&self, version: IpVersion) -> &Path {
        match version {
            IpVersion::V4 => &self.iptables,
            IpVersion::V6 => &self.ip6tables,
        }
    }

    fn invocation(&self, version: IpVersion, args: Vec<String>) -> Invocation {
        Invocation {
            version,
            program: self.program(version).to_path_buf(),
            args,
        }
    }

    /// `<tool> -n --line-numbers -L <chain>`
    pub fn list(&self, version: IpVersion) -> Invocation {
        let args = ["-n", "--line-numbers", "-L", self.chain.as_str()]
            .map(str::to_string)
            .to_vec();
        self.invocation(version, args)
    }

    /// `<tool> -A <chain> -p <proto> -m <proto> --source <addr> --dport <port>
    /// [-m state --state NEW] [-m comment --comment <text>] -j ACCEPT`
    pub fn append(
        &self,
        version: IpVersion,
        protocol: Protocol,
        port: u16,
        source: &SourceAddress,
        comment: Option<&str>,
    ) -> Invocation {
        let mut args: Vec<String> = vec![
            "-A".into(),
            self.chain.clone(),
            "-p".into(),
            protocol.as_str().into(),
            "-m".into(),
            protocol.as_str().into(),
            "--source".into(),
            source.to_string(),
            "--dport".into(),
            port.to_string(),
        ];
        if self.stateful {
            args.extend(["-m", "state", "--state", "NEW"].map(String::from));
        }
        if let Some(comment) = comment {
            args.extend(["-m", "comment", "--comment"].map(String::from));
            args.push(comment.to_string());
        }
        args.extend(["-j", "ACCEPT"].map(String::from));
        self.invocation(version, args)
    }

    /// `<tool> -D <chain> <position>`
    pub fn delete(&self, version: IpVersion, position: u32) -> Invocation {
        let args = vec!["-D".to_string(), self.chain.clone(), position.to_string()];
        self.invocation(version, args)
    }

    /// `<tool> -F <chain>`
    pub fn flush(&self, version: IpVersion) -> Invocation {
        let args = vec!["-F".to_string(), self.chain.clone()];
        self.invocation(version, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools(stateful: bool) -> IptablesTools {
        IptablesTools::new("USER_ACCESS", "/usr/sbin/iptables", "/usr/sbin/ip6tables", stateful)
            .unwrap()
    }

    struct Canned(CommandOutput);

    impl CommandRunner for Canned {
        fn run(&self, _invocation: &Invocation) -> Result<CommandOutput> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_list_invocation() {
        let inv = tools(false).list(IpVersion::V6);
        assert_eq!(
            inv.to_string(),
            "/usr/sbin/ip6tables -n --line-numbers -L USER_ACCESS"
        );
    }

    #[test]
    fn test_append_invocation() {
        let source = SourceAddress::parse("192.0.2.10/32").unwrap();
        let inv = tools(false).append(IpVersion::V4, Protocol::Tcp, 22, &source, None);
        assert_eq!(
            inv.to_string(),
            "/usr/sbin/iptables -A USER_ACCESS -p tcp -m tcp --source 192.0.2.10/32 --dport 22 -j ACCEPT"
        );
    }

    #[test]
    fn test_append_stateful_with_comment() {
        let source = SourceAddress::parse("2001:db8::/48").unwrap();
        let inv = tools(true).append(
            IpVersion::V6,
            Protocol::Udp,
            53,
            &source,
            Some("it's dns"),
        );
        assert_eq!(
            inv.to_string(),
            "/usr/sbin/ip6tables -A USER_ACCESS -p udp -m udp --source 2001:db8::/48 --dport 53 \
             -m state --state NEW -m comment --comment 'it'\\''s dns' -j ACCEPT"
        );
        // The argv itself is never quoted
        assert!(inv.args.contains(&"it's dns".to_string()));
    }

    #[test]
    fn test_delete_and_flush() {
        assert_eq!(
            tools(false).delete(IpVersion::V4, 5).args,
            vec!["-D", "USER_ACCESS", "5"]
        );
        assert_eq!(tools(false).flush(IpVersion::V6).args, vec!["-F", "USER_ACCESS"]);
    }

    #[test]
    fn test_invalid_chain_name() {
        let result = IptablesTools::new("-X", "iptables", "ip6tables", false);
        assert!(matches!(result, Err(Error::InvalidChainName { .. })));
    }

    #[test]
    fn test_run_checked_reports_tool_failure() {
        let runner = Canned(CommandOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "iptables: No chain/target/match by that name.".to_string(),
        });
        let err = run_checked(&runner, &tools(false).flush(IpVersion::V4)).unwrap_err();
        match err {
            Error::Tool {
                command,
                exit_code,
                stderr,
            } => {
                assert_eq!(command, "/usr/sbin/iptables -F USER_ACCESS");
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("No chain"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_run_checked_returns_stdout() {
        let runner = Canned(CommandOutput {
            exit_code: Some(0),
            stdout: "Chain USER_ACCESS".to_string(),
            stderr: String::new(),
        });
        let out = run_checked(&runner, &tools(false).list(IpVersion::V4)).unwrap();
        assert_eq!(out, "Chain USER_ACCESS");
    }
}
