//! Privilege elevation for firewall tool invocations
//!
//! iptables needs `CAP_NET_ADMIN`. chainwarden can run unprivileged and wrap
//! each `iptables`/`ip6tables` call in an elevation helper:
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Fallback**: `sudo`, non-interactive (`-n`) when stdin is not a terminal
//!
//! # Environment Variables
//!
//! - `CHAINWARDEN_ELEVATION_METHOD`: Force a method (`sudo`, `run0`, or `none`).
//!   Useful for sudoers NOPASSWD setups.
//!   Example: `CHAINWARDEN_ELEVATION_METHOD=sudo chainwarden apply`
//!
//! - `CHAINWARDEN_TEST_NO_ELEVATION`: Bypass elevation entirely (testing only).
//!
//! Arguments are passed as an argv vector; no shell is involved.

use std::path::Path;
use std::process::Command;

pub const ELEVATION_METHOD_VAR: &str = "CHAINWARDEN_ELEVATION_METHOD";
pub const TEST_NO_ELEVATION_VAR: &str = "CHAINWARDEN_TEST_NO_ELEVATION";

/// Error type for privilege elevation
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Neither run0 nor sudo is installed
    #[error("No elevation helper found - install sudo or run as root")]
    NoHelperAvailable,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `CHAINWARDEN_ELEVATION_METHOD`
    #[error("Invalid CHAINWARDEN_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, none")]
    InvalidMethod(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Sudo,
    Run0,
    None,
}

fn requested_method() -> Result<Option<Method>, ElevationError> {
    let Ok(raw) = std::env::var(ELEVATION_METHOD_VAR) else {
        return Ok(None);
    };
    let method = raw.trim().to_lowercase();
    match method.as_str() {
        "" => Ok(None),
        "sudo" => Ok(Some(Method::Sudo)),
        "run0" => Ok(Some(Method::Run0)),
        "none" => Ok(Some(Method::None)),
        _ => Err(ElevationError::InvalidMethod(raw)),
    }
}

fn wrapped(helper: &str, helper_args: &[&str], program: &Path, args: &[String]) -> Command {
    let mut cmd = Command::new(helper);
    cmd.args(helper_args).arg(program).args(args);
    cmd
}

fn direct(program: &Path, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Builds a command running `program` with root privileges.
///
/// Order of precedence:
/// 1. `CHAINWARDEN_TEST_NO_ELEVATION` set: run directly
/// 2. `CHAINWARDEN_ELEVATION_METHOD` set: use that method (validated even as root)
/// 3. Already root: run directly
/// 4. `run0` if installed, else `sudo`
///
/// # Errors
///
/// Returns `ElevationError` if the requested method is unknown or its binary
/// is missing, or if no helper is installed at all.
pub fn elevated_command(program: &Path, args: &[String]) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    if std::env::var_os(TEST_NO_ELEVATION_VAR).is_some() {
        return Ok(direct(program, args));
    }

    let requested = requested_method()?;

    if nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    match requested {
        Some(Method::None) => return Ok(direct(program, args)),
        Some(Method::Sudo) => {
            if !crate::utils::binary_exists("sudo") {
                return Err(ElevationError::MethodNotAvailable("sudo".into()));
            }
            return Ok(wrapped("sudo", &[], program, args));
        }
        Some(Method::Run0) => {
            if !crate::utils::binary_exists("run0") {
                return Err(ElevationError::MethodNotAvailable("run0".into()));
            }
            return Ok(wrapped("run0", &[], program, args));
        }
        None => {}
    }

    if crate::utils::binary_exists("run0") {
        return Ok(wrapped("run0", &[], program, args));
    }

    if !crate::utils::binary_exists("sudo") {
        return Err(ElevationError::NoHelperAvailable);
    }

    // Without a terminal sudo cannot prompt; fail fast instead of hanging
    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        Ok(wrapped("sudo", &[], program, args))
    } else {
        Ok(wrapped("sudo", &["-n"], program, args))
    }
}
