use crate::core::service::IpVersion;
use thiserror::Error;

/// Core error types for chainwarden
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed (spawning a tool, reading a file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Service definition is not usable
    #[error("Invalid service definition '{code}': {message}")]
    ServiceDefinition { code: String, message: String },

    /// Rule refers to a service missing from the catalog
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// Source is neither an address nor a network
    #[error("Invalid IP address or network '{input}': {message}")]
    InvalidAddress { input: String, message: String },

    /// Comment cannot be carried by the comment match
    #[error("Invalid comment: {0}")]
    InvalidComment(String),

    /// Source network is larger than the configured floor allows
    #[error("Network {source_address} is too large: /{prefix} is below the IPv{family} limit of /{floor}")]
    NetworkTooLarge {
        source_address: String,
        family: u8,
        prefix: u8,
        floor: u8,
    },

    /// Network size limits are out of range for their family
    #[error("Invalid network size limit: {0}")]
    InvalidLimits(String),

    /// Chain name would be rejected by iptables
    #[error("Invalid chain name '{name}': {message}")]
    InvalidChainName { name: String, message: String },

    /// Owner name is not usable
    #[error("Invalid owner: {0}")]
    InvalidOwner(String),

    /// Expiry timestamp does not follow `%Y-%m-%dT%H:%M:%S`
    #[error("Invalid expiry '{0}', expected YYYY-MM-DDTHH:MM:SS (UTC)")]
    InvalidExpiry(String),

    /// No rule carries the requested content hash
    #[error("Rule with hash '{0}' not found")]
    RuleNotFound(String),

    /// Chain listing does not follow the expected layout
    #[error("{version} chain listing error at line {line}: {message}")]
    Format {
        version: IpVersion,
        line: usize,
        message: String,
    },

    /// Firewall tool exited with a non-zero status
    #[error("Command '{command}' failed: {}", exit_description(.exit_code, .stderr))]
    Tool {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Firewall tool binary could not be located
    #[error("Cannot find '{0}' in PATH")]
    ToolNotFound(String),

    /// An apply sequence stopped part-way; earlier steps stay applied
    #[error("Failed to {operation} (step {} of {total}, {completed} applied before it): {source}", .completed + 1)]
    PartialApply {
        operation: String,
        completed: usize,
        total: usize,
        #[source]
        source: Box<Error>,
    },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Configuration is missing or unusable
    #[error("Configuration error: {0}")]
    Config(String),
}

fn exit_description(exit_code: &Option<i32>, stderr: &str) -> String {
    let status = exit_code.map_or_else(
        || "terminated by signal".to_string(),
        |code| format!("exit code {code}"),
    );
    let stderr = stderr.trim();
    if stderr.is_empty() {
        status
    } else {
        format!("{status}: {stderr}")
    }
}

impl Error {
    /// Innermost tool error, looking through [`Error::PartialApply`].
    pub fn tool_stderr(&self) -> Option<&str> {
        match self {
            Error::Tool { stderr, .. } => Some(stderr),
            Error::PartialApply { source, .. } => source.tool_stderr(),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches tool stderr against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied")
            || lower.contains("you must be root")
            || lower.contains("operation not permitted")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run as root, or allow sudo/run0 for iptables")
                .with_suggestion("Set CHAINWARDEN_ELEVATION_METHOD=sudo for NOPASSWD sudoers setups")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available")
                .with_help("https://wiki.archlinux.org/title/Iptables");
        }

        // Chain missing
        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Create the chain first: iptables -N <chain> and ip6tables -N <chain>")
                .with_suggestion("Jump to it from INPUT: iptables -A INPUT -j <chain>")
                .with_suggestion("Verify the chain name in the configuration file");
        }

        // Position no longer valid (chain changed underneath us)
        if lower.contains("index of deletion too big") || lower.contains("bad rule") {
            return ErrorTranslation::new("Rule position no longer exists in the chain")
                .with_suggestion("Another process may have modified the chain concurrently")
                .with_suggestion("Re-run to compute a fresh plan from the current chain");
        }

        // Table / kernel module problems
        if lower.contains("can't initialize") || lower.contains("table does not exist") {
            return ErrorTranslation::new("iptables cannot access the filter table")
                .with_suggestion("Load the kernel modules: modprobe ip_tables ip6_tables")
                .with_suggestion("Check whether the system uses the nf_tables backend (iptables-nft)")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Legacy_xtables_tools");
        }

        // Comment match unavailable
        if lower.contains("comment") && lower.contains("match") {
            return ErrorTranslation::new("The comment match is not available")
                .with_suggestion("Load the xt_comment module: modprobe xt_comment")
                .with_suggestion("Comments are limited to 256 characters");
        }

        // Invalid address
        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("iptables rejected the source address")
                .with_suggestion("Use proper IP format: 192.0.2.1 or 192.0.2.0/24")
                .with_suggestion("For IPv6: 2001:db8::1 or 2001:db8::/48")
                .with_help("https://en.wikipedia.org/wiki/Classless_Inter-Domain_Routing");
        }

        // Lock contention
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting firewall managers: systemctl status firewalld ufw",
                );
        }

        // Missing binary
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or set iptables_path / ip6tables_path in the configuration");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -n -L")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
