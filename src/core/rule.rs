//! Desired access rules
//!
//! A [`Rule`] grants one source (address or network) access to one
//! [`Service`]. It is either owned by a single user or shared by everybody,
//! may expire, and may carry a comment that ends up in the chain through the
//! iptables comment match.
//!
//! # Example
//!
//! ```
//! use chainwarden::core::rule::Rule;
//! use chainwarden::core::service::{Protocol, Service};
//!
//! let ssh = Service::new("ssh", "SSH", vec![(Protocol::Tcp, vec![22])]).unwrap();
//! let rule = Rule::user("alice", ssh, "192.0.2.0/24", None, Some("office")).unwrap();
//!
//! assert!(!rule.has_expired());
//! assert_eq!(rule.source().to_string(), "192.0.2.0/24");
//! assert_eq!(rule.content_hash().len(), 64);
//! ```

use crate::core::error::{Error, Result};
use crate::core::service::{IpVersion, Service};
use chrono::{DateTime, SecondsFormat, Utc};
use ipnetwork::IpNetwork;
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// Default minimum prefix length for IPv4 source networks
pub const DEFAULT_MAX_IPV4_NETWORK_SIZE: u8 = 16;

/// Default minimum prefix length for IPv6 source networks
pub const DEFAULT_MAX_IPV6_NETWORK_SIZE: u8 = 48;

/// Source of a rule: a single host or a network.
///
/// A single address and the equivalent full-length network (`/32`, `/128`)
/// compare equal; only the rendering differs.
#[derive(Debug, Clone, Copy)]
pub struct SourceAddress {
    network: IpNetwork,
    is_network: bool,
}

impl SourceAddress {
    /// Parses an address (`192.0.2.1`) or a network (`192.0.2.0/24`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the input is neither, or if a
    /// network has host bits set (`192.0.2.1/24`).
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();

        if let Ok(addr) = trimmed.parse::<IpAddr>() {
            return Ok(Self::from_addr(addr));
        }

        let network: IpNetwork = trimmed.parse().map_err(|_| Error::InvalidAddress {
            input: input.to_string(),
            message: "not an IP address or network".to_string(),
        })?;

        if network.ip() != network.network() {
            return Err(Error::InvalidAddress {
                input: input.to_string(),
                message: format!("host bits set, did you mean {}/{}?", network.network(), network.prefix()),
            });
        }

        Ok(Self {
            network,
            is_network: true,
        })
    }

    pub fn from_addr(addr: IpAddr) -> Self {
        Self {
            network: IpNetwork::from(addr),
            is_network: false,
        }
    }

    pub fn family(&self) -> IpVersion {
        if self.network.is_ipv4() {
            IpVersion::V4
        } else {
            IpVersion::V6
        }
    }

    pub fn network(&self) -> IpNetwork {
        self.network
    }

    pub fn is_network(&self) -> bool {
        self.is_network
    }

    pub fn prefix(&self) -> u8 {
        self.network.prefix()
    }
}

impl PartialEq for SourceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.network == other.network
    }
}

impl Eq for SourceAddress {}

impl Hash for SourceAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network.hash(state);
    }
}

impl fmt::Display for SourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_network {
            write!(f, "{}", self.network)
        } else {
            write!(f, "{}", self.network.ip())
        }
    }
}

/// Largest networks a rule may grant access to, as minimum prefix lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkLimits {
    max_ipv4_network_size: u8,
    max_ipv6_network_size: u8,
}

impl NetworkLimits {
    /// # Errors
    ///
    /// Returns [`Error::InvalidLimits`] when a prefix exceeds its family's width.
    pub fn new(max_ipv4_network_size: u8, max_ipv6_network_size: u8) -> Result<Self> {
        if max_ipv4_network_size > 32 {
            return Err(Error::InvalidLimits(format!(
                "IPv4 prefix /{max_ipv4_network_size} exceeds /32"
            )));
        }
        if max_ipv6_network_size > 128 {
            return Err(Error::InvalidLimits(format!(
                "IPv6 prefix /{max_ipv6_network_size} exceeds /128"
            )));
        }
        Ok(Self {
            max_ipv4_network_size,
            max_ipv6_network_size,
        })
    }

    /// Floor for an address family
    pub fn floor(&self, family: IpVersion) -> u8 {
        match family {
            IpVersion::V4 => self.max_ipv4_network_size,
            IpVersion::V6 => self.max_ipv6_network_size,
        }
    }
}

impl Default for NetworkLimits {
    fn default() -> Self {
        Self {
            max_ipv4_network_size: DEFAULT_MAX_IPV4_NETWORK_SIZE,
            max_ipv6_network_size: DEFAULT_MAX_IPV6_NETWORK_SIZE,
        }
    }
}

/// Who a rule belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Rule requested by a single user
    User(String),
    /// Rule applying to all users
    Shared,
}

impl Owner {
    pub fn user(&self) -> Option<&str> {
        match self {
            Owner::User(name) => Some(name),
            Owner::Shared => None,
        }
    }

    fn hash_marker(&self) -> String {
        match self {
            Owner::User(name) => format!("user:{name}"),
            Owner::Shared => "shared".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    owner: Owner,
    service: Service,
    source: SourceAddress,
    expiry: Option<DateTime<Utc>>,
    comment: Option<String>,
    limits: NetworkLimits,
}

impl Rule {
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `source` does not parse.
    pub fn new(
        owner: Owner,
        service: Service,
        source: &str,
        expiry: Option<DateTime<Utc>>,
        comment: Option<&str>,
    ) -> Result<Self> {
        Ok(Self {
            owner,
            service,
            source: SourceAddress::parse(source)?,
            expiry,
            comment: normalize_comment(comment),
            limits: NetworkLimits::default(),
        })
    }

    /// Rule owned by `owner`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `source` does not parse.
    pub fn user(
        owner: impl Into<String>,
        service: Service,
        source: &str,
        expiry: Option<DateTime<Utc>>,
        comment: Option<&str>,
    ) -> Result<Self> {
        Self::new(Owner::User(owner.into()), service, source, expiry, comment)
    }

    /// Rule applying to every user
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if `source` does not parse.
    pub fn shared(
        service: Service,
        source: &str,
        expiry: Option<DateTime<Utc>>,
        comment: Option<&str>,
    ) -> Result<Self> {
        Self::new(Owner::Shared, service, source, expiry, comment)
    }

    pub fn with_limits(mut self, limits: NetworkLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn source(&self) -> &SourceAddress {
        &self.source
    }

    pub fn family(&self) -> IpVersion {
        self.source.family()
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn limits(&self) -> NetworkLimits {
        self.limits
    }

    pub fn set_service(&mut self, service: Service) {
        self.service = service;
    }

    /// Replaces the source, re-deriving family and network flag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] and leaves the rule untouched if
    /// `source` does not parse.
    pub fn set_source(&mut self, source: &str) -> Result<()> {
        self.source = SourceAddress::parse(source)?;
        Ok(())
    }

    pub fn set_expiry(&mut self, expiry: Option<DateTime<Utc>>) {
        self.expiry = expiry;
    }

    pub fn set_comment(&mut self, comment: Option<&str>) {
        self.comment = normalize_comment(comment);
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Utc::now())
    }

    /// Expired iff an expiry is set and lies strictly before `now`
    pub fn has_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry < now)
    }

    /// Whether this rule describes the given service/source pair.
    ///
    /// When a comment is given, this rule must carry the same non-empty
    /// comment. Without one, the rule's own comment is not considered.
    pub fn matches(&self, service: &Service, source: &SourceAddress, comment: Option<&str>) -> bool {
        if self.service.code() != service.code() {
            return false;
        }
        if self.source.family() != source.family() || self.source != *source {
            return false;
        }
        match comment.filter(|c| !c.is_empty()) {
            Some(wanted) => self.comment.as_deref() == Some(wanted),
            None => true,
        }
    }

    /// Checks the source network against the family's size floor.
    ///
    /// Single addresses are always valid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NetworkTooLarge`] for an oversized network when
    /// `raise_on_invalid` is set; otherwise reports it as `Ok(false)`.
    pub fn network_size_valid(&self, raise_on_invalid: bool) -> Result<bool> {
        if !self.source.is_network() {
            return Ok(true);
        }

        let family = self.family();
        let floor = self.limits.floor(family);
        let prefix = self.source.prefix();
        if prefix >= floor {
            return Ok(true);
        }

        if raise_on_invalid {
            Err(Error::NetworkTooLarge {
                source_address: self.source.to_string(),
                family: family.number(),
                prefix,
                floor,
            })
        } else {
            Ok(false)
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidComment`] if the comment cannot be stored in
    /// the chain.
    pub fn validate_comment(&self) -> Result<()> {
        if let Some(comment) = &self.comment {
            crate::validators::validate_comment(comment).map_err(Error::InvalidComment)?;
        }
        Ok(())
    }

    /// SHA-256 over (owner, service code, family, source, expiry, comment).
    ///
    /// Stable across processes, so callers can address a rule by it. The
    /// source enters in network form: `192.0.2.10` and `192.0.2.10/32` are
    /// the same rule.
    pub fn content_hash(&self) -> String {
        let key = serde_json::json!([
            self.owner.hash_marker(),
            self.service.code(),
            self.family().number(),
            self.source.network().to_string(),
            self.expiry
                .map(|e| e.to_rfc3339_opts(SecondsFormat::Secs, true)),
            self.comment,
        ]);

        let mut hasher = Sha256::new();
        hasher.update(key.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// The listing shows comments without surrounding whitespace, so rules keep
/// them the same way.
fn normalize_comment(comment: Option<&str>) -> Option<String> {
    comment
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Owner::User(name) => write!(f, "User {name} ")?,
            Owner::Shared => write!(f, "Shared ")?,
        }
        write!(
            f,
            "{} rule: {} allowed from {}",
            self.family(),
            self.service,
            self.source
        )?;
        match self.expiry {
            Some(expiry) => write!(f, ", expiry: {}", expiry.format("%Y-%m-%d %H:%M:%S UTC")),
            None => write!(f, ", expiry: never"),
        }
    }
}
