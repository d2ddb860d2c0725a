//! Parser for `iptables -n --line-numbers -L <chain>` output
//!
//! ```text
//! Chain USER_ACCESS (1 references)
//! num  target     prot opt source               destination
//! 1    ACCEPT     tcp  --  192.0.2.0/24         0.0.0.0/0            tcp dpt:22
//! 2    ACCEPT     tcp  --  198.51.100.7         0.0.0.0/0            tcp dpt:993 /* mail */
//! ```
//!
//! `ip6tables` prints no `opt` value, so IPv6 rows have one column less.
//! The trailing match description is tokenized with a `logos` lexer.

use crate::core::error::{Error, Result};
use crate::core::rule::SourceAddress;
use crate::core::service::{IpVersion, Protocol, Service, ServiceCatalog};
use logos::{Lexer, Logos};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// A rule currently installed in the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRule {
    /// 1-based position in the chain
    pub position: u32,
    pub protocol: Protocol,
    pub port: u16,
    /// Catalog service owning the protocol/port pair
    pub service: Service,
    pub source: SourceAddress,
    pub comment: Option<String>,
}

impl LiveRule {
    pub fn family(&self) -> IpVersion {
        self.source.family()
    }
}

impl fmt::Display for LiveRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rule #{}: {}/{} allowed from {}",
            self.family(),
            self.position,
            self.protocol.display_name(),
            self.port,
            self.source
        )?;
        if let Some(comment) = &self.comment {
            write!(f, " ({comment})")?;
        }
        Ok(())
    }
}

#[derive(Logos, Debug, Clone, PartialEq, Eq)]
enum Token {
    #[regex(r"[ \t]+")]
    Space,

    #[regex(r"dpt:[0-9]+", |lex| lex.slice()[4..].parse::<u32>().ok())]
    DestPort(u32),

    #[token("/*", comment_body)]
    Comment(String),

    #[regex(r"[A-Za-z][A-Za-z0-9_-]*", |lex| lex.slice().to_string())]
    Word(String),
}

/// Consumes everything up to and including the closing `*/`.
fn comment_body(lex: &mut Lexer<Token>) -> Option<String> {
    let rest = lex.remainder();
    let end = rest.find("*/")?;
    let text = rest[..end].trim().to_string();
    lex.bump(end + 2);
    Some(text)
}

/// What the description column says about a rule
#[derive(Debug, PartialEq, Eq)]
struct Description {
    protocol: String,
    port: u32,
    comment: Option<String>,
}

fn parse_description(text: &str) -> std::result::Result<Description, String> {
    let mut tokens = Vec::new();
    for (token, span) in Token::lexer(text).spanned() {
        match token {
            Ok(Token::Space) => {}
            Ok(token) => tokens.push(token),
            Err(()) => return Err(format!("unexpected input '{}'", &text[span.start..])),
        }
    }

    let mut iter = tokens.into_iter();
    let protocol = match iter.next() {
        Some(Token::Word(word)) => word,
        _ => return Err("expected protocol match".to_string()),
    };
    let port = match iter.next() {
        Some(Token::DestPort(port)) => port,
        _ => return Err("expected a single destination port (dpt:N)".to_string()),
    };

    let mut comment = None;
    let mut stateful = false;
    while let Some(token) = iter.next() {
        match token {
            Token::Word(word) if (word == "state" || word == "ctstate") && !stateful => {
                match iter.next() {
                    Some(Token::Word(state)) if state == "NEW" => stateful = true,
                    _ => return Err(format!("unsupported {word} match")),
                }
            }
            Token::Comment(text) if comment.is_none() => comment = Some(text),
            other => return Err(format!("unsupported option {other:?}")),
        }
    }

    Ok(Description {
        protocol,
        port,
        comment: comment.filter(|c| !c.is_empty()),
    })
}

/// Splits off `count` whitespace-separated columns, returning them and the
/// rest of the line.
fn split_columns(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut columns = Vec::with_capacity(count);
    let mut rest = line.trim_start();
    for _ in 0..count {
        if rest.is_empty() {
            return None;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        columns.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((columns, rest.trim_end()))
}

/// Parses a chain listing into the rules this catalog manages.
///
/// Rows whose protocol/port pair belongs to no catalog service are skipped.
///
/// # Errors
///
/// Returns [`Error::Format`] when:
/// - The header names another chain, or is missing
/// - A row does not have the expected columns
/// - A row's target is not `ACCEPT`, or its protocol is neither tcp nor udp
/// - The IPv4 options column is not `--`
/// - The source is not an address of the listed IP version
/// - The match description holds anything but a port, a `state NEW` match
///   and a comment
pub fn parse_chain_listing(
    output: &str,
    chain: &str,
    version: IpVersion,
    catalog: &ServiceCatalog,
) -> Result<Vec<LiveRule>> {
    let format_error = |line: usize, message: String| Error::Format {
        version,
        line,
        message,
    };

    let mut lines = output.lines().enumerate().map(|(idx, l)| (idx + 1, l));

    let (_, header) = lines
        .next()
        .ok_or_else(|| format_error(1, "empty listing".to_string()))?;
    let mut header_words = header.split_whitespace();
    if header_words.next() != Some("Chain") {
        return Err(format_error(1, format!("cannot parse chain header '{}'", header.trim())));
    }
    match header_words.next() {
        Some(name) if name == chain => {}
        Some(name) => {
            return Err(format_error(
                1,
                format!("asked for chain '{chain}', got '{name}'"),
            ));
        }
        None => return Err(format_error(1, "chain header has no name".to_string())),
    }

    // Column header row
    lines.next();

    let fixed_columns = match version {
        IpVersion::V4 => 6,
        IpVersion::V6 => 5,
    };

    let mut rules = Vec::new();
    for (line_no, line) in lines {
        if line.trim().is_empty() {
            continue;
        }

        let (columns, description) = split_columns(line, fixed_columns)
            .ok_or_else(|| format_error(line_no, format!("cannot parse rule '{}'", line.trim())))?;

        let position: u32 = columns[0]
            .parse()
            .map_err(|_| format_error(line_no, format!("bad rule number '{}'", columns[0])))?;

        let target = columns[1];
        if target != "ACCEPT" {
            return Err(format_error(
                line_no,
                format!("rule #{position} is not an ACCEPT rule, is '{target}'"),
            ));
        }

        let protocol = Protocol::from_str(columns[2]).map_err(|_| {
            format_error(
                line_no,
                format!("rule #{position} has unsupported protocol '{}'", columns[2]),
            )
        })?;

        let source_column = match version {
            IpVersion::V4 => {
                if columns[3] != "--" {
                    return Err(format_error(
                        line_no,
                        format!("rule #{position} has options '{}', not supported", columns[3]),
                    ));
                }
                columns[4]
            }
            IpVersion::V6 => columns[3],
        };

        let source = SourceAddress::parse(source_column)
            .ok()
            .filter(|s| s.family() == version)
            .ok_or_else(|| {
                format_error(
                    line_no,
                    format!("rule #{position} has invalid {version} source '{source_column}'"),
                )
            })?;

        let description = parse_description(description).map_err(|message| {
            format_error(line_no, format!("rule #{position}: {message}"))
        })?;

        if description.protocol != protocol.as_str() {
            return Err(format_error(
                line_no,
                format!(
                    "rule #{position} matches '{}' but its protocol is '{protocol}'",
                    description.protocol
                ),
            ));
        }

        let Some((port, service)) = u16::try_from(description.port)
            .ok()
            .and_then(|port| catalog.find(protocol, port).map(|s| (port, s)))
        else {
            debug!(
                "Ignoring {version} rule #{position}: {protocol}/{} belongs to no service",
                description.port
            );
            continue;
        };

        rules.push(LiveRule {
            position,
            protocol,
            port,
            service: service.clone(),
            source,
            comment: description.comment,
        });
    }

    Ok(rules)
}
