//! Input validation for values that end up on the iptables command line
//!
//! Arguments are passed to the tools without a shell, so these checks are
//! about what iptables accepts and what survives a round trip through its
//! listing, not about quoting.

/// Longest comment the iptables comment match accepts
pub const MAX_COMMENT_LEN: usize = 256;

/// Longest chain name iptables accepts (`XT_EXTENSION_MAXNAMELEN` - 1)
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Validates a rule comment.
///
/// # Examples
///
/// ```
/// use chainwarden::validators::validate_comment;
///
/// assert!(validate_comment("office VPN").is_ok());
/// assert!(validate_comment("ends */ early").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` if:
/// - Comment exceeds 256 characters
/// - Comment contains control characters (newlines break the listing)
/// - Comment contains `*/`, which would end the listing's comment early
pub fn validate_comment(comment: &str) -> Result<(), String> {
    let len = comment.chars().count();
    if len > MAX_COMMENT_LEN {
        return Err(format!(
            "comment is {len} characters long, at most {MAX_COMMENT_LEN} are allowed"
        ));
    }

    if comment.chars().any(char::is_control) {
        return Err("comment contains control characters".to_string());
    }

    if comment.contains("*/") {
        return Err("comment cannot contain '*/'".to_string());
    }

    Ok(())
}

/// Validates the name of the managed chain.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than 28 characters, contains
/// whitespace, or starts with `-` (it would be read as an option).
pub fn validate_chain_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("chain name cannot be empty".to_string());
    }

    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "chain name too long (max {MAX_CHAIN_NAME_LEN} characters)"
        ));
    }

    if name.chars().any(char::is_whitespace) {
        return Err("chain name cannot contain whitespace".to_string());
    }

    if name.starts_with('-') {
        return Err("chain name cannot start with '-'".to_string());
    }

    Ok(())
}

/// Validates a user name used as a rule owner.
///
/// # Errors
///
/// Returns `Err` for an empty name or one containing whitespace or control
/// characters.
pub fn validate_owner(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("owner cannot be empty".to_string());
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("owner cannot contain whitespace or control characters".to_string());
    }
    Ok(())
}
