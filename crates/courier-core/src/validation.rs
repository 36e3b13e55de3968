//! Synchronous input validation, run before any network call.

use crate::errors::{CourierError, Result};

/// Default upper bound on message length, in characters.
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 4_000;

/// Upper bound on identifier length.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Validate message content, returning the trimmed body.
pub fn validate_content(content: &str, max_chars: usize) -> Result<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(CourierError::validation("message content is empty"));
    }
    let chars = trimmed.chars().count();
    if chars > max_chars {
        return Err(CourierError::validation(format!(
            "message content is {chars} characters, limit is {max_chars}"
        )));
    }
    Ok(trimmed)
}

/// Validate an identifier (contact, client message, device).
///
/// Accepts ASCII alphanumerics and `-_.:@`, up to [`MAX_IDENTIFIER_LEN`].
pub fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CourierError::validation(format!("{field} is empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(CourierError::validation(format!(
            "{field} exceeds {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@')))
    {
        return Err(CourierError::validation(format!(
            "{field} contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn content_is_trimmed() {
        assert_eq!(validate_content("  hi \n", 10).unwrap(), "hi");
    }

    #[test]
    fn whitespace_only_is_empty() {
        assert_matches!(validate_content(" \t\n ", 10), Err(CourierError::Validation(_)));
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let s = "é".repeat(10);
        assert!(validate_content(&s, 10).is_ok());
        assert!(validate_content(&s, 9).is_err());
    }

    #[test]
    fn limit_applies_after_trimming() {
        assert!(validate_content("   abc   ", 3).is_ok());
    }

    #[test]
    fn identifiers() {
        assert!(validate_identifier("contactId", "alice_01").is_ok());
        assert!(validate_identifier("clientId", "0190c2f4-7b3e-7000-8000-000000000000").is_ok());
        assert!(validate_identifier("contactId", "").is_err());
        assert!(validate_identifier("contactId", "al ice").is_err());
        assert!(validate_identifier("contactId", "a/b").is_err());
        assert!(validate_identifier("contactId", &"x".repeat(129)).is_err());
    }

    #[test]
    fn error_names_the_field() {
        let err = validate_identifier("recipientContactId", "").unwrap_err();
        assert!(err.to_string().contains("recipientContactId"));
    }
}
