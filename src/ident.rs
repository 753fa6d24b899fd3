//! Identifier validation.
//!
//! Table and column names are spliced into SQL as text (only values are
//! parameterized), so every identifier must pass a strict grammar before
//! interpolation: first character ASCII letter or `_`, remaining characters
//! ASCII alphanumeric, `_`, or `$`, at most 64 characters. Qualified names
//! (`alias.column`, a single dot) are accepted where columns are accepted,
//! and `*` only as a whole projection entry. JOIN `ON` text is restricted to
//! column equalities joined by `AND`.

use crate::error::{DbError, DbResult};

/// MySQL caps identifiers at 64 characters.
pub(crate) const MAX_IDENTIFIER_LEN: usize = 64;

/// Validate a bare identifier (one table, column, or alias name).
pub(crate) fn validate_identifier(name: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::invalid_identifier(name, "empty identifier"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(DbError::invalid_identifier(
            name,
            format!("exceeds {} characters", MAX_IDENTIFIER_LEN),
        ));
    }
    for (i, b) in name.bytes().enumerate() {
        let ok = if i == 0 {
            b.is_ascii_alphabetic() || b == b'_'
        } else {
            b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
        };
        if !ok {
            return Err(DbError::invalid_identifier(
                name,
                if i == 0 {
                    "must start with a letter or underscore".to_string()
                } else {
                    format!("invalid character at position {}", i)
                },
            ));
        }
    }
    Ok(())
}

/// Validate an identifier that may carry a single qualifier (`alias.column`).
pub(crate) fn validate_qualified(name: &str) -> DbResult<()> {
    let mut parts = name.split('.');
    let first = parts.next().unwrap_or("");
    match (parts.next(), parts.next()) {
        (None, _) => validate_identifier(first),
        (Some(second), None) => {
            validate_identifier(first)?;
            validate_identifier(second)
        }
        (Some(_), Some(_)) => Err(DbError::invalid_identifier(
            name,
            "more than one qualifier",
        )),
    }
}

/// Validate one projection entry: `*` or a (possibly qualified) column.
pub(crate) fn validate_projection_entry(name: &str) -> DbResult<()> {
    if name == "*" {
        return Ok(());
    }
    validate_qualified(name)
}

/// Validate a JOIN `ON` predicate: one or more `left = right` column
/// equalities joined by `AND`. Anything else is rejected.
pub(crate) fn validate_on_clause(on: &str) -> DbResult<()> {
    let trimmed = on.trim();
    if trimmed.is_empty() {
        return Err(DbError::invalid_identifier(on, "empty ON predicate"));
    }
    for term in split_on_and(trimmed) {
        let mut sides = term.splitn(2, '=');
        let left = sides.next().unwrap_or("").trim();
        let Some(right) = sides.next() else {
            return Err(DbError::invalid_identifier(
                term.trim(),
                "ON predicate must be a column equality",
            ));
        };
        let right = right.trim();
        if right.contains('=') {
            return Err(DbError::invalid_identifier(
                term.trim(),
                "ON predicate must contain exactly one '='",
            ));
        }
        validate_qualified(left)?;
        validate_qualified(right)?;
    }
    Ok(())
}

/// Split a predicate on the word `AND` (case-insensitive, whitespace-bounded).
fn split_on_and(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 3 <= bytes.len() {
        let word = bytes[i].eq_ignore_ascii_case(&b'a')
            && bytes[i + 1].eq_ignore_ascii_case(&b'n')
            && bytes[i + 2].eq_ignore_ascii_case(&b'd');
        let bounded = (i == 0 || bytes[i - 1].is_ascii_whitespace())
            && (i + 3 == bytes.len() || bytes[i + 3].is_ascii_whitespace());
        if word && bounded {
            parts.push(&s[start..i]);
            start = i + 3;
            i += 3;
        } else {
            i += 1;
        }
    }
    parts.push(&s[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_typical_identifiers() {
        for name in ["users", "order_items", "_tmp", "col$1", "Product2024"] {
            assert!(validate_identifier(name).is_ok(), "rejected {name}");
        }
    }

    #[test]
    fn test_rejects_injection_shapes() {
        for name in [
            "users; DROP TABLE users",
            "users--",
            "na me",
            "name'",
            "`name`",
            "1col",
            "",
            "col-umn",
        ] {
            assert!(validate_identifier(name).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn test_length_limit() {
        let ok = "a".repeat(MAX_IDENTIFIER_LEN);
        let too_long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_identifier(&ok).is_ok());
        assert!(validate_identifier(&too_long).is_err());
    }

    #[test]
    fn test_qualified_names() {
        assert!(validate_qualified("users.id").is_ok());
        assert!(validate_qualified("u.name").is_ok());
        assert!(validate_qualified("a.b.c").is_err());
        assert!(validate_qualified(".id").is_err());
        assert!(validate_qualified("users.").is_err());
    }

    #[test]
    fn test_projection_star() {
        assert!(validate_projection_entry("*").is_ok());
        assert!(validate_projection_entry("u.*").is_err());
        assert!(validate_projection_entry("count(*)").is_err());
    }

    #[test]
    fn test_on_clause_equalities() {
        assert!(validate_on_clause("users.id = orders.user_id").is_ok());
        assert!(validate_on_clause("u.id=o.user_id").is_ok());
        assert!(validate_on_clause("a.x = b.x AND a.y = b.y").is_ok());
        assert!(validate_on_clause("a.x = b.x and a.y = b.y").is_ok());
    }

    #[test]
    fn test_on_clause_rejects_non_equalities() {
        assert!(validate_on_clause("").is_err());
        assert!(validate_on_clause("users.id").is_err());
        assert!(validate_on_clause("a = b = c").is_err());
        assert!(validate_on_clause("a.x > b.x").is_err());
        assert!(validate_on_clause("1 = 1; DROP TABLE users").is_err());
        assert!(validate_on_clause("a.x = b.x OR a.y = b.y").is_err());
    }
}
