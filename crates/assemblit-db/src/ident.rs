//! Identifier quoting.
//!
//! Values are always bound. Table and column names cannot be, so they are
//! validated and double-quoted before they reach a statement.

use crate::error::{StoreError, StoreResult};

const MAX_IDENT_LEN: usize = 128;

/// Returns `name` as a quoted SQLite identifier.
pub fn quote(name: &str) -> StoreResult<String> {
    validate(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quotes every name and joins them with `", "`.
pub fn quote_list<S: AsRef<str>>(names: &[S]) -> StoreResult<String> {
    let quoted = names
        .iter()
        .map(|name| quote(name.as_ref()))
        .collect::<StoreResult<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// Rejects names that are empty, overly long, or contain control characters.
pub fn validate(name: &str) -> StoreResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.len() != name.len()
        || name.len() > MAX_IDENT_LEN
        || name.chars().any(char::is_control)
        || name.to_ascii_lowercase().starts_with("sqlite_")
    {
        return Err(StoreError::InvalidIdentifier(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_hash_named_tables() {
        assert_eq!(
            quote("0cc175b9c0f1b6a831c399e269772661").unwrap(),
            "\"0cc175b9c0f1b6a831c399e269772661\""
        );
    }

    #[test]
    fn escapes_embedded_quotes() {
        assert_eq!(quote("a\"b").unwrap(), "\"a\"\"b\"");
        assert_eq!(quote_list(&["x", "y z"]).unwrap(), "\"x\", \"y z\"");
    }

    #[test]
    fn rejects_unusable_names() {
        for bad in ["", " padded", "tab\tname", "sqlite_master"] {
            assert!(matches!(validate(bad), Err(StoreError::InvalidIdentifier(_))));
        }
    }
}
