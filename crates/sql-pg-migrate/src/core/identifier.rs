//! Identifier validation, quoting and derived-name generation.
//!
//! Identifiers cannot be bound as statement parameters, so every dynamic
//! statement quotes them here. Each dialect escapes its own closing quote
//! character by doubling it.

use sha2::{Digest, Sha256};

use crate::error::{MigrateError, Result};

/// Maximum identifier length accepted from a source catalog.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// PostgreSQL truncates identifiers longer than this many bytes.
pub const PG_MAX_IDENTIFIER_BYTES: usize = 63;

/// Validate an identifier: non-empty, no NUL bytes, bounded length.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {}): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a MySQL identifier using backticks.
pub fn quote_mysql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Quote a SQL Server identifier using brackets.
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// `"schema"."table"`
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// `` `schema`.`table` ``
pub fn qualify_mysql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mysql(schema)?, quote_mysql(table)?))
}

/// `[schema].[table]`
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}

/// Quote a comma-separated PostgreSQL column list.
pub fn quote_pg_list<S: AsRef<str>>(columns: &[S]) -> Result<String> {
    let quoted = columns
        .iter()
        .map(|c| quote_pg(c.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// Standard-conforming PostgreSQL string literal. NUL bytes are dropped
/// because PostgreSQL text cannot store them.
pub fn quote_literal_pg(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\0' => {}
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Deterministic PostgreSQL object name built from `prefix` and `parts`.
///
/// Names over 63 bytes are cut on a char boundary and suffixed with a short
/// hash of the full name, so distinct long inputs stay distinct.
pub fn derive_pg_name(prefix: &str, parts: &[&str]) -> String {
    let mut full = prefix.to_string();
    for part in parts {
        full.push('_');
        full.push_str(part);
    }
    let full = full.to_lowercase();

    if full.len() <= PG_MAX_IDENTIFIER_BYTES {
        return full;
    }

    let digest = Sha256::digest(full.as_bytes());
    let suffix = &hex::encode(digest)[..8];
    let keep = PG_MAX_IDENTIFIER_BYTES - suffix.len() - 1;
    let mut cut = keep;
    while !full.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{}", &full[..cut], suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("column with spaces").is_ok());
        assert!(validate_identifier("日本語").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("table\0name").is_err());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_quote_each_dialect() {
        assert_eq!(quote_pg("table\"name").unwrap(), "\"table\"\"name\"");
        assert_eq!(quote_mysql("table`name").unwrap(), "`table``name`");
        assert_eq!(quote_mssql("table]name").unwrap(), "[table]]name]");
    }

    #[test]
    fn test_injection_text_stays_inside_quotes() {
        assert_eq!(
            quote_pg("Robert'); DROP TABLE Students;--").unwrap(),
            "\"Robert'); DROP TABLE Students;--\""
        );
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualify_pg("public", "users").unwrap(), "\"public\".\"users\"");
        assert_eq!(qualify_mysql("mydb", "users").unwrap(), "`mydb`.`users`");
        assert_eq!(qualify_mssql("dbo", "users").unwrap(), "[dbo].[users]");
        assert!(qualify_pg("", "users").is_err());
    }

    #[test]
    fn test_quote_pg_list() {
        assert_eq!(quote_pg_list(&["a", "b"]).unwrap(), "\"a\", \"b\"");
    }

    #[test]
    fn test_quote_literal_pg() {
        assert_eq!(quote_literal_pg("O'Brien"), "'O''Brien'");
        assert_eq!(quote_literal_pg("a\0b"), "'ab'");
    }

    #[test]
    fn test_derive_pg_name_short() {
        assert_eq!(
            derive_pg_name("uq", &["Customers", "email"]),
            "uq_customers_email"
        );
    }

    #[test]
    fn test_derive_pg_name_truncates_deterministically() {
        let long = "x".repeat(80);
        let a = derive_pg_name("uq", &[&long, "id"]);
        let b = derive_pg_name("uq", &[&long, "id"]);
        let c = derive_pg_name("uq", &[&long, "code"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.len() <= PG_MAX_IDENTIFIER_BYTES);
    }
}
