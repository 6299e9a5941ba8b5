//! Session tokens and sandbox database names.
//!
//! Both values end up as strings that other code trusts: session ids as map
//! keys handed to browsers, database names interpolated into DDL. Database
//! names are therefore only ever produced here, from a fixed lowercase
//! alphabet, and never parsed from request input.

use rand::Rng;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::SandboxError;

/// Prefix shared by every sandbox database. Used to find leftovers on shutdown.
pub const SANDBOX_PREFIX: &str = "sandbox_";

const NAME_SUFFIX_LEN: usize = 12;
const SESSION_ALPHA_LEN: usize = 16;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn random_from(charset: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

/// Generate a fresh opaque session identifier.
///
/// Format: `<16 letters>_<unix nanos>_<uuid v4 simple>`.
pub fn generate_session_id() -> String {
    let alpha = random_from(LETTERS, SESSION_ALPHA_LEN);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}_{}_{}", alpha, nanos, uuid::Uuid::new_v4().simple())
}

/// Returns true for names safe to interpolate unquoted into Postgres DDL.
pub fn is_plain_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Quote an identifier already checked with [`is_plain_identifier`].
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s)
}

/// Name of a sandbox database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseName(String);

impl DatabaseName {
    /// A new random name, `sandbox_` followed by 12 lowercase letters.
    pub fn generate() -> Self {
        Self(format!("{}{}", SANDBOX_PREFIX, random_from(LOWERCASE, NAME_SUFFIX_LEN)))
    }

    /// Accept a name read back from the catalog. Anything that does not look
    /// like one we generated is refused.
    pub fn from_catalog(name: &str) -> Result<Self, SandboxError> {
        let suffix = name
            .strip_prefix(SANDBOX_PREFIX)
            .ok_or_else(|| SandboxError::InvalidIdentifier(name.to_string()))?;
        if suffix.len() == NAME_SUFFIX_LEN && suffix.chars().all(|c| c.is_ascii_lowercase()) {
            Ok(Self(name.to_string()))
        } else {
            Err(SandboxError::InvalidIdentifier(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for DDL.
    pub fn quoted(&self) -> String {
        quote_ident(&self.0)
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn session_ids_are_unique_and_opaque() {
        let ids: HashSet<String> = (0..500).map(|_| generate_session_id()).collect();
        assert_eq!(ids.len(), 500);
        for id in &ids {
            let parts: Vec<&str> = id.split('_').collect();
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0].len(), SESSION_ALPHA_LEN);
            assert!(parts[0].chars().all(|c| c.is_ascii_alphabetic()));
            assert!(parts[1].parse::<u128>().is_ok());
            assert_eq!(parts[2].len(), 32);
        }
    }

    #[test]
    fn generated_names_are_plain_identifiers() {
        for _ in 0..100 {
            let name = DatabaseName::generate();
            assert!(name.as_str().starts_with(SANDBOX_PREFIX));
            assert_eq!(name.as_str().len(), SANDBOX_PREFIX.len() + NAME_SUFFIX_LEN);
            assert!(is_plain_identifier(name.as_str()));
            assert_eq!(DatabaseName::from_catalog(name.as_str()).unwrap(), name);
        }
    }

    #[test]
    fn catalog_names_must_match_generated_shape() {
        assert!(DatabaseName::from_catalog("querylab").is_err());
        assert!(DatabaseName::from_catalog("sandbox_abc").is_err());
        assert!(DatabaseName::from_catalog("sandbox_abcdefghijk1").is_err());
        assert!(DatabaseName::from_catalog("sandbox_abcdefghijkl\"").is_err());
        assert!(DatabaseName::from_catalog("sandbox_abcdefghijkl").is_ok());
    }

    #[test]
    fn plain_identifier_rules() {
        assert!(is_plain_identifier("querylab"));
        assert!(is_plain_identifier("_sandbox_user2"));
        assert!(!is_plain_identifier(""));
        assert!(!is_plain_identifier("2user"));
        assert!(!is_plain_identifier("User"));
        assert!(!is_plain_identifier("a\"; drop table x; --"));
        assert!(!is_plain_identifier(&"a".repeat(64)));
    }

    #[test]
    fn quoted_names() {
        assert_eq!(quote_ident("sandbox_user"), "\"sandbox_user\"");
    }
}
