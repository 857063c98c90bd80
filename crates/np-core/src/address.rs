//! Principal addresses on the identity substrate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest name permitted after the `@` prefix.
pub const MAX_NAME_LEN: usize = 55;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must start with '@'")]
    MissingPrefix,
    #[error("address name must be 1..={MAX_NAME_LEN} characters")]
    BadLength,
    #[error("address may only contain lowercase letters, digits, and '_'")]
    InvalidCharacters,
}

/// An opaque principal identifier on the substrate, e.g. `@alice`.
///
/// Addresses double as routing labels and as the lookup key for the
/// principal's signing public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Full address including the `@` prefix.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address name without the `@` prefix.
    pub fn name(&self) -> &str {
        &self.0[1..]
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix('@').ok_or(AddressError::MissingPrefix)?;
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(AddressError::BadLength);
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        {
            return Err(AddressError::InvalidCharacters);
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_addresses() {
        for s in ["@alice", "@bob_2", "@x"] {
            let a: Address = s.parse().expect(s);
            assert_eq!(a.as_str(), s);
            assert_eq!(a.name(), &s[1..]);
        }
    }

    #[test]
    fn rejects_missing_prefix() {
        assert_eq!("alice".parse::<Address>(), Err(AddressError::MissingPrefix));
    }

    #[test]
    fn rejects_bad_names() {
        assert_eq!("@".parse::<Address>(), Err(AddressError::BadLength));
        assert_eq!(
            "@Alice".parse::<Address>(),
            Err(AddressError::InvalidCharacters)
        );
        assert_eq!(
            "@al ice".parse::<Address>(),
            Err(AddressError::InvalidCharacters)
        );
        let long = format!("@{}", "a".repeat(MAX_NAME_LEN + 1));
        assert_eq!(long.parse::<Address>(), Err(AddressError::BadLength));
    }

    #[test]
    fn serde_round_trip() {
        let a: Address = "@alice".parse().unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"@alice\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn serde_rejects_invalid() {
        assert!(serde_json::from_str::<Address>("\"alice\"").is_err());
    }
}
