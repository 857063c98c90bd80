//! Device names identifying a daemon instance under one address.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest permitted device name.
pub const MAX_DEVICE_NAME_LEN: usize = 15;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceNameError {
    #[error("device name must not be empty")]
    Empty,
    #[error("device name must be at most {MAX_DEVICE_NAME_LEN} characters")]
    TooLong,
    #[error("device name may only contain ASCII letters, digits, and '_'")]
    InvalidCharacters,
}

/// ASCII label identifying a daemon instance, `[A-Za-z0-9_]{1,15}`.
///
/// Forms the namespace suffix `<device>.sshnp` used in notification keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceName(String);

impl DeviceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceName {
    type Err = DeviceNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(DeviceNameError::Empty);
        }
        if s.len() > MAX_DEVICE_NAME_LEN {
            return Err(DeviceNameError::TooLong);
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(DeviceNameError::InvalidCharacters);
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for DeviceName {
    type Error = DeviceNameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceName> for String {
    fn from(d: DeviceName) -> Self {
        d.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_names() {
        for s in ["office", "pi_4", "A", "abcdefghijklmno"] {
            assert!(s.parse::<DeviceName>().is_ok(), "{s}");
        }
    }

    #[test]
    fn rejects_empty_and_too_long() {
        assert_eq!("".parse::<DeviceName>(), Err(DeviceNameError::Empty));
        // Exactly 16 characters is one over the limit.
        assert_eq!(
            "abcdefghijklmnop".parse::<DeviceName>(),
            Err(DeviceNameError::TooLong)
        );
    }

    #[test]
    fn rejects_non_ascii_and_punctuation() {
        assert_eq!(
            "café".parse::<DeviceName>(),
            Err(DeviceNameError::InvalidCharacters)
        );
        assert_eq!(
            "of-fice".parse::<DeviceName>(),
            Err(DeviceNameError::InvalidCharacters)
        );
    }
}
