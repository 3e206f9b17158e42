//! Client identity validation and store key generation.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::window::WindowKind;
use crate::error::AdmissionError;

/// An opaque, validated token naming the principal being rate limited.
///
/// The identity is never authenticated; it only has to be present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Validate a raw client-supplied identity.
    pub fn parse(raw: &str) -> Result<Self, AdmissionError> {
        if raw.trim().is_empty() {
            return Err(AdmissionError::Validation(
                "client identity is required".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build the counting store key for this client in the given window.
    ///
    /// Format: `{prefix}{window}:{identity}`
    pub fn window_key(&self, prefix: &str, kind: WindowKind) -> String {
        format!("{}{}:{}", prefix, kind.key_prefix(), self.0)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_identity() {
        let id = ClientIdentity::parse("u1").unwrap();
        assert_eq!(id.as_str(), "u1");
        assert_eq!(id.to_string(), "u1");
    }

    #[test]
    fn test_empty_identity_rejected() {
        assert!(matches!(
            ClientIdentity::parse(""),
            Err(AdmissionError::Validation(_))
        ));
        assert!(matches!(
            ClientIdentity::parse("   "),
            Err(AdmissionError::Validation(_))
        ));
    }

    #[test]
    fn test_window_keys() {
        let id = ClientIdentity::parse("user-42").unwrap();
        assert_eq!(id.window_key("spillway:", WindowKind::Burst), "spillway:rps:user-42");
        assert_eq!(id.window_key("", WindowKind::Sustained), "rpm:user-42");
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = ClientIdentity::parse("u2").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"u2\"");
    }
}
