//! Protocol versioning

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current protocol version
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

/// Protocol version identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Whether a peer speaking `other` can be served by this version
    ///
    /// Majors must match; this side must know at least the peer's minor.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor >= other.minor
    }

    /// Reject a peer version this node cannot serve
    pub fn check_peer(&self, peer: &ProtocolVersion) -> Result<()> {
        if self.is_compatible_with(peer) {
            Ok(())
        } else {
            Err(Error::ProtocolVersion {
                expected: self.to_string(),
                actual: peer.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(ProtocolVersion::new(1, 2, 3).to_string(), "1.2.3");
    }

    #[test]
    fn test_version_compatibility() {
        let v1_0 = ProtocolVersion::new(1, 0, 0);
        let v1_1 = ProtocolVersion::new(1, 1, 0);
        let v2_0 = ProtocolVersion::new(2, 0, 0);

        assert!(v1_1.is_compatible_with(&v1_0));
        assert!(!v1_0.is_compatible_with(&v1_1));
        assert!(!v2_0.is_compatible_with(&v1_0));
    }

    #[test]
    fn test_check_peer_reports_both_versions() {
        let err = PROTOCOL_VERSION
            .check_peer(&ProtocolVersion::new(9, 0, 0))
            .unwrap_err();
        match err {
            Error::ProtocolVersion { expected, actual } => {
                assert_eq!(expected, PROTOCOL_VERSION.to_string());
                assert_eq!(actual, "9.0.0");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(PROTOCOL_VERSION.check_peer(&PROTOCOL_VERSION).is_ok());
    }
}
