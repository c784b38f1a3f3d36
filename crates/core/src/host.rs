//! Resolved remote host identifiers.
//!
//! An R66 peer is identified by the host id exchanged during authentication,
//! not by the socket address it happened to dial from. A single logical host
//! may hold connections from several addresses, so the connection core keys
//! its client-channel index by [`HostId`].

use std::fmt;

/// Logical identifier of a remote R66 host, known once authentication succeeds.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct HostId(String);

impl HostId {
    /// Creates a host id from its textual form.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the textual form of the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for HostId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_input() {
        let id = HostId::new("partner-a");

        assert_eq!(id.to_string(), "partner-a");
        assert_eq!(id.as_str(), "partner-a");
    }

    #[test]
    fn equality_is_by_value() {
        assert_eq!(HostId::from("hosta"), HostId::new(String::from("hosta")));
        assert_ne!(HostId::from("hosta"), HostId::from("hostb"));
    }
}
