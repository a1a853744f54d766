//! STOMP protocol versions

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use stompwire_proto::Escaping;

/// Protocol version negotiated for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StompVersion {
    /// STOMP 1.0
    V1_0,
    /// STOMP 1.1
    V1_1,
}

impl StompVersion {
    /// Supported versions, most preferred first
    pub const PREFERENCE: [StompVersion; 2] = [StompVersion::V1_1, StompVersion::V1_0];

    /// Version string as used in `accept-version` and `version` headers
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1_0 => "1.0",
            Self::V1_1 => "1.1",
        }
    }

    /// Header escaping used on the wire by this version
    pub fn escaping(&self) -> Escaping {
        match self {
            Self::V1_0 => Escaping::None,
            Self::V1_1 => Escaping::Stomp11,
        }
    }

    /// Pick a version for an `accept-version` header value.
    ///
    /// No header means a 1.0 client. Otherwise the most preferred version
    /// listed by the client wins, and `None` means there is no overlap.
    pub fn negotiate(accept_version: Option<&str>) -> Option<StompVersion> {
        let accept_version = match accept_version {
            Some(value) => value,
            None => return Some(Self::V1_0),
        };

        let requested: HashSet<&str> = accept_version.split(',').map(str::trim).collect();
        Self::PREFERENCE
            .into_iter()
            .find(|version| requested.contains(version.as_str()))
    }

    /// Comma separated list of every supported version, oldest first
    pub fn supported_as_string() -> String {
        let mut versions: Vec<_> = Self::PREFERENCE.iter().map(|v| v.as_str()).collect();
        versions.reverse();
        versions.join(",")
    }
}

impl fmt::Display for StompVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StompVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.0" => Ok(Self::V1_0),
            "1.1" => Ok(Self::V1_1),
            other => Err(format!("Unknown STOMP version: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_prefers_newest() {
        assert_eq!(StompVersion::negotiate(Some("1.0,1.1")), Some(StompVersion::V1_1));
        assert_eq!(StompVersion::negotiate(Some("1.1")), Some(StompVersion::V1_1));
        assert_eq!(StompVersion::negotiate(Some(" 1.1 , 1.2")), Some(StompVersion::V1_1));
    }

    #[test]
    fn test_negotiate_only_1_0() {
        assert_eq!(StompVersion::negotiate(Some("1.0")), Some(StompVersion::V1_0));
        assert_eq!(StompVersion::negotiate(None), Some(StompVersion::V1_0));
    }

    #[test]
    fn test_negotiate_no_overlap() {
        assert_eq!(StompVersion::negotiate(Some("1.2,2.0")), None);
        assert_eq!(StompVersion::negotiate(Some("")), None);
    }

    #[test]
    fn test_version_strings() {
        assert_eq!(StompVersion::supported_as_string(), "1.0,1.1");
        assert_eq!("1.1".parse::<StompVersion>(), Ok(StompVersion::V1_1));
        assert!("1.2".parse::<StompVersion>().is_err());
        assert_eq!(StompVersion::V1_1.escaping(), Escaping::Stomp11);
    }
}
