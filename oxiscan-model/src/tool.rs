use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// The categories of external scanning tools a scan plan can reference.
///
/// The four well-known kinds map onto the bundled tool defaults (nmap,
/// sqlmap, gobuster, xsstrike); `Custom` carries any other executable the
/// operator has configured.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ToolKind {
    NetworkScan,
    SqlInjection,
    ContentDiscovery,
    XssTest,
    Custom(String),
}

impl ToolKind {
    pub fn as_str(&self) -> &str {
        match self {
            ToolKind::NetworkScan => "network-scan",
            ToolKind::SqlInjection => "sql-injection",
            ToolKind::ContentDiscovery => "content-discovery",
            ToolKind::XssTest => "xss-test",
            ToolKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ToolKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(ModelError::EmptyToolKind),
            "network-scan" => Ok(ToolKind::NetworkScan),
            "sql-injection" => Ok(ToolKind::SqlInjection),
            "content-discovery" => Ok(ToolKind::ContentDiscovery),
            "xss-test" => Ok(ToolKind::XssTest),
            other => Ok(ToolKind::Custom(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_round_trip_through_strings() {
        for kind in [
            ToolKind::NetworkScan,
            ToolKind::SqlInjection,
            ToolKind::ContentDiscovery,
            ToolKind::XssTest,
        ] {
            let parsed: ToolKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn unknown_names_become_custom() {
        let parsed: ToolKind = "nikto".parse().unwrap();
        assert_eq!(parsed, ToolKind::Custom("nikto".to_string()));
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!("  ".parse::<ToolKind>().is_err());
    }
}
