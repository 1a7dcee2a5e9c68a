use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Access an identity holds on a repository.
///
/// Variants are declared in ascending order so the derived `Ord` gives the
/// total order used by every threshold check (`level >= ReadOnly`, ...).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessLevel {
    #[default]
    NoAccess,
    ReadOnly,
    ReadWrite,
    Admin,
}

impl AccessLevel {
    pub fn can_read(self) -> bool {
        self >= AccessLevel::ReadOnly
    }

    pub fn can_write(self) -> bool {
        self >= AccessLevel::ReadWrite
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::NoAccess => "no-access",
            AccessLevel::ReadOnly => "read-only",
            AccessLevel::ReadWrite => "read-write",
            AccessLevel::Admin => "admin",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no-access" => Ok(AccessLevel::NoAccess),
            "read-only" => Ok(AccessLevel::ReadOnly),
            "read-write" => Ok(AccessLevel::ReadWrite),
            "admin" => Ok(AccessLevel::Admin),
            other => anyhow::bail!("unknown access level: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total_and_ascending() {
        assert!(AccessLevel::NoAccess < AccessLevel::ReadOnly);
        assert!(AccessLevel::ReadOnly < AccessLevel::ReadWrite);
        assert!(AccessLevel::ReadWrite < AccessLevel::Admin);
    }

    #[test]
    fn thresholds() {
        assert!(!AccessLevel::NoAccess.can_read());
        assert!(AccessLevel::ReadOnly.can_read());
        assert!(!AccessLevel::ReadOnly.can_write());
        assert!(AccessLevel::ReadWrite.can_write());
        assert!(AccessLevel::Admin.can_write());
    }

    #[test]
    fn default_is_no_access() {
        assert_eq!(AccessLevel::default(), AccessLevel::NoAccess);
    }

    #[test]
    fn parses_kebab_case_names() {
        assert_eq!("read-only".parse::<AccessLevel>().unwrap(), AccessLevel::ReadOnly);
        assert_eq!("admin".parse::<AccessLevel>().unwrap(), AccessLevel::Admin);
        assert!("root".parse::<AccessLevel>().is_err());
    }

    #[test]
    fn deserializes_from_yaml() {
        let level: AccessLevel = serde_yaml::from_str("read-write").unwrap();
        assert_eq!(level, AccessLevel::ReadWrite);
        assert_eq!(AccessLevel::ReadWrite.to_string(), "read-write");
    }
}
