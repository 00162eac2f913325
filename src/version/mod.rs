//! Versions and version constraints.
//!
//! Registry packages carry semantic versions. Packages pulled from a
//! version-control ref or a bare URL may have no semantic version at all;
//! those are represented by [`PackageVersion::Ref`] and only match a
//! wildcard or the identical reference.

mod constraint;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use constraint::VersionConstraint;

/// Version of a resolved package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PackageVersion {
    Semver(semver::Version),
    /// A branch, commit, or URL with no semantic version.
    Ref(String),
}

impl PackageVersion {
    /// Parse a version, accepting an optional leading `v`. Anything that is
    /// not a full semantic version becomes a [`PackageVersion::Ref`].
    pub fn parse_lenient(s: &str) -> Self {
        let trimmed = s.trim();
        let stripped = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        match semver::Version::parse(stripped) {
            Ok(v) => PackageVersion::Semver(v),
            Err(_) => PackageVersion::Ref(trimmed.to_string()),
        }
    }

    pub fn as_semver(&self) -> Option<&semver::Version> {
        match self {
            PackageVersion::Semver(v) => Some(v),
            PackageVersion::Ref(_) => None,
        }
    }

    pub fn is_prerelease(&self) -> bool {
        matches!(self, PackageVersion::Semver(v) if !v.pre.is_empty())
    }
}

impl From<semver::Version> for PackageVersion {
    fn from(v: semver::Version) -> Self {
        PackageVersion::Semver(v)
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageVersion::Semver(v) => write!(f, "{}", v),
            PackageVersion::Ref(r) => write!(f, "{}", r),
        }
    }
}

impl FromStr for PackageVersion {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PackageVersion::parse_lenient(s))
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Semantic versions order by precedence and rank above refs; refs order lexically.
impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PackageVersion::Semver(a), PackageVersion::Semver(b)) => a.cmp(b),
            (PackageVersion::Semver(_), PackageVersion::Ref(_)) => Ordering::Greater,
            (PackageVersion::Ref(_), PackageVersion::Semver(_)) => Ordering::Less,
            (PackageVersion::Ref(a), PackageVersion::Ref(b)) => a.cmp(b),
        }
    }
}

impl Serialize for PackageVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PackageVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(PackageVersion::parse_lenient(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lenient() {
        assert_eq!(
            PackageVersion::parse_lenient("v1.2.3"),
            PackageVersion::Semver(semver::Version::new(1, 2, 3))
        );
        assert_eq!(
            PackageVersion::parse_lenient("main"),
            PackageVersion::Ref("main".into())
        );
        assert_eq!(
            PackageVersion::parse_lenient("1.2"),
            PackageVersion::Ref("1.2".into())
        );
    }

    #[test]
    fn test_ordering_semver_above_refs() {
        let a = PackageVersion::parse_lenient("0.0.1");
        let b = PackageVersion::parse_lenient("develop");
        assert!(a > b);
        assert!(PackageVersion::parse_lenient("2.0.0") > PackageVersion::parse_lenient("2.0.0-rc.1"));
    }

    #[test]
    fn test_serde_as_string() {
        let v = PackageVersion::parse_lenient("1.0.0-beta.2");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"1.0.0-beta.2\"");
        let back: PackageVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
        assert!(back.is_prerelease());
    }
}
