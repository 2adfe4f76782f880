//! Version management for kernel compatibility gating.
//!
//! Manifests declare a `requires_kernel` version; admission checks it
//! against the running kernel with semver-style rules.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Semantic version following semver conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    /// Major version - breaking changes
    pub major: u32,
    /// Minor version - new features, backwards compatible
    pub minor: u32,
    /// Patch version - bug fixes, backwards compatible
    pub patch: u32,
}

impl Version {
    /// Creates a new version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Returns the version of the running kernel crate.
    #[must_use]
    pub fn current() -> Self {
        Self::new(
            env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(1),
            env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        )
    }

    /// Checks whether a kernel of version `kernel` satisfies this
    /// requirement.
    ///
    /// Compatibility rules (semver): the major versions must match and
    /// the kernel's minor version must be at least the required minor.
    #[must_use]
    pub fn is_satisfied_by(&self, kernel: &Self) -> bool {
        self.major == kernel.major && kernel.minor >= self.minor
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

/// Error returned when parsing a version string fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    /// The string did not have the `major.minor.patch` shape.
    #[error("expected 'major.minor.patch', got '{0}'")]
    Malformed(String),
    /// A component was not a valid integer.
    #[error("invalid version component in '{value}': {source}")]
    Component {
        /// The full version string.
        value: String,
        /// The underlying integer parse error.
        source: ParseIntError,
    },
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(VersionParseError::Malformed(s.to_string()));
        };
        let parse = |component: &str| {
            component
                .parse::<u32>()
                .map_err(|source| VersionParseError::Component {
                    value: s.to_string(),
                    source,
                })
        };
        Ok(Self::new(parse(major)?, parse(minor)?, parse(patch)?))
    }
}

impl TryFrom<String> for Version {
    type Error = VersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}
