//! Validated identifier newtypes.
//!
//! Plugin ids and capability names are dotted, lowercase, namespaced
//! strings (`builtin.egress.gateway`, `storage.metadata`). Both are
//! validated on construction so that the rest of the kernel can treat
//! them as well-formed.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Error returned when an identifier fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier '{value}': {reason}")]
pub struct IdError {
    /// The rejected value.
    pub value: String,
    /// Why the value was rejected.
    pub reason: &'static str,
}

/// Checks the shared identifier grammar: one or more non-empty segments
/// of `[a-z0-9_-]` joined by single dots.
fn validate_segments(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("must not be empty");
    }
    if value.len() > 128 {
        return Err("must be at most 128 bytes");
    }
    for segment in value.split('.') {
        if segment.is_empty() {
            return Err("segments must not be empty");
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err("segments may only contain [a-z0-9_-]");
        }
    }
    Ok(())
}

/// Unique identifier of a plugin (e.g. `builtin.capture.screen`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PluginId(Arc<str>);

impl PluginId {
    /// Create a validated plugin id.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the value is empty, too long, or contains
    /// characters outside the `[a-z0-9_-]` segment grammar.
    pub fn new(value: impl AsRef<str>) -> Result<Self, IdError> {
        let value = value.as_ref();
        validate_segments(value).map_err(|reason| IdError {
            value: value.to_string(),
            reason,
        })?;
        Ok(Self(Arc::from(value)))
    }

    /// Create a plugin id from a static string known to be valid.
    ///
    /// # Panics
    ///
    /// Panics if the value does not satisfy the identifier grammar. Only
    /// use with literal, known-good ids (tests, built-in constants).
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::new(value).expect("static plugin id must be valid")
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `value` satisfies the plugin id grammar.
    #[must_use]
    pub fn is_valid(value: &str) -> bool {
        validate_segments(value).is_ok()
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PluginId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<PluginId> for String {
    fn from(id: PluginId) -> Self {
        id.0.to_string()
    }
}

/// Namespaced name of a capability (e.g. `storage.metadata`).
///
/// Capability names are not unique per provider: several plugins may
/// register under the same name and the broker orders them
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityName(Arc<str>);

impl CapabilityName {
    /// Create a validated capability name.
    ///
    /// Capability names require at least two segments (a namespace and a
    /// name) so that bare words like `storage` cannot shadow a namespace.
    ///
    /// # Errors
    ///
    /// Returns [`IdError`] if the value fails the identifier grammar or
    /// has fewer than two segments.
    pub fn new(value: impl AsRef<str>) -> Result<Self, IdError> {
        let value = value.as_ref();
        validate_segments(value).map_err(|reason| IdError {
            value: value.to_string(),
            reason,
        })?;
        if !value.contains('.') {
            return Err(IdError {
                value: value.to_string(),
                reason: "capability names must be namespaced (at least two segments)",
            });
        }
        Ok(Self(Arc::from(value)))
    }

    /// Create a capability name from a static string known to be valid.
    ///
    /// # Panics
    ///
    /// Panics if the value is not a valid capability name.
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::new(value).expect("static capability name must be valid")
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CapabilityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CapabilityName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<CapabilityName> for String {
    fn from(name: CapabilityName) -> Self {
        name.0.to_string()
    }
}
