use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A validated lookup key for a routing rule.
///
/// Route keys must be 1-64 characters long and contain only
/// alphanumeric characters, hyphens, or underscores. They identify
/// either a short code or a source-host rule in the backing store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteKey(String);

const MIN_LENGTH: usize = 1;
const MAX_LENGTH: usize = 64;

impl RouteKey {
    /// Creates a new `RouteKey` after validating the input.
    ///
    /// Valid keys are 1-64 characters and contain only `[a-zA-Z0-9_-]`.
    pub fn new(key: impl Into<String>) -> Result<Self, CoreError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    /// Creates a `RouteKey` without validation.
    ///
    /// Use this only for keys produced by trusted internal sources.
    pub fn new_unchecked(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the route key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(key: &str) -> Result<(), CoreError> {
        if key.len() < MIN_LENGTH || key.len() > MAX_LENGTH {
            return Err(CoreError::InvalidRouteKey(format!(
                "length must be between {} and {}, got {}",
                MIN_LENGTH,
                MAX_LENGTH,
                key.len()
            )));
        }

        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CoreError::InvalidRouteKey(format!(
                "must contain only alphanumeric characters, hyphens, or underscores: '{}'",
                key
            )));
        }

        Ok(())
    }
}

impl Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
