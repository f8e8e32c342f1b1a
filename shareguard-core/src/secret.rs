use crate::error::{DetectError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A secret string that prevents accidental logging
///
/// This wrapper ensures secrets are not printed in logs or Debug output.
/// The actual value is only accessible through explicit methods.
#[derive(Clone)]
pub struct Secret<T> {
    inner: T,
}

impl<T> Secret<T> {
    /// Create a new secret from a value
    pub fn new(value: T) -> Self {
        Self { inner: value }
    }

    /// Expose the secret value (use with caution)
    pub fn expose_secret(&self) -> &T {
        &self.inner
    }

    /// Consume the secret and return the inner value
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl Secret<String> {
    /// Create a secret from an environment variable
    ///
    /// # Errors
    /// Returns an error if the environment variable is not set or is empty
    pub fn from_env(var_name: &str) -> Result<Self> {
        std::env::var(var_name)
            .map_err(|e| {
                DetectError::Secret(format!("Environment variable '{}' not set: {}", var_name, e))
            })
            .and_then(|val| {
                if val.is_empty() {
                    Err(DetectError::Secret(format!(
                        "Environment variable '{}' is empty",
                        var_name
                    )))
                } else {
                    Ok(Self::new(val))
                }
            })
    }

    /// Create a secret from an optional environment variable with a default
    pub fn from_env_or(var_name: &str, default: String) -> Self {
        Self::from_env(var_name).unwrap_or_else(|_| Self::new(default))
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T: Clone> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

// Serde support for Secret<String>
impl Serialize for Secret<String> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Never serialize the actual value
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for Secret<String> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Secret::new(value))
    }
}
