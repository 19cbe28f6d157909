//! Errors raised while loading hub settings.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The settings file is not JSON, or its values have the wrong shape.
    #[error("malformed settings in {}: {source}", path.display())]
    Malformed {
        /// File the values came from.
        path: PathBuf,
        /// Parse or shape error.
        #[source]
        source: serde_json::Error,
    },
    /// A value the hub cannot run with.
    #[error("{field} {reason}")]
    Invalid {
        /// Dotted camelCase key, as written in the settings file.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// Settings key at fault, for validation failures.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Invalid { field, .. } => Some(field),
            Self::Read { .. } | Self::Malformed { .. } => None,
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
