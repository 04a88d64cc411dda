//! Error taxonomy shared by every component.

use std::io;
use std::path::PathBuf;

/// All errors visible to callers of this crate.
///
/// Each variant wraps an optional cause and, where useful, a short
/// human-readable reason so operators can tell "row 101 exceeds
/// transaction limit" from "savepoint depth exhausted" without
/// inspecting internal offsets.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("path error at {path}: {reason}")]
    Path { path: PathBuf, reason: String },

    #[error("write error: {reason}")]
    Write {
        reason: String,
        #[source]
        cause: Option<io::Error>,
    },

    #[error("read error: {reason}")]
    Read {
        reason: String,
        #[source]
        cause: Option<io::Error>,
    },

    #[error("corrupt database: {reason}")]
    CorruptDatabase { reason: String },

    #[error("key not found")]
    KeyNotFound,

    #[error("transaction active")]
    TransactionActive,

    #[error("invalid action: {reason}")]
    InvalidAction { reason: String },

    #[error("database is tombstoned")]
    Tombstoned,
}

impl Error {
    #[must_use]
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn write(reason: impl Into<String>) -> Self {
        Self::Write {
            reason: reason.into(),
            cause: None,
        }
    }

    #[must_use]
    pub fn write_cause(reason: impl Into<String>, cause: io::Error) -> Self {
        Self::Write {
            reason: reason.into(),
            cause: Some(cause),
        }
    }

    #[must_use]
    pub fn read(reason: impl Into<String>) -> Self {
        Self::Read {
            reason: reason.into(),
            cause: None,
        }
    }

    #[must_use]
    pub fn read_cause(reason: impl Into<String>, cause: io::Error) -> Self {
        Self::Read {
            reason: reason.into(),
            cause: Some(cause),
        }
    }

    #[must_use]
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptDatabase {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn invalid_action(reason: impl Into<String>) -> Self {
        Self::InvalidAction {
            reason: reason.into(),
        }
    }

    /// True for the one-way tombstoned state; callers use this to decide
    /// whether retrying makes sense (it never does).
    #[must_use]
    pub const fn is_tombstoned(&self) -> bool {
        matches!(self, Self::Tombstoned)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
