//! Configuration accepted at database creation.

use std::path::PathBuf;

use crate::error::{Error, Result};

pub const MIN_ROW_SIZE: u32 = 128;
pub const MAX_ROW_SIZE: u32 = 65536;
pub const MAX_SKEW_MS: u32 = 86_400_000;
pub const FILE_EXTENSION: &str = "fdb";

/// Parameters accepted by [`crate::db::FrozenDb::create`].
#[derive(Clone, Debug)]
pub struct CreateConfig {
    pub path: PathBuf,
    pub row_size: u32,
    pub skew_ms: u32,
}

impl CreateConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, row_size: u32, skew_ms: u32) -> Self {
        Self {
            path: path.into(),
            row_size,
            skew_ms,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self
            .path
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .is_none_or(|ext| ext != FILE_EXTENSION)
        {
            return Err(Error::path(
                self.path.clone(),
                format!("file path must end with .{FILE_EXTENSION}"),
            ));
        }
        if !(MIN_ROW_SIZE..=MAX_ROW_SIZE).contains(&self.row_size) {
            return Err(Error::invalid_input(format!(
                "row_size {} out of range [{MIN_ROW_SIZE}, {MAX_ROW_SIZE}]",
                self.row_size
            )));
        }
        if self.skew_ms > MAX_SKEW_MS {
            return Err(Error::invalid_input(format!(
                "skew_ms {} exceeds maximum {MAX_SKEW_MS}",
                self.skew_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_extension() {
        let cfg = CreateConfig::new("/tmp/db.bin", 128, 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_row_size_out_of_range() {
        assert!(CreateConfig::new("/tmp/db.fdb", 64, 0).validate().is_err());
        assert!(CreateConfig::new("/tmp/db.fdb", 100_000, 0)
            .validate()
            .is_err());
    }

    #[test]
    fn rejects_skew_out_of_range() {
        assert!(CreateConfig::new("/tmp/db.fdb", 128, 90_000_000)
            .validate()
            .is_err());
    }

    #[test]
    fn accepts_valid_config() {
        assert!(CreateConfig::new("/tmp/db.fdb", 256, 5000).validate().is_ok());
    }
}
