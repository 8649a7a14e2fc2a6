use std::path::PathBuf;
use std::process::Command;

use super::ConfigStore;
use crate::config::HypervisorSettings;
use crate::errors::StoreError;

/// Configuration store backed by the xenstore command-line tools.
pub struct XenstoreCli {
    read: PathBuf,
    write: PathBuf,
    exists: PathBuf,
}

impl XenstoreCli {
    pub fn from_settings(settings: &HypervisorSettings) -> Self {
        Self {
            read: settings.xenstore_read.clone(),
            write: settings.xenstore_write.clone(),
            exists: settings.xenstore_exists.clone(),
        }
    }
}

impl ConfigStore for XenstoreCli {
    fn read(&self, path: &str) -> Result<Option<String>, StoreError> {
        let output = Command::new(&self.read)
            .arg(path)
            .output()
            .map_err(|e| StoreError::Read {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        // A missing key is a non-zero exit, not an error.
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim_end().to_string()))
    }

    fn write(&self, path: &str, value: &str) -> Result<(), StoreError> {
        let output = Command::new(&self.write)
            .arg(path)
            .arg(value)
            .output()
            .map_err(|e| StoreError::Write {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(StoreError::Write {
                path: path.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let status = Command::new(&self.exists)
            .arg(path)
            .status()
            .map_err(|e| StoreError::Read {
                path: path.to_string(),
                message: e.to_string(),
            })?;
        Ok(status.success())
    }
}
