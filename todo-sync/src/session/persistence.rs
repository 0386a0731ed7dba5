// Persistence helpers for cached credentials
// The login token is persisted to <state_dir>/credentials.json by atomic rename,
// with writers serialized through a sidecar lock file

use crate::session::config::Config;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Token and username returned by a successful login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub username: String,
}

/// On-disk cache of the current credentials
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.credentials_file(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Sidecar lock serializing writers; readers never see a partial file
    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    /// Load cached credentials; a missing or empty file means signed out
    pub fn load(&self) -> Result<Option<Credentials>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read credentials file: {}", self.path.display()))?;

        if contents.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&contents)
            .map(Some)
            .with_context(|| format!("Failed to parse credentials file: {}", self.path.display()))
    }

    /// Save credentials: write an owner-only temp file, then rename it over the old one
    pub fn save(&self, credentials: &Credentials) -> Result<()> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("Invalid credentials path: {}", self.path.display()))?;
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create state directory: {}", parent.display())
        })?;

        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())
            .with_context(|| "Failed to open credentials lock file")?;
        lock.lock_exclusive()
            .with_context(|| "Failed to acquire exclusive lock on credentials file")?;

        let contents = serde_json::to_string_pretty(credentials)
            .with_context(|| "Failed to serialize credentials")?;

        let temp_path = parent.join(format!(".credentials.json.tmp.{}", std::process::id()));
        let mut temp = OpenOptions::new();
        temp.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            temp.mode(0o600);
        }
        let mut file = temp
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| "Failed to flush credentials")?;
        drop(file);

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        // Lock is released when `lock` is dropped
        Ok(())
    }

    /// Forget cached credentials (logout or forced sign-out)
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).with_context(|| {
                format!("Failed to remove credentials file: {}", self.path.display())
            })?;
        }
        Ok(())
    }
}
