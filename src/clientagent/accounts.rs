//! Persistent token → account-id store.
//!
//! A single JSON file, written through on every mutation so a crash never
//! loses an account binding.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{info, warn};

pub struct TokenStore {
    path: PathBuf,
    entries: BTreeMap<String, u32>,
}

impl TokenStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Corrupt token store, starting empty");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };

        info!(path = %path.display(), accounts = entries.len(), "Token store opened");
        Ok(Self { path, entries })
    }

    pub fn get(&self, token: &str) -> Option<u32> {
        self.entries.get(token).copied()
    }

    /// Bind a token and sync to disk.
    pub fn set(&mut self, token: &str, account_id: u32) {
        self.entries.insert(token.to_string(), account_id);
        match serde_json::to_string_pretty(&self.entries) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.path, raw) {
                    warn!(path = %self.path.display(), error = %e, "Failed to sync token store");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize token store"),
        }
    }
}
