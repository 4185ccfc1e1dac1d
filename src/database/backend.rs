//! File-per-object JSON persistence.
//!
//! Each stored object is one `<doId><extension>` file holding its class
//! name, id, and field values; a singleton tracker file records the next
//! free object id so allocation survives restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dclass::FieldValue;

/// A stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbObject {
    pub dclass: String,
    pub do_id: u32,
    pub fields: BTreeMap<String, Vec<FieldValue>>,
}

#[derive(Serialize, Deserialize)]
struct Tracker {
    next: u32,
}

pub struct JsonBackend {
    directory: PathBuf,
    extension: String,
    tracker: String,
}

impl JsonBackend {
    pub fn open(
        directory: impl Into<PathBuf>,
        extension: &str,
        tracker: &str,
    ) -> anyhow::Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory, extension: extension.to_string(), tracker: tracker.to_string() })
    }

    fn object_path(&self, do_id: u32) -> PathBuf {
        self.directory.join(format!("{}{}", do_id, self.extension))
    }

    fn tracker_path(&self) -> PathBuf {
        self.directory.join(format!("{}{}", self.tracker, self.extension))
    }

    pub fn exists(&self, do_id: u32) -> bool {
        self.object_path(do_id).exists()
    }

    pub fn load(&self, do_id: u32) -> Option<DbObject> {
        let path = self.object_path(do_id);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(obj) => Some(obj),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt object file");
                None
            }
        }
    }

    pub fn save(&self, obj: &DbObject) -> anyhow::Result<()> {
        let path = self.object_path(obj.do_id);
        write_json(&path, obj)?;
        debug!(do_id = obj.do_id, "Object persisted");
        Ok(())
    }

    /// The persisted next-free id, if a tracker file exists.
    pub fn next_id(&self) -> Option<u32> {
        let raw = std::fs::read_to_string(self.tracker_path()).ok()?;
        serde_json::from_str::<Tracker>(&raw).ok().map(|t| t.next)
    }

    pub fn set_next_id(&self, next: u32) {
        if let Err(e) = write_json(&self.tracker_path(), &Tracker { next }) {
            warn!(error = %e, "Failed to persist id tracker");
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(value)?;
    std::fs::write(path, raw)?;
    Ok(())
}
