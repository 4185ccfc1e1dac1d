//! World topology: zone classification and street visibility.
//!
//! Zone ids follow the hood numbering scheme: each playground is a
//! multiple of 1000, its streets occupy the 100-blocks above it, and
//! within a street the low two digits address individual vis groups.
//! The quiet zone is the sentinel every client keeps interest in.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

/// Sentinel zone that never carries player avatars to clients.
pub const QUIET_ZONE: u32 = 1;

/// Playgrounds stand alone: whole multiples of 1000.
#[inline]
pub fn is_playground(zone: u32) -> bool {
    zone != 0 && zone % 1000 == 0
}

/// Streets compose multiple visible sub-zones; anything in a hood's
/// 100-blocks that is not the playground itself.
#[inline]
pub fn is_street(zone: u32) -> bool {
    zone > QUIET_ZONE && !is_playground(zone) && zone % 1000 >= 100
}

/// The street branch a zone belongs to: low two digits discarded.
#[inline]
pub fn branch_zone(zone: u32) -> u32 {
    zone - zone % 100
}

/// Vis-group assignments of one street branch.
#[derive(Debug, Clone, Default)]
pub struct BranchVisibility {
    zones: HashMap<u32, Vec<u32>>,
}

impl BranchVisibility {
    pub fn new(zones: HashMap<u32, Vec<u32>>) -> Self {
        Self { zones }
    }

    /// Zones visible from `zone`, or `None` when the branch has no entry.
    pub fn visible_from(&self, zone: u32) -> Option<&[u32]> {
        self.zones.get(&zone).map(|v| v.as_slice())
    }
}

/// Source of per-branch visibility data.
pub trait VisibilityProvider: Send + Sync {
    /// Load the vis groups of one street branch.
    fn branch(&self, branch_zone: u32) -> Option<BranchVisibility>;
}

/// In-memory provider; tests and the no-street default.
#[derive(Default)]
pub struct StaticVisibilityProvider {
    branches: HashMap<u32, BranchVisibility>,
}

impl StaticVisibilityProvider {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_branch(mut self, branch: u32, zones: HashMap<u32, Vec<u32>>) -> Self {
        self.branches.insert(branch, BranchVisibility::new(zones));
        self
    }
}

impl VisibilityProvider for StaticVisibilityProvider {
    fn branch(&self, branch_zone: u32) -> Option<BranchVisibility> {
        self.branches.get(&branch_zone).cloned()
    }
}

/// File-backed provider: one `<branch>.toml` per street branch under the
/// configured directory, each mapping a zone id to its visible zones.
pub struct FileVisibilityProvider {
    directory: PathBuf,
}

#[derive(Deserialize)]
struct BranchFile {
    #[serde(default)]
    vis: HashMap<String, Vec<u32>>,
}

impl FileVisibilityProvider {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into() }
    }
}

impl VisibilityProvider for FileVisibilityProvider {
    fn branch(&self, branch_zone: u32) -> Option<BranchVisibility> {
        let path = self.directory.join(format!("{branch_zone}.toml"));
        let raw = std::fs::read_to_string(&path).ok()?;
        let file: BranchFile = match toml::from_str(&raw) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed visibility file");
                return None;
            }
        };

        let mut zones = HashMap::new();
        for (key, visibles) in file.vis {
            match key.parse::<u32>() {
                Ok(zone) => {
                    zones.insert(zone, visibles);
                }
                Err(_) => {
                    warn!(path = %path.display(), key, "Non-numeric zone key in visibility file");
                }
            }
        }
        Some(BranchVisibility::new(zones))
    }
}

/// Build the configured provider.
pub fn provider_from_config(dna_directory: Option<&str>) -> Arc<dyn VisibilityProvider> {
    match dna_directory {
        Some(dir) => Arc::new(FileVisibilityProvider::new(dir)),
        None => Arc::new(StaticVisibilityProvider::empty()),
    }
}
