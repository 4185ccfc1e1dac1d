//! Pattern-name composition.
//!
//! A pattern name is four indices into the name-part dictionary (title,
//! first, last prefix, last suffix) each with a capitalization flag. The
//! two last-name halves join without a space.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

pub struct NameDictionary {
    parts: BTreeMap<u16, String>,
}

#[derive(Deserialize)]
struct PartsFile {
    #[serde(default)]
    parts: BTreeMap<String, String>,
}

impl NameDictionary {
    /// The small built-in dictionary; enough for a fresh install.
    pub fn builtin() -> Self {
        let mut parts = BTreeMap::new();
        for (index, part) in [
            // Titles.
            (0u16, "professor"),
            (1, "captain"),
            (2, "doctor"),
            (3, "master"),
            // First names.
            (1000, "flip"),
            (1001, "skipper"),
            (1002, "ziggy"),
            (1003, "daffodil"),
            // Last-name prefixes.
            (2000, "wacky"),
            (2001, "thunder"),
            (2002, "glitter"),
            // Last-name suffixes.
            (3000, "muddle"),
            (3001, "boom"),
            (3002, "sprinkle"),
        ] {
            parts.insert(index, part.to_string());
        }
        Self { parts }
    }

    /// Builtin dictionary extended by an operator-supplied TOML file.
    pub fn load(path: Option<&Path>) -> Self {
        let mut dict = Self::builtin();
        let Some(path) = path else {
            return dict;
        };
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read name-parts file");
                return dict;
            }
        };
        match toml::from_str::<PartsFile>(&raw) {
            Ok(file) => {
                for (key, part) in file.parts {
                    match key.parse::<u16>() {
                        Ok(index) => {
                            dict.parts.insert(index, part);
                        }
                        Err(_) => warn!(key, "Non-numeric name-part index"),
                    }
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Malformed name-parts file"),
        }
        dict
    }

    /// Compose a display name from a 4-tuple pattern of (index, capitalize).
    pub fn compose(&self, pattern: &[(u16, u16); 4]) -> String {
        let mut parts: Vec<String> = pattern
            .iter()
            .map(|(index, flag)| {
                let part = self.parts.get(index).cloned().unwrap_or_default();
                if *flag != 0 { capitalize(&part) } else { part.to_lowercase() }
            })
            .collect();

        // The last name halves fuse without a space.
        let suffix = parts.pop().unwrap_or_default();
        parts[2].push_str(&suffix);

        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }
}

fn capitalize(part: &str) -> String {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
