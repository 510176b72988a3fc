//! Fixed key/value set handed to downstream task configuration macros.
//! Built once from resolved state, immutable afterwards, persisted into the
//! workspace so restarted remote jobs can reload it without re-deriving.

use crate::input::InputManifest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

pub const VALUE_MAP_FILE: &str = "values.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMap {
    entries: BTreeMap<String, String>,
}

/// Build the map from the resolved input plus the modules actually enabled.
pub fn build_value_map(
    manifest: &InputManifest,
    physics_selection: bool,
    centrality: bool,
) -> ValueMap {
    let mut entries = BTreeMap::new();
    entries.insert(
        "period".to_string(),
        manifest.period.clone().unwrap_or_default(),
    );
    entries.insert(
        "dataType".to_string(),
        if manifest.is_mc { "MC" } else { "DATA" }.to_string(),
    );
    entries.insert(
        "mcDetails".to_string(),
        if manifest.is_embed { "EMBED" } else { "FULL" }.to_string(),
    );
    entries.insert(
        "physicsSelection".to_string(),
        if physics_selection { "YES" } else { "NO" }.to_string(),
    );
    entries.insert(
        "centrality".to_string(),
        if centrality { "YES" } else { "NO" }.to_string(),
    );
    ValueMap { entries }
}

impl ValueMap {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Inline rendering substituted for the map keyword in macro arguments.
    pub fn rendered(&self) -> String {
        let mut parts = Vec::with_capacity(self.entries.len());
        for (key, value) in &self.entries {
            parts.push(format!("{key}={value}"));
        }
        parts.join(",")
    }

    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(VALUE_MAP_FILE), text)
    }

    pub fn load(dir: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(dir.join(VALUE_MAP_FILE))?;
        serde_yaml::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
