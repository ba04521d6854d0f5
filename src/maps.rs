//! Map discovery: every immediate subdirectory of the save folder is a map.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Names of the immediate subdirectories of `root`, sorted.
/// An empty path or a path that is not a directory yields no maps.
pub fn list_maps(root: &Path) -> Result<Vec<String>> {
    if root.as_os_str().is_empty() || !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut maps = Vec::new();
    for entry in std::fs::read_dir(root).with_context(|| format!("read {}", root.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", root.display()))?;
        // Follows symlinks, so linked worlds show up too.
        if entry.path().is_dir() {
            maps.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    maps.sort_by_key(|name| name.to_lowercase());
    Ok(maps)
}

/// Standard Minecraft save locations, checked in order.
pub fn default_saves_folder(home: &Path) -> Option<PathBuf> {
    [
        home.join(".minecraft").join("saves"),
        home.join("AppData")
            .join("Roaming")
            .join(".minecraft")
            .join("saves"),
    ]
    .into_iter()
    .find(|p| p.is_dir())
}

pub fn default_output_folder(home: &Path) -> PathBuf {
    home.join("MinecraftMaps")
}
