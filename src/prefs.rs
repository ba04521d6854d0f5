//! Persisted settings: save folder, output folder and Overviewer executable.

use crate::model::RunRequest;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "overviewer-tui";
const PREFS_FILE: &str = "prefs.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefs {
    #[serde(default)]
    pub saves_folder: String,
    #[serde(default)]
    pub output_folder: String,
    #[serde(default)]
    pub executable: String,
}

impl Prefs {
    /// First-launch values derived from the user's home directory.
    pub fn defaults_for(home: Option<&Path>) -> Self {
        let Some(home) = home else {
            return Self::default();
        };
        Self {
            saves_folder: crate::maps::default_saves_folder(home)
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            output_folder: crate::maps::default_output_folder(home)
                .display()
                .to_string(),
            executable: String::new(),
        }
    }

    /// Fill empty fields from `defaults`.
    pub fn or_defaults(mut self, defaults: &Prefs) -> Self {
        if self.saves_folder.is_empty() {
            self.saves_folder = defaults.saves_folder.clone();
        }
        if self.output_folder.is_empty() {
            self.output_folder = defaults.output_folder.clone();
        }
        if self.executable.is_empty() {
            self.executable = defaults.executable.clone();
        }
        self
    }

    pub fn request(&self, map: &str) -> RunRequest {
        RunRequest::new(
            map,
            self.executable.trim(),
            self.saves_folder.trim(),
            self.output_folder.trim(),
        )
    }
}

pub fn default_prefs_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join(PREFS_FILE))
}

/// Load prefs from `path`. A missing file is not an error.
pub fn load(path: &Path) -> Result<Option<Prefs>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let prefs = serde_json::from_slice(&data).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(prefs))
}

/// Write prefs atomically (temp file + rename).
pub fn save(path: &Path, prefs: &Prefs) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(prefs)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
