//! Persistent settings and path layout.
//!
//! Settings live in a JSON file (`$BACKMEY_CONFIG`, else
//! `~/.backmey/config.json`). A missing file means defaults; a present but
//! malformed one is an error. Command-line flags override whatever is loaded.
//!
//! Home is `$BACKMEY_HOME` when set, otherwise the account's home directory.
//! Every default location hangs off `~/.backmey`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BackmeyError, Result};
use crate::types::Compression;

/// Environment variable overriding the home directory
pub const HOME_ENV: &str = "BACKMEY_HOME";
/// Environment variable pointing at an alternative settings file
pub const CONFIG_ENV: &str = "BACKMEY_CONFIG";

/// Default fuzzy-match acceptance threshold
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.85;

/// User-tunable settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Root of the backup store (`STORE/<profile>/<version>`)
    pub store_dir: Option<PathBuf>,
    /// Directory holding named template archives
    pub template_dir: Option<PathBuf>,
    /// Directory receiving pre-restore snapshots
    pub snapshot_dir: Option<PathBuf>,
    /// Minimum similarity for a fuzzy package substitution
    pub match_threshold: f64,
    /// Codec for new archives
    pub compression: Compression,
    /// Components selected when `--components` is not given; empty means
    /// "suggest from the detected desktop"
    pub default_components: Vec<String>,
    /// Exclude patterns applied to every backup
    pub extra_excludes: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_dir: None,
            template_dir: None,
            snapshot_dir: None,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            compression: Compression::Gzip,
            default_components: Vec::new(),
            extra_excludes: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings for `home`, honouring `$BACKMEY_CONFIG`.
    pub fn load(home: &Path) -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_config_path(home));
        Self::load_or_default(&path, home)
    }

    /// Load from `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path, home: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let mut settings = Self::load_from_file(path)?;
        settings.expand_paths(home);
        settings.validate()?;
        tracing::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            BackmeyError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BackmeyError::config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.match_threshold) || self.match_threshold.is_nan() {
            return Err(BackmeyError::config(format!(
                "match_threshold must be between 0 and 1, got {}",
                self.match_threshold
            )));
        }
        if let Some(bad) = self.default_components.iter().find(|c| c.trim().is_empty()) {
            return Err(BackmeyError::config(format!(
                "default_components contains an empty entry: {:?}",
                bad
            )));
        }
        Ok(())
    }

    /// Resolve `~/` prefixes against `home`
    fn expand_paths(&mut self, home: &Path) {
        for dir in [&mut self.store_dir, &mut self.template_dir, &mut self.snapshot_dir] {
            if let Some(p) = dir.take() {
                *dir = Some(expand_tilde(&p, home));
            }
        }
    }

    pub fn store_dir(&self, home: &Path) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| backmey_dir(home).join("backups"))
    }

    pub fn template_dir(&self, home: &Path) -> PathBuf {
        self.template_dir
            .clone()
            .unwrap_or_else(|| backmey_dir(home).join("templates"))
    }

    pub fn snapshot_dir(&self, home: &Path) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| backmey_dir(home).join("snapshots"))
    }
}

/// Resolve the home directory backups are taken from and restored into.
pub fn resolve_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| BackmeyError::config("Could not determine home directory; set BACKMEY_HOME"))
}

/// `~/.backmey`
pub fn backmey_dir(home: &Path) -> PathBuf {
    home.join(".backmey")
}

pub fn default_config_path(home: &Path) -> PathBuf {
    backmey_dir(home).join("config.json")
}

fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}
