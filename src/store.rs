//! Backup store and template registry
//!
//! The store is a plain directory tree, `STORE/<profile>/<version>.<ext>`,
//! where `<ext>` is `tar.gz` or `tar.zst`, optionally followed by `.gpg`.
//! Versions are ordered oldest first by the timestamp embedded in their name
//! (`%Y%m%d-%H%M%S`), falling back to modification time and then to name.
//!
//! Templates are named archives kept in a flat directory and restored by
//! name instead of by profile/version.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BackmeyError, Result};
use crate::types::Compression;

/// Format of generated version names
pub const VERSION_FORMAT: &str = "%Y%m%d-%H%M%S";

const ARCHIVE_EXTENSIONS: &[&str] = &["tar.gz.gpg", "tar.zst.gpg", "tar.gz", "tar.zst"];

/// Keep alphanumerics, `-` and `_`; anything else is dropped.
/// An empty result becomes `"default"`.
pub fn sanitize_name(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

/// Timestamp-based version name for "now"
pub fn new_version_name() -> String {
    Local::now().format(VERSION_FORMAT).to_string()
}

/// Split a file name into (stem, extension) when it looks like an archive
pub fn split_archive_name(file_name: &str) -> Option<(&str, &str)> {
    ARCHIVE_EXTENSIONS.iter().find_map(|ext| {
        file_name
            .strip_suffix(ext)
            .and_then(|stem| stem.strip_suffix('.'))
            .filter(|stem| !stem.is_empty())
            .map(|stem| (stem, *ext))
    })
}

/// Whether a path names an encrypted archive
pub fn is_encrypted_path(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gpg")
}

/// One archive found in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArchive {
    pub path: PathBuf,
    pub profile: String,
    pub version: String,
    pub encrypted: bool,
    pub size: u64,
    sort_key: (DateTime<Local>, String),
}

impl StoredArchive {
    fn from_path(profile: &str, path: PathBuf) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?.to_string();
        let (stem, ext) = split_archive_name(&file_name)?;
        let metadata = fs::metadata(&path).ok()?;
        if !metadata.is_file() {
            return None;
        }

        let embedded = stem
            .get(..15)
            .and_then(|prefix| NaiveDateTime::parse_from_str(prefix, VERSION_FORMAT).ok())
            .and_then(|naive| Local.from_local_datetime(&naive).earliest());
        let when = embedded
            .or_else(|| metadata.modified().ok().map(DateTime::<Local>::from))
            .unwrap_or_default();

        Some(Self {
            profile: profile.to_string(),
            version: stem.to_string(),
            encrypted: ext.ends_with("gpg"),
            size: metadata.len(),
            sort_key: (when, file_name.clone()),
            path,
        })
    }

    pub fn file_name(&self) -> String {
        self.sort_key.1.clone()
    }
}

/// Directory tree of versioned archives, one subdirectory per profile
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination for a new archive. Pure: nothing is created on disk.
    pub fn build_path(
        &self,
        profile: &str,
        version: Option<&str>,
        compression: Compression,
    ) -> PathBuf {
        let version = version
            .map(sanitize_name)
            .unwrap_or_else(new_version_name);
        self.root
            .join(sanitize_name(profile))
            .join(format!("{}.{}", version, compression.extension()))
    }

    /// All archives grouped by profile, each list oldest first.
    pub fn list(&self) -> Result<BTreeMap<String, Vec<StoredArchive>>> {
        let mut result = BTreeMap::new();
        if !self.root.is_dir() {
            return Ok(result);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let profile = entry.file_name().to_string_lossy().into_owned();
            let versions = self.versions(&profile)?;
            if !versions.is_empty() {
                result.insert(profile, versions);
            }
        }
        Ok(result)
    }

    /// Archives of one profile, oldest first
    pub fn versions(&self, profile: &str) -> Result<Vec<StoredArchive>> {
        let dir = self.root.join(sanitize_name(profile));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut archives: Vec<StoredArchive> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| StoredArchive::from_path(profile, e.path()))
            .collect();
        archives.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        Ok(archives)
    }

    pub fn latest(&self, profile: &str) -> Result<Option<StoredArchive>> {
        Ok(self.versions(profile)?.pop())
    }

    /// Locate an archive by profile and version.
    ///
    /// `None` or `"latest"` selects the newest. A version may be given with
    /// or without its archive extension.
    pub fn find(&self, profile: &str, version: Option<&str>) -> Result<StoredArchive> {
        let version = version.map(str::trim).filter(|v| !v.is_empty() && *v != "latest");
        let found = match version {
            None => self.latest(profile)?,
            Some(wanted) => {
                let stem = split_archive_name(wanted).map(|(s, _)| s).unwrap_or(wanted);
                self.versions(profile)?
                    .into_iter()
                    .rev()
                    .find(|a| a.file_name() == wanted || a.version == sanitize_name(stem))
            }
        };
        found.ok_or_else(|| {
            BackmeyError::not_found(format!(
                "No backup for profile '{}'{} in {}",
                profile,
                version.map(|v| format!(" version '{}'", v)).unwrap_or_default(),
                self.root.display()
            ))
        })
    }
}

/// Flat directory of named template archives
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    root: PathBuf,
}

impl TemplateRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `archive` into the registry under `name`, keeping its extension.
    pub fn register(&self, name: &str, archive: &Path) -> Result<PathBuf> {
        if !archive.is_file() {
            return Err(BackmeyError::not_found(format!(
                "Archive not found: {}",
                archive.display()
            )));
        }
        let file_name = archive
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let ext = split_archive_name(file_name)
            .map(|(_, ext)| ext)
            .ok_or_else(|| {
                BackmeyError::validation(format!(
                    "Not a backmey archive (expected .tar.gz or .tar.zst): {}",
                    archive.display()
                ))
            })?;

        fs::create_dir_all(&self.root)?;
        let safe = sanitize_name(name);
        // a template name maps to exactly one file
        for old in self.list()?.into_iter().filter(|(n, _)| *n == safe) {
            fs::remove_file(old.1)?;
        }
        let dest = self.root.join(format!("{}.{}", safe, ext));
        fs::copy(archive, &dest)?;
        tracing::info!("Template '{}' registered at {}", safe, dest.display());
        Ok(dest)
    }

    /// Path of a registered template
    pub fn find(&self, name: &str) -> Result<PathBuf> {
        let safe = sanitize_name(name);
        self.list()?
            .into_iter()
            .find(|(n, _)| *n == safe)
            .map(|(_, p)| p)
            .ok_or_else(|| {
                BackmeyError::not_found(format!(
                    "Template '{}' not found in {}",
                    name,
                    self.root.display()
                ))
            })
    }

    /// `(name, path)` of every template, sorted by name
    pub fn list(&self) -> Result<Vec<(String, PathBuf)>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut templates: Vec<(String, PathBuf)> = fs::read_dir(&self.root)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_string();
                let (stem, _) = split_archive_name(&name)?;
                Some((stem.to_string(), e.path()))
            })
            .collect();
        templates.sort();
        Ok(templates)
    }
}
