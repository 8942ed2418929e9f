//! Archive manifest and inspection
//!
//! Every archive starts with a `manifest.json` entry describing its
//! contents. Because it is the first tar entry, [`read_manifest`] can return
//! it after decompressing only the head of the stream; file contents are
//! never unpacked.
//!
//! Compression is sniffed from magic bytes, so `.tar.gz` and `.tar.zst`
//! archives are read the same way regardless of their file name.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::detect::Detection;
use crate::error::{BackmeyError, Result};
use crate::types::{Compression, PackageManagerKind};

/// Name of the manifest entry at the archive root
pub const MANIFEST_NAME: &str = "manifest.json";
/// Name of the optional dconf dump at the archive root
pub const DCONF_NAME: &str = "dconf.ini";
/// Directory under which home-relative files are stored
pub const HOME_PREFIX: &str = "home";

pub const SCHEMA_VERSION: u32 = 1;

/// One archived top-level path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub component: String,
    /// Home-relative path as stored under `home/`
    pub path: String,
    /// Bytes archived below this path
    pub size: u64,
    /// Permission bits of the path itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Metadata written as the first entry of every archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub created_at: DateTime<Local>,
    /// Seconds since the epoch, for consumers that prefer integers
    pub timestamp: i64,
    pub profile: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub detection: Detection,
    #[serde(default)]
    pub components: Vec<ManifestEntry>,
    #[serde(default)]
    pub component_sizes: BTreeMap<String, u64>,
    #[serde(default)]
    pub packages: BTreeMap<PackageManagerKind, Vec<String>>,
    #[serde(default)]
    pub packages_canonical: Vec<String>,
    #[serde(default)]
    pub has_dconf: bool,
}

impl Manifest {
    pub fn new(profile: &str, version: &str, detection: Detection) -> Self {
        let now = Local::now();
        Self {
            schema_version: SCHEMA_VERSION,
            created_at: now,
            timestamp: now.timestamp(),
            profile: profile.to_string(),
            version: version.to_string(),
            notes: None,
            encrypted: false,
            detection,
            components: Vec::new(),
            component_sizes: BTreeMap::new(),
            packages: BTreeMap::new(),
            packages_canonical: Vec::new(),
            has_dconf: false,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.component_sizes.values().sum()
    }

    pub fn package_count(&self) -> usize {
        self.packages.values().map(Vec::len).sum()
    }

    /// Distinct component names, in manifest order
    pub fn component_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for entry in &self.components {
            if !names.contains(&entry.component.as_str()) {
                names.push(&entry.component);
            }
        }
        names
    }

    /// Component that archived `rel`, by longest entry path prefix
    pub fn component_for(&self, rel: &Path) -> Option<&str> {
        self.components
            .iter()
            .filter(|e| rel.starts_with(&e.path))
            .max_by_key(|e| e.path.len())
            .map(|e| e.component.as_str())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| BackmeyError::corrupt(format!("Unreadable manifest: {}", e)))
    }
}

/// Open a plaintext archive as a tar stream, detecting its compression.
pub fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            BackmeyError::not_found(format!("Archive not found: {}", path.display()))
        }
        _ => BackmeyError::Io(e),
    })?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    let n = read_up_to(&mut reader, &mut magic)?;
    let head = std::io::Cursor::new(magic[..n].to_vec());
    let stream = head.chain(reader);

    let decoder: Box<dyn Read> = match Compression::from_magic(&magic[..n]) {
        Some(Compression::Gzip) => Box::new(flate2::read::GzDecoder::new(stream)),
        Some(Compression::Zstd) => Box::new(
            zstd::stream::read::Decoder::new(stream)
                .map_err(|e| BackmeyError::corrupt(format!("{}: {}", path.display(), e)))?,
        ),
        None if magic.starts_with(b"\x8c\x0d") || magic.starts_with(b"\xc3\x0d") => {
            return Err(BackmeyError::encryption(format!(
                "{} is encrypted; decrypt it first",
                path.display()
            )));
        }
        None => {
            return Err(BackmeyError::corrupt(format!(
                "{} is not a gzip or zstd archive",
                path.display()
            )));
        }
    };
    Ok(tar::Archive::new(decoder))
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Read the manifest of a plaintext archive without unpacking files.
pub fn read_manifest(path: &Path) -> Result<Manifest> {
    let mut archive = open_archive(path)?;
    let corrupt = |e: std::io::Error| BackmeyError::corrupt(format!("{}: {}", path.display(), e));

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let is_manifest = entry
            .path()
            .map(|p| p.as_os_str() == MANIFEST_NAME)
            .map_err(corrupt)?;
        if is_manifest {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).map_err(corrupt)?;
            return Manifest::from_json(&bytes);
        }
    }
    Err(BackmeyError::corrupt(format!(
        "{} has no {}",
        path.display(),
        MANIFEST_NAME
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn sample() -> Manifest {
        let mut m = Manifest::new("work", "20240101-000000", Detection::default());
        m.notes = Some("before reinstall".into());
        m.components.push(ManifestEntry {
            component: "shells".into(),
            path: ".bashrc".into(),
            size: 10,
            mode: Some(0o644),
        });
        m.components.push(ManifestEntry {
            component: "configs".into(),
            path: ".config".into(),
            size: 90,
            mode: None,
        });
        m.component_sizes.insert("shells".into(), 10);
        m.component_sizes.insert("configs".into(), 90);
        m.packages.insert(PackageManagerKind::Apt, vec!["firefox-esr".into()]);
        m
    }

    fn write_archive(path: &Path, manifest: &Manifest, zstd: bool) {
        let file = File::create(path).unwrap();
        let writer: Box<dyn Write> = if zstd {
            Box::new(zstd::stream::write::Encoder::new(file, 3).unwrap().auto_finish())
        } else {
            Box::new(flate2::write::GzEncoder::new(file, flate2::Compression::default()))
        };
        let mut builder = tar::Builder::new(writer);
        let json = manifest.to_json().unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, MANIFEST_NAME, json.as_slice()).unwrap();
        builder.into_inner().unwrap().flush().unwrap();
    }

    #[test]
    fn test_manifest_json_keys() {
        let json = String::from_utf8(sample().to_json().unwrap()).unwrap();
        assert!(json.contains("\"apt\""));
        assert!(json.contains("\"component_sizes\""));
        assert!(json.contains("\"notes\": \"before reinstall\""));
    }

    #[test]
    fn test_helpers() {
        let m = sample();
        assert_eq!(m.total_size(), 100);
        assert_eq!(m.package_count(), 1);
        assert_eq!(m.component_names(), ["shells", "configs"]);
        assert_eq!(m.component_for(Path::new(".config/kitty/kitty.conf")), Some("configs"));
        assert_eq!(m.component_for(Path::new(".bashrc")), Some("shells"));
        assert_eq!(m.component_for(Path::new("Documents")), None);
    }

    #[test]
    fn test_read_manifest_gzip_and_zstd() {
        let dir = TempDir::new().unwrap();
        let m = sample();
        for (name, zstd) in [("a.tar.gz", false), ("a.tar.zst", true)] {
            let path = dir.path().join(name);
            write_archive(&path, &m, zstd);
            assert_eq!(read_manifest(&path).unwrap(), m);
        }
    }

    #[test]
    fn test_compression_sniffed_not_named() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("misnamed.tar.gz");
        write_archive(&path, &sample(), true);
        assert_eq!(read_manifest(&path).unwrap().profile, "work");
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.tar.gz");
        std::fs::write(&path, b"definitely not an archive").unwrap();
        assert!(matches!(read_manifest(&path), Err(BackmeyError::ArchiveCorrupt(_))));
    }

    #[test]
    fn test_truncated_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.tar.gz");
        write_archive(&path, &sample(), false);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..12]).unwrap();
        assert!(matches!(read_manifest(&path), Err(BackmeyError::ArchiveCorrupt(_))));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        assert!(matches!(
            read_manifest(Path::new("/nonexistent/x.tar.gz")),
            Err(BackmeyError::NotFound(_))
        ));
    }
}
