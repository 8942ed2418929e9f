//! Archiver
//!
//! Builds one compressed tar archive from the selected components:
//!
//! 1. component patterns and `--include` paths are expanded into roots
//! 2. every root is walked (symlinks are archived as links, never followed)
//!    and filtered through [`ExcludeFilter`]
//! 3. the manifest is written as the first entry, then `dconf.ini`, then
//!    `home/<relative path>` for every file, directory and link
//!
//! Output goes to a temporary file next to the destination and is renamed
//! into place only after the compressor has been finished and synced, so a
//! failed run never leaves a truncated archive behind.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use crate::components::{is_glob, ComponentRegistry, CUSTOM_COMPONENT};
use crate::crypto::{GpgAdapter, Passphrase};
use crate::detect::Detection;
use crate::error::{BackmeyError, Result};
use crate::manifest::{Manifest, ManifestEntry, DCONF_NAME, HOME_PREFIX, MANIFEST_NAME};
use crate::packages::{canonicalize, collect_installed, PackageManager};
use crate::process::{run_captured, tool_exists, ScratchGuard};
use crate::report::{size_report, BackupSummary};
use crate::store::{new_version_name, sanitize_name, BackupStore};
use crate::types::Compression;

/// Directory names dropped by `--smart-exclude`, matched per path component
pub const SMART_EXCLUDES: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".git",
    ".venv",
    "venv",
    ".idea",
    ".vscode",
    ".mypy_cache",
    ".pytest_cache",
    "target",
    "dist",
    "build",
    ".cache",
    "Steam",
    "Trash",
    // browser profile caches
    "cache2",
    "Cache",
    "Code Cache",
    "GPUCache",
    "ShaderCache",
];

/// Home-relative subtrees dropped by `--smart-exclude`
pub const SMART_EXCLUDE_PATHS: &[&str] = &[
    ".local/share/Steam",
    ".local/share/Trash",
    ".local/share/containers",
    ".local/share/docker",
];

/// Decides which home-relative paths stay out of the archive
#[derive(Debug, Clone)]
pub struct ExcludeFilter {
    literals: Vec<String>,
    globs: GlobSet,
    smart: bool,
    subtrees: Vec<PathBuf>,
}

impl ExcludeFilter {
    /// Patterns containing `*?[{` are globs, anything else is a substring.
    pub fn new<S: AsRef<str>>(patterns: &[S], smart: bool) -> Result<Self> {
        let mut literals = Vec::new();
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns.iter().map(AsRef::as_ref).filter(|p| !p.is_empty()) {
            if is_glob(pattern) {
                let glob = Glob::new(pattern).map_err(|e| {
                    BackmeyError::validation(format!("Invalid exclude pattern {}: {}", pattern, e))
                })?;
                builder.add(glob);
            } else {
                literals.push(pattern.to_string());
            }
        }
        let globs = builder
            .build()
            .map_err(|e| BackmeyError::validation(format!("Invalid exclude patterns: {}", e)))?;
        let subtrees = if smart {
            SMART_EXCLUDE_PATHS.iter().map(PathBuf::from).collect()
        } else {
            Vec::new()
        };
        Ok(Self { literals, globs, smart, subtrees })
    }

    /// Always drop everything below `rel`
    pub fn exclude_subtree(mut self, rel: impl Into<PathBuf>) -> Self {
        self.subtrees.push(rel.into());
        self
    }

    pub fn is_excluded(&self, rel: &Path) -> bool {
        if self.subtrees.iter().any(|s| rel.starts_with(s)) {
            return true;
        }
        if self.smart
            && rel
                .components()
                .any(|c| SMART_EXCLUDES.iter().any(|s| c.as_os_str() == *s))
        {
            return true;
        }
        let text = rel.to_string_lossy();
        if self.literals.iter().any(|l| text.contains(l.as_str())) {
            return true;
        }
        self.globs.is_match(rel) || rel.file_name().is_some_and(|name| self.globs.is_match(name))
    }
}

/// Options of one backup run
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub profile: String,
    pub version: Option<String>,
    /// Explicit archive path instead of the store layout
    pub output: Option<PathBuf>,
    /// Component names; empty selects the components suggested for the
    /// detected desktop
    pub components: Vec<String>,
    pub with_browser_profiles: bool,
    pub includes: Vec<PathBuf>,
    pub excludes: Vec<String>,
    pub smart_exclude: bool,
    pub notes: Option<String>,
    pub encrypt: bool,
    pub skip_dconf: bool,
    pub no_packages: bool,
    pub report_sizes: bool,
    pub dry_run: bool,
    pub compression: Compression,
    pub sync_command: Option<String>,
}

/// A top-level path selected for archiving
#[derive(Debug, Clone, PartialEq, Eq)]
struct Root {
    component: String,
    /// Path under `home/` in the archive
    rel: PathBuf,
    source: PathBuf,
}

/// One filesystem entry to archive
#[derive(Debug, Clone)]
struct Item {
    rel: PathBuf,
    source: PathBuf,
    size: u64,
    is_dir: bool,
}

/// Result of expanding and walking the selection
#[derive(Debug, Default)]
struct Scan {
    roots: Vec<Root>,
    items: Vec<Item>,
    entries: Vec<ManifestEntry>,
    component_sizes: BTreeMap<String, u64>,
    warnings: Vec<String>,
}

impl Scan {
    fn files(&self) -> u64 {
        self.items.iter().filter(|i| !i.is_dir).count() as u64
    }

    fn bytes(&self) -> u64 {
        self.items.iter().map(|i| i.size).sum()
    }

    fn component_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for root in &self.roots {
            if !names.contains(&root.component) {
                names.push(root.component.clone());
            }
        }
        names
    }
}

/// Produces archives from a home directory
pub struct Archiver<'a> {
    registry: &'a ComponentRegistry,
    home: PathBuf,
    store: BackupStore,
}

impl<'a> Archiver<'a> {
    pub fn new(registry: &'a ComponentRegistry, home: impl Into<PathBuf>, store: BackupStore) -> Self {
        Self {
            registry,
            home: home.into(),
            store,
        }
    }

    /// Run a backup and return its summary.
    ///
    /// With `dry_run` nothing is written and no directory is created; the
    /// summary describes the archive that would have been produced.
    pub fn run(
        &self,
        opts: &BackupOptions,
        detection: &Detection,
        managers: &[Box<dyn PackageManager>],
    ) -> Result<BackupSummary> {
        let profile = sanitize_name(&opts.profile);
        let version = opts
            .version
            .as_deref()
            .map(sanitize_name)
            .unwrap_or_else(new_version_name);
        let destination = self.destination(opts, &profile, &version);

        // fail before any work when encryption cannot succeed
        let sealing = if opts.encrypt && !opts.dry_run {
            Some((GpgAdapter::locate()?, Passphrase::from_env()?))
        } else {
            None
        };
        if !opts.dry_run && destination.exists() {
            return Err(BackmeyError::validation(format!(
                "Archive already exists: {}",
                destination.display()
            )));
        }

        tracing::info!("Collecting files for profile '{}'", profile);
        let scan = self.scan(opts, detection)?;
        if opts.report_sizes || opts.dry_run {
            print!("{}", size_report(&scan.component_sizes, scan.roots.len()));
        }

        let mut summary = BackupSummary {
            profile: profile.clone(),
            version: version.clone(),
            archive: destination.clone(),
            components: scan.component_names(),
            paths: scan.roots.len(),
            files: scan.files(),
            bytes_read: scan.bytes(),
            encrypted: opts.encrypt,
            dry_run: opts.dry_run,
            warnings: scan.warnings.clone(),
            ..Default::default()
        };
        if opts.dry_run {
            return Ok(summary);
        }

        let mut manifest = Manifest::new(&profile, &version, detection.clone());
        manifest.notes = opts.notes.clone();
        manifest.encrypted = opts.encrypt;
        manifest.components = scan.entries.clone();
        manifest.component_sizes = scan.component_sizes.clone();
        if !opts.no_packages {
            tracing::info!("Collecting installed packages");
            manifest.packages = collect_installed(managers);
            manifest.packages_canonical = canonicalize(&manifest.packages);
        }
        let dconf = if opts.skip_dconf {
            None
        } else {
            dump_dconf(&mut summary.warnings)
        };
        manifest.has_dconf = dconf.is_some();

        let dir = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        tracing::info!("Creating archive at {}", destination.display());
        let mut plain = tempfile::Builder::new()
            .prefix(".backmey-")
            .suffix(".partial")
            .tempfile_in(&dir)?;
        let _plain_guard = ScratchGuard::new(plain.path());
        write_archive(
            plain.as_file_mut(),
            opts.compression,
            &manifest,
            dconf.as_deref(),
            &scan.items,
            &mut summary.warnings,
        )?;

        let (finished, _sealed_guard) = match sealing {
            Some((gpg, passphrase)) => {
                tracing::info!("Encrypting archive");
                let sealed = tempfile::Builder::new()
                    .prefix(".backmey-")
                    .suffix(".gpg.partial")
                    .tempfile_in(&dir)?;
                let guard = ScratchGuard::new(sealed.path());
                gpg.encrypt(plain.path(), sealed.path(), &passphrase)?;
                drop(plain);
                (sealed, Some(guard))
            }
            None => (plain, None),
        };
        finished.persist_noclobber(&destination).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                BackmeyError::validation(format!("Archive already exists: {}", destination.display()))
            } else {
                BackmeyError::Io(e.error)
            }
        })?;

        summary.archive_bytes = fs::metadata(&destination)?.len();
        summary.packages = manifest.package_count();
        summary.packages_canonical = manifest.packages_canonical.len();
        summary.has_dconf = manifest.has_dconf;
        tracing::info!("Backup written to {}", destination.display());

        if let Some(command) = &opts.sync_command {
            run_sync_command(command, &destination, &mut summary.warnings);
        }
        Ok(summary)
    }

    fn destination(&self, opts: &BackupOptions, profile: &str, version: &str) -> PathBuf {
        let path = match &opts.output {
            Some(path) => path.clone(),
            None => self.store.build_path(profile, Some(version), opts.compression),
        };
        if opts.encrypt && path.extension().is_none_or(|e| e != "gpg") {
            let mut sealed = path.into_os_string();
            sealed.push(".gpg");
            PathBuf::from(sealed)
        } else {
            path
        }
    }

    fn filter(&self, opts: &BackupOptions) -> Result<ExcludeFilter> {
        let mut filter = ExcludeFilter::new(&opts.excludes, opts.smart_exclude)?;
        if let Ok(rel) = self.store.root().strip_prefix(&self.home) {
            if !rel.as_os_str().is_empty() {
                filter = filter.exclude_subtree(rel);
            }
        }
        Ok(filter)
    }

    fn roots(&self, opts: &BackupOptions, detection: &Detection, warnings: &mut Vec<String>) -> Result<Vec<Root>> {
        let mut names = if opts.components.is_empty() {
            detection.suggested_components()
        } else {
            opts.components.clone()
        };
        if opts.with_browser_profiles && !names.iter().any(|n| n == "browsers") {
            names.push("browsers".to_string());
        }

        let mut roots = Vec::new();
        for component in self.registry.select(&names)? {
            if let Some(kind) = component.requires {
                if !tool_exists(kind.binary()) {
                    tracing::warn!("{} not found, skipping component '{}'", kind, component.name);
                    continue;
                }
            }
            let found = component.expand(&self.home)?;
            if found.is_empty() {
                warnings.push(format!("Component '{}' matched no paths", component.name));
                continue;
            }
            roots.extend(found.into_iter().map(|rel| Root {
                component: component.name.clone(),
                source: self.home.join(&rel),
                rel,
            }));
        }

        for include in &opts.includes {
            match self.include_root(include) {
                Ok(root) => {
                    tracing::info!("Including custom path: {}", root.source.display());
                    roots.push(root);
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    warnings.push(e.to_string());
                }
            }
        }
        Ok(roots)
    }

    fn include_root(&self, path: &Path) -> Result<Root> {
        let source = match path.strip_prefix("~") {
            Ok(rest) => self.home.join(rest),
            Err(_) if path.is_relative() => std::env::current_dir()?.join(path),
            Err(_) => path.to_path_buf(),
        };
        if source.symlink_metadata().is_err() {
            return Err(BackmeyError::PathNotFound(source));
        }
        let rel = match source.strip_prefix(&self.home) {
            Ok(rel) if rel.as_os_str().is_empty() => {
                return Err(BackmeyError::validation(
                    "Refusing to include the whole home directory",
                ));
            }
            Ok(rel) => rel.to_path_buf(),
            Err(_) => source
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| BackmeyError::validation(format!("Cannot include {}", source.display())))?,
        };
        Ok(Root {
            component: CUSTOM_COMPONENT.to_string(),
            rel,
            source,
        })
    }

    fn scan(&self, opts: &BackupOptions, detection: &Detection) -> Result<Scan> {
        let filter = self.filter(opts)?;
        let mut scan = Scan::default();
        let roots = self.roots(opts, detection, &mut scan.warnings)?;

        let mut seen: HashSet<PathBuf> = HashSet::new();
        for root in roots {
            if filter.is_excluded(&root.rel) {
                tracing::debug!("Excluded {}", root.rel.display());
                continue;
            }
            if scan.roots.iter().any(|r| r.rel == root.rel) {
                continue;
            }
            let walker = WalkDir::new(&root.source)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !filter.is_excluded(&archive_rel(&root, e.path())));
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let msg = format!("Cannot read {}: {}", e.path().unwrap_or(&root.source).display(), e);
                        tracing::warn!("{}", msg);
                        scan.warnings.push(msg);
                        continue;
                    }
                };
                let rel = archive_rel(&root, entry.path());
                if !seen.insert(rel.clone()) {
                    continue;
                }
                let file_type = entry.file_type();
                let size = if file_type.is_file() {
                    entry.metadata().map(|m| m.len()).unwrap_or(0)
                } else {
                    0
                };
                scan.items.push(Item {
                    rel,
                    source: entry.path().to_path_buf(),
                    size,
                    is_dir: file_type.is_dir(),
                });
            }
            scan.roots.push(root);
        }

        // sizes go to the most specific root, matching restore-time lookup
        let mut root_sizes = vec![0u64; scan.roots.len()];
        for item in &scan.items {
            let owner = scan
                .roots
                .iter()
                .enumerate()
                .filter(|(_, r)| item.rel.starts_with(&r.rel))
                .max_by_key(|(_, r)| r.rel.components().count())
                .map(|(i, _)| i);
            if let Some(i) = owner {
                root_sizes[i] += item.size;
            }
        }
        for (root, size) in scan.roots.iter().zip(root_sizes) {
            *scan.component_sizes.entry(root.component.clone()).or_default() += size;
            scan.entries.push(ManifestEntry {
                component: root.component.clone(),
                path: root.rel.to_string_lossy().into_owned(),
                size,
                mode: root
                    .source
                    .symlink_metadata()
                    .ok()
                    .map(|m| m.permissions().mode() & 0o7777),
            });
        }
        tracing::debug!(
            "Scanned {} path(s), {} entries",
            scan.roots.len(),
            scan.items.len()
        );
        Ok(scan)
    }
}

fn archive_rel(root: &Root, path: &Path) -> PathBuf {
    match path.strip_prefix(&root.source) {
        Ok(rest) if !rest.as_os_str().is_empty() => root.rel.join(rest),
        _ => root.rel.clone(),
    }
}

fn write_archive(
    file: &mut fs::File,
    compression: Compression,
    manifest: &Manifest,
    dconf: Option<&[u8]>,
    items: &[Item],
    warnings: &mut Vec<String>,
) -> Result<()> {
    let file = match compression {
        Compression::Gzip => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            write_tar(encoder, manifest, dconf, items, warnings)?.finish()?
        }
        Compression::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(file, 0)?;
            write_tar(encoder, manifest, dconf, items, warnings)?.finish()?
        }
    };
    file.sync_all()?;
    Ok(())
}

fn write_tar<W: Write>(
    out: W,
    manifest: &Manifest,
    dconf: Option<&[u8]>,
    items: &[Item],
    warnings: &mut Vec<String>,
) -> Result<W> {
    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);

    let mtime = manifest.timestamp.max(0) as u64;
    append_bytes(&mut builder, MANIFEST_NAME, &manifest.to_json()?, mtime)?;
    if let Some(dump) = dconf {
        append_bytes(&mut builder, DCONF_NAME, dump, mtime)?;
    }

    let home = Path::new(HOME_PREFIX);
    for item in items {
        match builder.append_path_with_name(&item.source, home.join(&item.rel)) {
            Ok(()) => {}
            // unreadable or vanished sources fail before anything is written
            Err(e) if matches!(e.kind(), io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound) => {
                let msg = format!("Skipped {}: {}", item.source.display(), e);
                tracing::warn!("{}", msg);
                warnings.push(msg);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(builder.into_inner()?)
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8], mtime: u64) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    builder.append_data(&mut header, name, data)
}

/// `dconf dump /`, or `None` when dconf is missing or fails
fn dump_dconf(warnings: &mut Vec<String>) -> Option<Vec<u8>> {
    if !tool_exists("dconf") {
        tracing::debug!("dconf not installed, skipping settings dump");
        return None;
    }
    let result = run_captured(Command::new("dconf").args(["dump", "/"]), None)
        .and_then(|out| out.ensure_success("dconf dump").map(|_| out));
    match result {
        Ok(out) => {
            tracing::debug!("Saved dconf dump ({} bytes)", out.stdout.len());
            Some(out.stdout.into_bytes())
        }
        Err(e) => {
            let msg = format!("Failed to dump dconf settings: {}", e);
            tracing::warn!("{}", msg);
            warnings.push(msg);
            None
        }
    }
}

/// Run the post-backup hook through `sh -c`, `{archive}` replaced by the
/// archive path. Failure is only a warning.
fn run_sync_command(template: &str, archive: &Path, warnings: &mut Vec<String>) {
    let command = template.replace("{archive}", &archive.to_string_lossy());
    tracing::info!("Running sync command");
    let result = run_captured(Command::new("sh").arg("-c").arg(&command), None)
        .and_then(|out| out.ensure_success("sync command"));
    if let Err(e) = result {
        tracing::warn!("{}", e);
        warnings.push(e.to_string());
    }
}
