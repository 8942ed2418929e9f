//! Restorer
//!
//! A restore runs in fixed phases and writes nothing into home until every
//! earlier phase has succeeded:
//!
//! 1. locate the archive (explicit path, template, or store) and decrypt it
//!    into a private temporary directory when it is a `.gpg`
//! 2. unpack `home/` entries into a staging directory (unsafe paths are
//!    rejected) and classify every target as new, identical or conflicting
//! 3. apply the conflict policy; a non-interactive run without `--yes` or
//!    `--skip-conflicts` stops here with [`BackmeyError::Conflict`]
//! 4. snapshot conflicting targets, then copy files, links and modes
//! 5. load `dconf.ini` and plan (or run) package installation
//!
//! Dry runs stop after phase 3 and report what phase 4 would have done.

use chrono::Local;
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component as PathComponent, Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use crate::components::{ComponentRegistry, CUSTOM_COMPONENT};
use crate::crypto::{DecryptedArchive, GpgAdapter, Passphrase};
use crate::error::{BackmeyError, Result};
use crate::manifest::{open_archive, read_manifest, Manifest, DCONF_NAME, HOME_PREFIX};
use crate::packages::{is_root, InstallPlan, OsRelease, PackageManager, SmartResolver};
use crate::process::{run_captured, tool_exists, ScratchGuard};
use crate::report::{PackageSummary, RestoreSummary};
use crate::store::{is_encrypted_path, BackupStore, TemplateRegistry, VERSION_FORMAT};

/// Where the archive to restore comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    Path(PathBuf),
    Template(String),
    Stored { profile: String, version: Option<String> },
}

impl ArchiveSource {
    pub fn locate(&self, store: &BackupStore, templates: &TemplateRegistry) -> Result<PathBuf> {
        match self {
            Self::Path(path) if path.is_file() => Ok(path.clone()),
            Self::Path(path) => Err(BackmeyError::not_found(format!(
                "Archive not found: {}",
                path.display()
            ))),
            Self::Template(name) => templates.find(name),
            Self::Stored { profile, version } => {
                store.find(profile, version.as_deref()).map(|a| a.path)
            }
        }
    }
}

/// A readable plaintext archive. Decrypted copies are deleted on drop.
#[derive(Debug)]
pub struct PlainArchive {
    path: PathBuf,
    _decrypted: Option<DecryptedArchive>,
}

impl PlainArchive {
    /// Decrypt `path` with `BACKMEY_PASSPHRASE` when it is a `.gpg` archive.
    pub fn open(path: &Path) -> Result<Self> {
        if !is_encrypted_path(path) {
            return Ok(Self {
                path: path.to_path_buf(),
                _decrypted: None,
            });
        }
        let passphrase = Passphrase::from_env()?;
        let decrypted = GpgAdapter::locate()?.decrypt_to_temp(path, &passphrase)?;
        Ok(Self {
            path: decrypted.path().to_path_buf(),
            _decrypted: Some(decrypted),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What to do with targets that exist and differ from the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Overwrite,
    Skip,
    /// Ask on the terminal
    Prompt,
    /// Stop before writing anything
    Abort,
}

impl ConflictPolicy {
    /// `--skip-conflicts` wins over `--yes`
    pub fn from_flags(yes: bool, skip_conflicts: bool, interactive: bool) -> Self {
        if skip_conflicts {
            Self::Skip
        } else if yes {
            Self::Overwrite
        } else if interactive {
            Self::Prompt
        } else {
            Self::Abort
        }
    }
}

/// Options of one restore run
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Restrict to these components; empty restores everything
    pub components: Vec<String>,
    pub policy: ConflictPolicy,
    pub dry_run: bool,
    /// Where conflicting files are copied before being overwritten;
    /// `None` disables snapshots
    pub snapshot_dir: Option<PathBuf>,
    pub skip_dconf: bool,
    pub install_packages: bool,
    pub install_dry_run: bool,
    pub assume_yes: bool,
    pub match_threshold: f64,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            components: Vec::new(),
            policy: ConflictPolicy::Abort,
            dry_run: false,
            snapshot_dir: None,
            skip_dconf: false,
            install_packages: false,
            install_dry_run: false,
            assume_yes: false,
            match_threshold: crate::config::DEFAULT_MATCH_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Identical,
    Conflict,
}

/// One unpacked archive entry
#[derive(Debug, Clone)]
struct Staged {
    rel: PathBuf,
    kind: Kind,
    mode: u32,
    owner: Option<(u32, u32)>,
    link: Option<PathBuf>,
    size: u64,
    component: String,
    state: State,
}

/// Restores archives into a home directory
pub struct Restorer<'a> {
    registry: &'a ComponentRegistry,
    home: PathBuf,
}

impl<'a> Restorer<'a> {
    pub fn new(registry: &'a ComponentRegistry, home: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            home: home.into(),
        }
    }

    pub fn run(
        &self,
        archive: &Path,
        opts: &RestoreOptions,
        managers: &[Box<dyn PackageManager>],
        release: OsRelease,
    ) -> Result<RestoreSummary> {
        tracing::info!("Restoring from {}", archive.display());
        let plain = PlainArchive::open(archive)?;
        let manifest = read_manifest(plain.path())?;
        self.check_components(&manifest, &opts.components)?;

        let mut summary = RestoreSummary {
            archive: archive.to_path_buf(),
            dry_run: opts.dry_run,
            ..Default::default()
        };

        let staging = tempfile::Builder::new().prefix("backmey-restore-").tempdir()?;
        let _staging_guard = ScratchGuard::new(staging.path());
        let mut staged = self.extract(plain.path(), &manifest, opts, &staging, &mut summary.warnings)?;
        drop(plain);
        self.classify(&staging, &mut staged)?;

        let conflicts: Vec<&Staged> = staged.iter().filter(|s| s.state == State::Conflict).collect();
        let policy = match (conflicts.is_empty(), opts.policy) {
            (true, _) => ConflictPolicy::Overwrite,
            (false, ConflictPolicy::Prompt) if !opts.dry_run => prompt(&conflicts)?,
            (false, ConflictPolicy::Abort) if !opts.dry_run => {
                return Err(BackmeyError::Conflict {
                    count: conflicts.len(),
                    first: conflicts[0].rel.display().to_string(),
                });
            }
            (false, ConflictPolicy::Abort | ConflictPolicy::Prompt) => {
                summary.warnings.push(format!(
                    "{} conflicting file(s) would stop a real run without --yes or --skip-conflicts",
                    conflicts.len()
                ));
                ConflictPolicy::Skip
            }
            (false, policy) => policy,
        };
        if policy == ConflictPolicy::Skip {
            for item in &conflicts {
                tracing::info!("Keeping existing {}", item.rel.display());
            }
        }

        summary.components = staged
            .iter()
            .map(|s| s.component.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for item in staged.iter().filter(|s| s.kind != Kind::Dir) {
            match (item.state, policy) {
                (State::Identical, _) => summary.identical += 1,
                (State::New, _) => {
                    summary.new_files += 1;
                    summary.bytes_restored += item.size;
                }
                (State::Conflict, ConflictPolicy::Overwrite) => {
                    summary.overwritten += 1;
                    summary.bytes_restored += item.size;
                }
                (State::Conflict, _) => summary.skipped += 1,
            }
        }

        if !opts.dry_run {
            let overwrite = policy == ConflictPolicy::Overwrite;
            if overwrite && summary.overwritten > 0 {
                if let Some(dir) = &opts.snapshot_dir {
                    summary.snapshot = Some(self.snapshot(dir, &staged)?);
                }
            }
            self.apply(&staging, &staged, overwrite, &mut summary.warnings);

            let dconf = staging.path().join(DCONF_NAME);
            if manifest.has_dconf && !opts.skip_dconf && dconf.is_file() {
                summary.dconf_loaded = load_dconf(&dconf, &mut summary.warnings);
            }
        }

        if !manifest.packages.is_empty() {
            summary.packages = Some(self.packages(&manifest, opts, managers, release));
        }
        Ok(summary)
    }

    fn check_components(&self, manifest: &Manifest, requested: &[String]) -> Result<()> {
        let available = manifest.component_names();
        for name in requested {
            if !available.contains(&name.as_str()) {
                return Err(BackmeyError::validation(format!(
                    "Component '{}' is not in this archive (contains: {})",
                    name,
                    available.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn component_of(&self, manifest: &Manifest, rel: &Path) -> String {
        manifest
            .component_for(rel)
            .map(String::from)
            .or_else(|| self.registry.owner_of(rel).map(|c| c.name.clone()))
            .unwrap_or_else(|| CUSTOM_COMPONENT.to_string())
    }

    /// Unpack selected `home/` entries (and `dconf.ini`) into `staging`.
    fn extract(
        &self,
        archive: &Path,
        manifest: &Manifest,
        opts: &RestoreOptions,
        staging: &TempDir,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<Staged>> {
        let corrupt = |e: io::Error| BackmeyError::corrupt(format!("{}: {}", archive.display(), e));
        let mut tar = open_archive(archive)?;
        let mut staged = Vec::new();

        for entry in tar.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let path = entry.path().map_err(corrupt)?.into_owned();

            if path.as_os_str() == DCONF_NAME {
                if manifest.has_dconf {
                    entry.unpack(staging.path().join(DCONF_NAME)).map_err(corrupt)?;
                }
                continue;
            }
            let Ok(rel) = path.strip_prefix(HOME_PREFIX).map(Path::to_path_buf) else {
                continue;
            };
            if rel.as_os_str().is_empty() {
                continue;
            }
            if !is_safe(&rel) {
                let msg = format!("Rejected unsafe archive path: {}", path.display());
                tracing::warn!("{}", msg);
                warnings.push(msg);
                continue;
            }

            let component = self.component_of(manifest, &rel);
            if !opts.components.is_empty() && !opts.components.contains(&component) {
                continue;
            }

            let header = entry.header();
            let kind = match header.entry_type() {
                tar::EntryType::Regular | tar::EntryType::Continuous => Kind::File,
                tar::EntryType::Directory => Kind::Dir,
                tar::EntryType::Symlink => Kind::Symlink,
                other => {
                    tracing::debug!("Skipping {:?} entry {}", other, rel.display());
                    continue;
                }
            };
            let mode = header.mode().map_err(corrupt)? & 0o7777;
            let owner = match (header.uid(), header.gid()) {
                (Ok(uid), Ok(gid)) => Some((uid as u32, gid as u32)),
                _ => None,
            };
            let size = if kind == Kind::File { header.size().map_err(corrupt)? } else { 0 };
            let link = if kind == Kind::Symlink {
                entry.link_name().map_err(corrupt)?.map(|l| l.into_owned())
            } else {
                None
            };

            // unpack_in refuses to follow links planted by earlier entries
            if !entry.unpack_in(staging.path()).map_err(corrupt)? {
                let msg = format!("Rejected unsafe archive path: {}", path.display());
                tracing::warn!("{}", msg);
                warnings.push(msg);
                continue;
            }
            // staged copies stay owner-accessible so read-only directories can
            // be filled; archived modes are applied when placing into home
            if kind != Kind::Symlink {
                let scratch = if kind == Kind::Dir { 0o700 } else { 0o600 };
                fs::set_permissions(staging.path().join(&path), fs::Permissions::from_mode(scratch))?;
            }
            staged.push(Staged {
                rel,
                kind,
                mode,
                owner,
                link,
                size,
                component,
                state: State::New,
            });
        }
        tracing::debug!("Staged {} entries", staged.len());
        Ok(staged)
    }

    fn classify(&self, staging: &TempDir, staged: &mut [Staged]) -> Result<()> {
        let root = staging.path().join(HOME_PREFIX);
        for item in staged.iter_mut() {
            let target = self.home.join(&item.rel);
            let Ok(existing) = target.symlink_metadata() else {
                item.state = State::New;
                continue;
            };
            let existing = existing.file_type();
            item.state = match item.kind {
                Kind::Dir if existing.is_dir() => State::Identical,
                Kind::Dir => State::Conflict,
                Kind::Symlink if existing.is_symlink() => {
                    if fs::read_link(&target).ok() == item.link {
                        State::Identical
                    } else {
                        State::Conflict
                    }
                }
                Kind::File if existing.is_file() => {
                    if same_contents(&root.join(&item.rel), &target)? {
                        State::Identical
                    } else {
                        State::Conflict
                    }
                }
                _ => State::Conflict,
            };
        }
        Ok(())
    }

    /// Copy every conflicting target to `base/<timestamp>/<rel>`.
    fn snapshot(&self, base: &Path, staged: &[Staged]) -> Result<PathBuf> {
        let stamp = Local::now().format(VERSION_FORMAT).to_string();
        let mut dir = base.join(&stamp);
        let mut n = 1;
        while dir.exists() {
            dir = base.join(format!("{}-{}", stamp, n));
            n += 1;
        }
        for item in staged.iter().filter(|s| s.state == State::Conflict) {
            let source = self.home.join(&item.rel);
            let dest = dir.join(&item.rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let meta = source.symlink_metadata()?;
            if meta.is_symlink() {
                symlink(fs::read_link(&source)?, &dest)?;
            } else if meta.is_file() {
                fs::copy(&source, &dest)?;
            }
        }
        tracing::info!("Snapshot of conflicting files saved to {}", dir.display());
        Ok(dir)
    }

    fn apply(&self, staging: &TempDir, staged: &[Staged], overwrite: bool, warnings: &mut Vec<String>) {
        let root = staging.path().join(HOME_PREFIX);
        let chown = is_root();
        let mut dirs: Vec<&Staged> = Vec::new();
        for item in staged {
            let write = match item.state {
                State::New => true,
                State::Conflict => overwrite,
                State::Identical => false,
            };
            if !write {
                continue;
            }
            let target = self.home.join(&item.rel);
            if let Err(e) = place(&root.join(&item.rel), &target, item) {
                let msg = format!("Failed to restore {}: {}", target.display(), e);
                tracing::warn!("{}", msg);
                warnings.push(msg);
                continue;
            }
            match item.kind {
                Kind::Symlink => continue,
                Kind::Dir => dirs.push(item),
                Kind::File => set_mode(&target, item.mode, warnings),
            }
            if let (true, Some((uid, gid))) = (chown, item.owner) {
                let result = nix::unistd::chown(
                    &target,
                    Some(nix::unistd::Uid::from_raw(uid)),
                    Some(nix::unistd::Gid::from_raw(gid)),
                );
                if let Err(e) = result {
                    warnings.push(format!("Failed to set owner on {}: {}", target.display(), e));
                }
            }
        }

        // deepest first, after every child is in place
        dirs.sort_by_key(|d| Reverse(d.rel.components().count()));
        for dir in dirs {
            set_mode(&self.home.join(&dir.rel), dir.mode, warnings);
        }
    }

    fn packages(
        &self,
        manifest: &Manifest,
        opts: &RestoreOptions,
        managers: &[Box<dyn PackageManager>],
        release: OsRelease,
    ) -> PackageSummary {
        tracing::info!("Resolving {} recorded package(s)", manifest.package_count());
        let mut resolver = SmartResolver::new(managers, release, opts.match_threshold);
        let plan = InstallPlan::build(
            &mut resolver,
            managers,
            &manifest.packages,
            &manifest.packages_canonical,
            opts.assume_yes,
        );
        for failure in plan.unresolved().filter_map(|r| r.failure()) {
            tracing::warn!("{}", failure);
        }
        if plan.is_empty() {
            tracing::info!("No packages to install");
        }
        let execute = opts.install_packages && !opts.dry_run && !opts.install_dry_run;
        let steps = if execute {
            plan.execute(managers, opts.assume_yes, false)
        } else if opts.install_dry_run {
            plan.execute(managers, opts.assume_yes, true)
        } else {
            Vec::new()
        };
        PackageSummary::from_plan(&plan, steps, !execute)
    }
}

/// Relative, without `..` or root components
fn is_safe(rel: &Path) -> bool {
    rel.components().all(|c| matches!(c, PathComponent::Normal(_)))
}

fn same_contents(a: &Path, b: &Path) -> Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    let mut left = io::BufReader::new(fs::File::open(a)?);
    let mut right = io::BufReader::new(fs::File::open(b)?);
    let mut lbuf = [0u8; 8192];
    let mut rbuf = [0u8; 8192];
    loop {
        let n = left.read(&mut lbuf)?;
        if n == 0 {
            return Ok(true);
        }
        right.read_exact(&mut rbuf[..n])?;
        if lbuf[..n] != rbuf[..n] {
            return Ok(false);
        }
    }
}

fn set_mode(target: &Path, mode: u32, warnings: &mut Vec<String>) {
    if let Err(e) = fs::set_permissions(target, fs::Permissions::from_mode(mode)) {
        warnings.push(format!("Failed to set mode on {}: {}", target.display(), e));
    }
}

/// Write one staged entry over `target`
fn place(staged: &Path, target: &Path, item: &Staged) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let existing = target.symlink_metadata().ok().map(|m| m.file_type());
    match item.kind {
        Kind::Dir => {
            if existing.is_some_and(|t| !t.is_dir()) {
                fs::remove_file(target)?;
            }
            fs::create_dir_all(target)
        }
        Kind::File | Kind::Symlink => {
            match existing {
                Some(t) if t.is_dir() => {
                    return Err(io::Error::other("a directory is in the way"));
                }
                // replaced, not rewritten in place, so read-only files can be overwritten
                Some(_) => fs::remove_file(target)?,
                None => {}
            }
            if item.kind == Kind::Symlink {
                let link = item
                    .link
                    .clone()
                    .ok_or_else(|| io::Error::other("symlink without target"))?;
                symlink(link, target)
            } else {
                fs::copy(staged, target).map(|_| ())
            }
        }
    }
}

fn load_dconf(dump: &Path, warnings: &mut Vec<String>) -> bool {
    if !tool_exists("dconf") {
        warnings.push("dconf not installed; settings dump not loaded".to_string());
        return false;
    }
    let result = fs::read(dump).map_err(BackmeyError::from).and_then(|bytes| {
        run_captured(Command::new("dconf").args(["load", "/"]), Some(&bytes))
    });
    match result.and_then(|out| out.ensure_success("dconf load")) {
        Ok(()) => {
            tracing::info!("Loaded dconf settings");
            true
        }
        Err(e) => {
            tracing::warn!("{}", e);
            warnings.push(e.to_string());
            false
        }
    }
}

/// Ask whether to overwrite. Anything but `y` or `s` aborts.
fn prompt(conflicts: &[&Staged]) -> Result<ConflictPolicy> {
    let mut stderr = io::stderr().lock();
    writeln!(stderr, "{} existing file(s) differ from the archive:", conflicts.len())?;
    for item in conflicts.iter().take(10) {
        writeln!(stderr, "  {}", item.rel.display())?;
    }
    if conflicts.len() > 10 {
        writeln!(stderr, "  ... and {} more", conflicts.len() - 10)?;
    }
    write!(stderr, "Overwrite them? [y]es / [s]kip / [N]o: ")?;
    stderr.flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => Ok(ConflictPolicy::Overwrite),
        "s" | "skip" => Ok(ConflictPolicy::Skip),
        _ => Err(BackmeyError::Conflict {
            count: conflicts.len(),
            first: conflicts[0].rel.display().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archiver, BackupOptions};
    use crate::detect::Detection;
    use crate::packages::StepOutcome;
    use crate::types::PackageManagerKind;
    use std::cell::RefCell;
    use std::os::unix::fs::symlink as make_link;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::rc::Rc;

    fn touch(home: &Path, rel: &str, body: &str) {
        let p = home.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, body).unwrap();
    }

    fn options(components: &[&str]) -> BackupOptions {
        BackupOptions {
            profile: "t".into(),
            version: Some("v1".into()),
            components: components.iter().map(|c| c.to_string()).collect(),
            skip_dconf: true,
            no_packages: true,
            ..Default::default()
        }
    }

    fn backup_with(home: &Path, opts: &BackupOptions, managers: &[Box<dyn PackageManager>]) -> PathBuf {
        let registry = ComponentRegistry::builtin();
        let store = BackupStore::new(home.join(".backmey/backups"));
        Archiver::new(&registry, home, store)
            .run(opts, &Detection::default(), managers)
            .unwrap()
            .archive
    }

    fn backup(home: &Path, components: &[&str]) -> PathBuf {
        backup_with(home, &options(components), &[])
    }

    /// In-memory package manager; install calls are shared with the test
    struct Shelf {
        kind: PackageManagerKind,
        installed: Vec<&'static str>,
        index: Vec<&'static str>,
        calls: Rc<RefCell<Vec<Vec<String>>>>,
    }

    impl Shelf {
        fn boxed(
            kind: PackageManagerKind,
            installed: &[&'static str],
            index: &[&'static str],
        ) -> (Box<dyn PackageManager>, Rc<RefCell<Vec<Vec<String>>>>) {
            let calls = Rc::new(RefCell::new(Vec::new()));
            let shelf = Self {
                kind,
                installed: installed.to_vec(),
                index: index.to_vec(),
                calls: Rc::clone(&calls),
            };
            (Box::new(shelf), calls)
        }
    }

    impl PackageManager for Shelf {
        fn kind(&self) -> PackageManagerKind {
            self.kind
        }
        fn is_available(&self) -> bool {
            true
        }
        fn list_installed(&self) -> Result<Vec<String>> {
            Ok(self.installed.iter().map(|s| s.to_string()).collect())
        }
        fn exists(&self, name: &str) -> bool {
            self.index.contains(&name)
        }
        fn search(&self, query: &str) -> Vec<String> {
            self.index.iter().filter(|n| n.contains(query)).map(|n| n.to_string()).collect()
        }
        fn install(&self, names: &[String], _assume_yes: bool) -> Result<ExitStatus> {
            self.calls.borrow_mut().push(names.to_vec());
            Ok(ExitStatus::from_raw(0))
        }
    }

    /// Archive of `.bashrc` plus a pacman inventory of git, vim and yay
    fn backup_with_packages(home: &Path) -> PathBuf {
        touch(home, ".bashrc", "x");
        let (pacman, _) = Shelf::boxed(PackageManagerKind::Pacman, &["git", "vim", "yay"], &[]);
        let mut opts = options(&["shells"]);
        opts.no_packages = false;
        backup_with(home, &opts, &[pacman])
    }

    fn restore(home: &Path, archive: &Path, opts: &RestoreOptions) -> Result<RestoreSummary> {
        let registry = ComponentRegistry::builtin();
        Restorer::new(&registry, home).run(archive, opts, &[], OsRelease::default())
    }

    #[test]
    fn test_policy_from_flags() {
        assert_eq!(ConflictPolicy::from_flags(true, true, true), ConflictPolicy::Skip);
        assert_eq!(ConflictPolicy::from_flags(true, false, false), ConflictPolicy::Overwrite);
        assert_eq!(ConflictPolicy::from_flags(false, false, true), ConflictPolicy::Prompt);
        assert_eq!(ConflictPolicy::from_flags(false, false, false), ConflictPolicy::Abort);
    }

    #[test]
    fn test_is_safe() {
        assert!(is_safe(Path::new(".config/app/a")));
        assert!(!is_safe(Path::new("../etc/passwd")));
        assert!(!is_safe(Path::new("/etc/passwd")));
        assert!(!is_safe(Path::new("a/../../b")));
    }

    #[test]
    fn test_round_trip_into_empty_home() {
        let src = TempDir::new().unwrap();
        touch(src.path(), ".bashrc", "alias ll='ls -l'");
        touch(src.path(), ".config/kitty/kitty.conf", "font_size 11");
        fs::set_permissions(src.path().join(".bashrc"), fs::Permissions::from_mode(0o600)).unwrap();
        make_link("kitty.conf", src.path().join(".config/kitty/current")).unwrap();
        let archive = backup(src.path(), &["shells", "terminal"]);

        let dst = TempDir::new().unwrap();
        let summary = restore(dst.path(), &archive, &RestoreOptions::default()).unwrap();

        assert_eq!(summary.new_files, 3);
        assert_eq!(summary.overwritten, 0);
        assert_eq!(fs::read_to_string(dst.path().join(".bashrc")).unwrap(), "alias ll='ls -l'");
        let mode = fs::metadata(dst.path().join(".bashrc")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(
            fs::read_link(dst.path().join(".config/kitty/current")).unwrap(),
            PathBuf::from("kitty.conf")
        );
        assert_eq!(summary.components, ["shells", "terminal"]);
    }

    #[test]
    fn test_second_restore_is_identical() {
        let home = TempDir::new().unwrap();
        touch(home.path(), ".bashrc", "x");
        let archive = backup(home.path(), &["shells"]);

        let summary = restore(home.path(), &archive, &RestoreOptions::default()).unwrap();
        assert_eq!(summary.identical, 1);
        assert_eq!(summary.new_files + summary.overwritten, 0);
        assert!(summary.snapshot.is_none());
    }

    #[test]
    fn test_conflict_aborts_without_writing() {
        let home = TempDir::new().unwrap();
        touch(home.path(), ".bashrc", "original");
        touch(home.path(), ".zshrc", "zsh");
        let archive = backup(home.path(), &["shells"]);
        fs::write(home.path().join(".bashrc"), "changed").unwrap();
        fs::remove_file(home.path().join(".zshrc")).unwrap();

        let err = restore(home.path(), &archive, &RestoreOptions::default()).unwrap_err();
        assert!(matches!(err, BackmeyError::Conflict { count: 1, .. }));
        assert_eq!(err.exit_code(), 4);
        assert_eq!(fs::read_to_string(home.path().join(".bashrc")).unwrap(), "changed");
        assert!(!home.path().join(".zshrc").exists());
    }

    #[test]
    fn test_skip_conflicts_keeps_existing() {
        let home = TempDir::new().unwrap();
        touch(home.path(), ".bashrc", "original");
        touch(home.path(), ".zshrc", "zsh");
        let archive = backup(home.path(), &["shells"]);
        fs::write(home.path().join(".bashrc"), "changed").unwrap();
        fs::remove_file(home.path().join(".zshrc")).unwrap();

        let opts = RestoreOptions {
            policy: ConflictPolicy::Skip,
            ..Default::default()
        };
        let summary = restore(home.path(), &archive, &opts).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.new_files, 1);
        assert_eq!(fs::read_to_string(home.path().join(".bashrc")).unwrap(), "changed");
        assert_eq!(fs::read_to_string(home.path().join(".zshrc")).unwrap(), "zsh");
    }

    #[test]
    fn test_overwrite_takes_snapshot() {
        let home = TempDir::new().unwrap();
        let snapshots = TempDir::new().unwrap();
        touch(home.path(), ".bashrc", "original");
        let archive = backup(home.path(), &["shells"]);
        fs::write(home.path().join(".bashrc"), "changed").unwrap();

        let opts = RestoreOptions {
            policy: ConflictPolicy::Overwrite,
            snapshot_dir: Some(snapshots.path().to_path_buf()),
            ..Default::default()
        };
        let summary = restore(home.path(), &archive, &opts).unwrap();
        assert_eq!(summary.overwritten, 1);
        assert_eq!(fs::read_to_string(home.path().join(".bashrc")).unwrap(), "original");
        let snapshot = summary.snapshot.unwrap();
        assert!(snapshot.starts_with(snapshots.path()));
        assert_eq!(fs::read_to_string(snapshot.join(".bashrc")).unwrap(), "changed");
    }

    #[test]
    fn test_dry_run_reports_without_writing() {
        let src = TempDir::new().unwrap();
        touch(src.path(), ".bashrc", "a");
        touch(src.path(), ".zshrc", "b");
        let archive = backup(src.path(), &["shells"]);

        let dst = TempDir::new().unwrap();
        touch(dst.path(), ".bashrc", "different");
        let opts = RestoreOptions {
            dry_run: true,
            snapshot_dir: Some(dst.path().join("snaps")),
            ..Default::default()
        };
        let summary = restore(dst.path(), &archive, &opts).unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.new_files, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.warnings.len(), 1);
        assert!(!dst.path().join(".zshrc").exists());
        assert!(!dst.path().join("snaps").exists());
        assert_eq!(fs::read_to_string(dst.path().join(".bashrc")).unwrap(), "different");
    }

    #[test]
    fn test_component_filter() {
        let src = TempDir::new().unwrap();
        touch(src.path(), ".bashrc", "a");
        touch(src.path(), ".config/kitty/kitty.conf", "b");
        let archive = backup(src.path(), &["shells", "terminal"]);

        let dst = TempDir::new().unwrap();
        let opts = RestoreOptions {
            components: vec!["terminal".into()],
            ..Default::default()
        };
        let summary = restore(dst.path(), &archive, &opts).unwrap();
        assert_eq!(summary.components, ["terminal"]);
        assert!(dst.path().join(".config/kitty/kitty.conf").is_file());
        assert!(!dst.path().join(".bashrc").exists());

        let opts = RestoreOptions {
            components: vec!["fonts".into()],
            ..Default::default()
        };
        let err = restore(dst.path(), &archive, &opts).unwrap_err();
        assert!(matches!(err, BackmeyError::Validation(_)));
    }

    #[test]
    fn test_traversal_entries_are_rejected() {
        use flate2::write::GzEncoder;
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.tar.gz");
        let manifest = Manifest::new("evil", "v1", Detection::default());
        let bytes = manifest.to_json().unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(
            fs::File::create(&archive).unwrap(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, "manifest.json", bytes.as_slice()).unwrap();

        let payload = b"pwned";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.as_old_mut().name[..22].copy_from_slice(b"home/../../escaped.txt");
        header.set_cksum();
        builder.append(&header, &payload[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let home = dir.path().join("home");
        fs::create_dir(&home).unwrap();
        let summary = restore(&home, &archive, &RestoreOptions::default()).unwrap();
        assert_eq!(summary.new_files, 0);
        assert!(summary.warnings.iter().any(|w| w.contains("unsafe")));
        assert!(!dir.path().join("escaped.txt").exists());
    }

    #[test]
    fn test_read_only_directories_are_filled_then_locked() {
        let src = TempDir::new().unwrap();
        touch(src.path(), "ro/keep.txt", "kept");
        touch(src.path(), "ro/inner/deep.txt", "deep");
        fs::set_permissions(src.path().join("ro/inner"), fs::Permissions::from_mode(0o500)).unwrap();
        fs::set_permissions(src.path().join("ro"), fs::Permissions::from_mode(0o555)).unwrap();
        let mut opts = options(&["shells"]);
        opts.includes = vec![src.path().join("ro")];
        let archive = backup_with(src.path(), &opts, &[]);

        let dst = TempDir::new().unwrap();
        let summary = restore(dst.path(), &archive, &RestoreOptions::default()).unwrap();

        assert!(summary.warnings.is_empty(), "{:?}", summary.warnings);
        assert_eq!(summary.new_files, 2);
        assert_eq!(fs::read_to_string(dst.path().join("ro/keep.txt")).unwrap(), "kept");
        assert_eq!(fs::read_to_string(dst.path().join("ro/inner/deep.txt")).unwrap(), "deep");
        let mode = |rel: &str| fs::metadata(dst.path().join(rel)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode("ro"), 0o555);
        assert_eq!(mode("ro/inner"), 0o500);

        for home in [src.path(), dst.path()] {
            for rel in ["ro", "ro/inner"] {
                fs::set_permissions(home.join(rel), fs::Permissions::from_mode(0o755)).unwrap();
            }
        }
    }

    #[test]
    fn test_overwrite_replaces_read_only_file() {
        let src = TempDir::new().unwrap();
        touch(src.path(), ".bashrc", "new");
        fs::set_permissions(src.path().join(".bashrc"), fs::Permissions::from_mode(0o444)).unwrap();
        let archive = backup(src.path(), &["shells"]);

        let dst = TempDir::new().unwrap();
        touch(dst.path(), ".bashrc", "old");
        fs::set_permissions(dst.path().join(".bashrc"), fs::Permissions::from_mode(0o444)).unwrap();
        let opts = RestoreOptions {
            policy: ConflictPolicy::Overwrite,
            ..Default::default()
        };
        let summary = restore(dst.path(), &archive, &opts).unwrap();

        assert!(summary.warnings.is_empty(), "{:?}", summary.warnings);
        assert_eq!(summary.overwritten, 1);
        assert_eq!(fs::read_to_string(dst.path().join(".bashrc")).unwrap(), "new");
    }

    #[test]
    fn test_install_packages_runs_one_batch() {
        let src = TempDir::new().unwrap();
        let archive = backup_with_packages(src.path());
        let (apt, calls) = Shelf::boxed(PackageManagerKind::Apt, &[], &["git", "vim"]);

        let dst = TempDir::new().unwrap();
        let registry = ComponentRegistry::builtin();
        let opts = RestoreOptions {
            install_packages: true,
            assume_yes: true,
            ..Default::default()
        };
        let summary = Restorer::new(&registry, dst.path())
            .run(&archive, &opts, &[apt], OsRelease::default())
            .unwrap();

        assert_eq!(*calls.borrow(), vec![vec!["git".to_string(), "vim".to_string()]]);
        let packages = summary.packages.unwrap();
        assert_eq!(packages.resolved, 2);
        assert_eq!(packages.steps, vec![(PackageManagerKind::Apt, StepOutcome::Installed)]);
        assert!(!packages.preview);
        assert_eq!(packages.unresolved, ["yay"]);
        assert!(packages.render().contains("Manual install required: yay"));
    }

    #[test]
    fn test_install_dry_run_previews_without_installing() {
        let src = TempDir::new().unwrap();
        let archive = backup_with_packages(src.path());
        let (apt, calls) = Shelf::boxed(PackageManagerKind::Apt, &["vim"], &["git", "vim"]);

        let dst = TempDir::new().unwrap();
        let registry = ComponentRegistry::builtin();
        let opts = RestoreOptions {
            install_packages: true,
            install_dry_run: true,
            ..Default::default()
        };
        let summary = Restorer::new(&registry, dst.path())
            .run(&archive, &opts, &[apt], OsRelease::default())
            .unwrap();

        assert!(calls.borrow().is_empty());
        let packages = summary.packages.unwrap();
        assert_eq!(packages.already_installed, 1);
        assert_eq!(packages.steps, vec![(PackageManagerKind::Apt, StepOutcome::DryRun)]);
        assert!(packages.preview);
        assert_eq!(packages.commands.len(), 1);
        assert!(packages.commands[0].ends_with("git"));
        let rendered = packages.render();
        assert!(rendered.contains("Install commands (not executed)"));
        assert!(rendered.contains("Manual install required: yay"));
    }

    #[test]
    fn test_packages_are_only_planned_by_default() {
        let src = TempDir::new().unwrap();
        let archive = backup_with_packages(src.path());
        let (apt, calls) = Shelf::boxed(PackageManagerKind::Apt, &[], &["git", "vim"]);

        let dst = TempDir::new().unwrap();
        let registry = ComponentRegistry::builtin();
        let summary = Restorer::new(&registry, dst.path())
            .run(&archive, &RestoreOptions::default(), &[apt], OsRelease::default())
            .unwrap();

        assert!(calls.borrow().is_empty());
        let packages = summary.packages.unwrap();
        assert!(packages.steps.is_empty());
        assert!(packages.preview);
        assert_eq!(packages.unresolved, ["yay"]);
    }

    #[test]
    fn test_archive_source_locate() {
        let dir = TempDir::new().unwrap();
        let store = BackupStore::new(dir.path().join("store"));
        let templates = TemplateRegistry::new(dir.path().join("templates"));
        let err = ArchiveSource::Template("missing".into())
            .locate(&store, &templates)
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        let err = ArchiveSource::Path(dir.path().join("nope.tar.gz"))
            .locate(&store, &templates)
            .unwrap_err();
        assert!(matches!(err, BackmeyError::NotFound(_)));
    }
}
