//! Package manager integration
//!
//! Each supported manager is reached through the [`PackageManager`] trait.
//! [`SystemManager`] implements it by shelling out to the real tools;
//! tests substitute in-memory implementations.
//!
//! - [`collect`]: inventory installed packages at backup time
//! - [`resolve`]: "Smart Resolve" of recorded names on the current system
//! - [`install`]: batched per-manager install plans

pub mod collect;
pub mod install;
pub mod resolve;

use std::collections::BTreeSet;
use std::path::Path;
use std::process::{Command, ExitStatus};

use crate::error::{BackmeyError, Result};
use crate::process::{run_captured, run_inherited, tool_exists};
use crate::types::PackageManagerKind;

pub use collect::{canonicalize, collect_installed, normalize_pkg_name};
pub use install::{InstallPlan, InstallStep, StepOutcome};
pub use resolve::{Outcome, Resolution, SmartResolver, similarity};

/// Capability interface over one package manager
pub trait PackageManager {
    fn kind(&self) -> PackageManagerKind;

    /// Whether the manager's tools are present on this system
    fn is_available(&self) -> bool;

    /// Names of installed packages
    fn list_installed(&self) -> Result<Vec<String>>;

    /// Whether `name` exists verbatim in the manager's index
    fn exists(&self, name: &str) -> bool;

    /// Candidate package names for a query; empty when nothing matches
    fn search(&self, query: &str) -> Vec<String>;

    /// Full argv that installs `names` in one batch
    fn install_command(&self, names: &[String], assume_yes: bool) -> Vec<String> {
        install_command(self.kind(), names, assume_yes, is_root())
    }

    /// Install `names` in one batch, attached to the terminal
    fn install(&self, names: &[String], assume_yes: bool) -> Result<ExitStatus> {
        let argv = self.install_command(names, assume_yes);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BackmeyError::system("empty install command"))?;
        run_inherited(Command::new(program).args(args))
    }
}

/// Build an install argv for `kind`. `sudo` is prepended for system
/// managers unless already running as root.
pub fn install_command(
    kind: PackageManagerKind,
    names: &[String],
    assume_yes: bool,
    root: bool,
) -> Vec<String> {
    use PackageManagerKind::*;
    let mut argv: Vec<&str> = Vec::new();
    if kind.needs_sudo() && !root {
        argv.push("sudo");
    }
    match kind {
        Pacman => {
            argv.extend(["pacman", "-S", "--needed"]);
            if assume_yes {
                argv.push("--noconfirm");
            }
        }
        Apt | Dnf | Zypper => {
            argv.extend([
                match kind {
                    Apt => "apt-get",
                    Dnf => "dnf",
                    _ => "zypper",
                },
                "install",
            ]);
            if assume_yes {
                argv.push("-y");
            }
        }
        NixEnv => argv.extend(["nix-env", "-i"]),
        Flatpak => {
            argv.extend(["flatpak", "install"]);
            if assume_yes {
                argv.push("-y");
            }
        }
        Snap => argv.extend(["snap", "install"]),
        Pip => argv.extend(["pip", "install", "--user"]),
    }
    argv.into_iter()
        .map(String::from)
        .chain(names.iter().cloned())
        .collect()
}

pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Reject names that could be mistaken for options or carry shell syntax.
/// Names travel as separate argv entries, never through a shell.
pub fn validate_package_name(name: &str) -> Result<()> {
    const FORBIDDEN: &[char] = &[';', '|', '&', '$', '`', '"', '\'', '<', '>', '\\', ' ', '\n'];
    if name.is_empty() || name.starts_with('-') || name.contains(FORBIDDEN) {
        return Err(BackmeyError::validation(format!(
            "Invalid package name: {:?}",
            name
        )));
    }
    Ok(())
}

/// Package manager backed by the real system tools
#[derive(Debug, Clone, Copy)]
pub struct SystemManager {
    kind: PackageManagerKind,
}

impl SystemManager {
    pub fn new(kind: PackageManagerKind) -> Self {
        Self { kind }
    }

    fn capture(&self, program: &str, args: &[&str]) -> Option<String> {
        match run_captured(Command::new(program).args(args), None) {
            Ok(out) if out.success => Some(out.stdout),
            Ok(out) => {
                tracing::debug!("{} {:?} exited {:?}", program, args, out.exit_code);
                None
            }
            Err(e) => {
                tracing::debug!("{} unavailable: {}", program, e);
                None
            }
        }
    }

    fn lines(&self, program: &str, args: &[&str]) -> Vec<String> {
        self.capture(program, args)
            .map(|s| {
                s.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl PackageManager for SystemManager {
    fn kind(&self) -> PackageManagerKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        tool_exists(self.kind.binary())
    }

    fn list_installed(&self) -> Result<Vec<String>> {
        use PackageManagerKind::*;
        let names = match self.kind {
            Pacman => self.lines("pacman", &["-Qq"]),
            Apt => self.lines("dpkg-query", &["-W", "-f=${Package}\n"]),
            Dnf | Zypper => self.lines("rpm", &["-qa", "--qf", "%{NAME}\n"]),
            NixEnv => self.lines("nix-env", &["-q"]),
            Flatpak => self.lines("flatpak", &["list", "--app", "--columns=application"]),
            Snap => parse_first_column(&self.lines("snap", &["list"]).join("\n")),
            Pip => self
                .lines("pip", &["freeze"])
                .into_iter()
                .filter_map(|l| l.split("==").next().map(|n| n.trim().to_string()))
                .filter(|n| !n.is_empty() && !n.starts_with('-'))
                .collect(),
        };
        Ok(names)
    }

    fn exists(&self, name: &str) -> bool {
        use PackageManagerKind::*;
        if validate_package_name(name).is_err() {
            return false;
        }
        match self.kind {
            Pacman => self.capture("pacman", &["-Si", name]).is_some(),
            Apt => self
                .capture("apt-cache", &["show", name])
                .is_some_and(|out| out.contains("Package:")),
            Dnf => self.capture("dnf", &["info", "-q", name]).is_some(),
            Zypper => self
                .capture("zypper", &["--non-interactive", "info", name])
                .is_some_and(|out| out.lines().any(|l| l.starts_with("Name"))),
            NixEnv => self
                .capture("nix-env", &["-qa", name])
                .is_some_and(|out| !out.trim().is_empty()),
            Flatpak => self.search(name).iter().any(|n| n == name),
            Snap => self.capture("snap", &["info", name]).is_some(),
            Pip => self.capture("pip", &["index", "versions", name]).is_some(),
        }
    }

    fn search(&self, query: &str) -> Vec<String> {
        use PackageManagerKind::*;
        if validate_package_name(query).is_err() {
            return Vec::new();
        }
        let Some(out) = (match self.kind {
            Pacman => self.capture("pacman", &["-Ss", query]),
            Apt => self.capture("apt-cache", &["search", "--names-only", query]),
            Dnf => self.capture("dnf", &["search", "-q", query]),
            Zypper => self.capture("zypper", &["--non-interactive", "search", query]),
            NixEnv => self.capture("nix-env", &["-qa", &format!(".*{}.*", query)]),
            Flatpak => self.capture("flatpak", &["search", "--columns=application", query]),
            Snap => self.capture("snap", &["find", query]),
            Pip => None,
        }) else {
            return Vec::new();
        };
        let names = match self.kind {
            Pacman => parse_pacman_search(&out),
            Apt => parse_first_column(&out),
            Dnf => parse_dnf_search(&out),
            Zypper => parse_zypper_search(&out),
            NixEnv => out.lines().map(normalize_pkg_name).filter(|n| !n.is_empty()).collect(),
            Flatpak => out.lines().map(str::trim).filter(|l| l.contains('.')).map(String::from).collect(),
            Snap => parse_first_column(&out),
            Pip => Vec::new(),
        };
        dedup_keep_order(names)
    }
}

/// `repo/name version` header lines of `pacman -Ss`
pub fn parse_pacman_search(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| !l.starts_with(' ') && !l.starts_with('\t'))
        .filter_map(|l| l.split_whitespace().next())
        .filter_map(|repo_pkg| repo_pkg.split_once('/').map(|(_, name)| name.to_string()))
        .collect()
}

/// `name.arch : summary` lines of `dnf search`
pub fn parse_dnf_search(output: &str) -> Vec<String> {
    const ARCHES: &[&str] = &["x86_64", "noarch", "i686", "aarch64", "armv7hl", "ppc64le", "s390x"];
    output
        .lines()
        .filter_map(|l| l.split_once(" : "))
        .map(|(name, _)| name.trim())
        .map(|name| match name.rsplit_once('.') {
            Some((base, arch)) if ARCHES.contains(&arch) => base,
            _ => name,
        })
        .filter(|n| !n.is_empty() && !n.contains(' '))
        .map(String::from)
        .collect()
}

/// `S | Name | Summary | Type` table rows of `zypper search`
pub fn parse_zypper_search(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| l.contains('|') && !l.contains("--+"))
        .filter_map(|l| l.split('|').nth(1).map(str::trim))
        .filter(|n| !n.is_empty() && *n != "Name")
        .map(String::from)
        .collect()
}

/// First whitespace-separated column, skipping a `Name` header
pub fn parse_first_column(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .filter(|n| !n.eq_ignore_ascii_case("name"))
        .map(String::from)
        .collect()
}

fn dedup_keep_order(names: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

/// `ID` and `ID_LIKE` from os-release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
}

impl OsRelease {
    /// Read `/etc/os-release`; an unreadable file gives an empty release.
    pub fn load() -> Self {
        Self::load_from(Path::new("/etc/os-release"))
    }

    pub fn load_from(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .map(|text| Self::parse(&text))
            .unwrap_or_default()
    }

    pub fn parse(text: &str) -> Self {
        let mut release = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'').to_lowercase();
            match key.trim() {
                "ID" => release.id = value,
                "ID_LIKE" => release.id_like = value.split_whitespace().map(String::from).collect(),
                _ => {}
            }
        }
        release
    }

    /// `ID` followed by each `ID_LIKE` entry
    pub fn keys(&self) -> Vec<&str> {
        std::iter::once(self.id.as_str())
            .chain(self.id_like.iter().map(String::as_str))
            .filter(|k| !k.is_empty())
            .collect()
    }

    fn is_like(&self, families: &[&str]) -> bool {
        self.keys()
            .iter()
            .any(|k| families.iter().any(|f| k.contains(f)))
    }

    /// Manager priority for this distribution, system default first
    pub fn preferred_order(&self) -> Vec<PackageManagerKind> {
        use PackageManagerKind::*;
        let mut order = if self.is_like(&["arch", "manjaro", "endeavouros"]) {
            vec![Pacman, Flatpak, Snap, NixEnv, Apt, Dnf, Zypper]
        } else if self.is_like(&["ubuntu", "debian"]) {
            vec![Apt, Flatpak, Snap, NixEnv, Dnf, Zypper, Pacman]
        } else if self.is_like(&["fedora", "rhel", "centos"]) {
            vec![Dnf, Flatpak, Snap, NixEnv, Apt, Zypper, Pacman]
        } else if self.is_like(&["suse"]) {
            vec![Zypper, Flatpak, Snap, NixEnv, Dnf, Apt, Pacman]
        } else if self.is_like(&["nixos"]) {
            vec![NixEnv, Flatpak, Snap, Pacman, Apt, Dnf, Zypper]
        } else {
            vec![Pacman, Apt, Dnf, Zypper, Flatpak, Snap, NixEnv]
        };
        order.push(Pip);
        order
    }
}

/// Parse a comma-separated `--install-managers` list (`nix` is accepted
/// for `nix-env`).
pub fn parse_manager_list(list: &[String]) -> Result<Vec<PackageManagerKind>> {
    let mut kinds = Vec::new();
    for raw in list {
        let name = raw.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        let name = if name == "nix" { "nix-env".to_string() } else { name };
        let kind: PackageManagerKind = name.parse().map_err(|_| {
            BackmeyError::validation(format!("Unknown package manager '{}'", raw.trim()))
        })?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

/// Available system managers, in priority order.
///
/// `requested` overrides the distribution order when non-empty.
pub fn discover(
    release: &OsRelease,
    requested: &[PackageManagerKind],
) -> Vec<Box<dyn PackageManager>> {
    let order = if requested.is_empty() {
        release.preferred_order()
    } else {
        requested.to_vec()
    };
    order
        .into_iter()
        .map(SystemManager::new)
        .filter(|m| {
            let ok = m.is_available();
            if !ok {
                tracing::debug!("Skipping {}; not available on this system", m.kind());
            }
            ok
        })
        .map(|m| Box::new(m) as Box<dyn PackageManager>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use PackageManagerKind::*;

    #[test]
    fn test_install_command_sudo_and_yes() {
        let names = vec!["firefox-esr".to_string(), "gimp".to_string()];
        assert_eq!(
            install_command(Apt, &names, true, false),
            ["sudo", "apt-get", "install", "-y", "firefox-esr", "gimp"]
        );
        assert_eq!(
            install_command(Pacman, &names, false, true),
            ["pacman", "-S", "--needed", "firefox-esr", "gimp"]
        );
        assert_eq!(install_command(NixEnv, &names, true, false)[..2], ["nix-env", "-i"]);
        assert_eq!(install_command(Flatpak, &names, true, false)[2], "-y");
    }

    #[test]
    fn test_validate_package_name() {
        assert!(validate_package_name("python3-requests").is_ok());
        assert!(validate_package_name("org.gimp.GIMP").is_ok());
        assert!(validate_package_name("--force").is_err());
        assert!(validate_package_name("a;rm -rf /").is_err());
        assert!(validate_package_name("").is_err());
    }

    #[test]
    fn test_parse_pacman_search() {
        let out = "extra/firefox 128.0-1 [installed]\n    Fast browser\nextra/firefox-developer-edition 129.0b1-1\n    Dev build\n";
        assert_eq!(parse_pacman_search(out), ["firefox", "firefox-developer-edition"]);
    }

    #[test]
    fn test_parse_dnf_search() {
        let out = "chromium.x86_64 : A WebKit (Blink) powered web browser\npython3.11.x86_64 : Version 3.11\nLast metadata expiration check\n";
        assert_eq!(parse_dnf_search(out), ["chromium", "python3.11"]);
    }

    #[test]
    fn test_parse_zypper_search() {
        let out = "S | Name     | Summary | Type\n--+----------+---------+--------\n  | chromium | Browser | package\ni | gimp     | Editor  | package\n";
        assert_eq!(parse_zypper_search(out), ["chromium", "gimp"]);
    }

    #[test]
    fn test_parse_first_column_skips_header() {
        let out = "Name    Version  Rev\ncore22  2024     1380\nspotify 1.2      80\n";
        assert_eq!(parse_first_column(out), ["core22", "spotify"]);
    }

    #[test]
    fn test_os_release_order() {
        let debian = OsRelease::parse("NAME=\"Debian\"\nID=debian\n");
        assert_eq!(debian.preferred_order()[0], Apt);

        let mint = OsRelease::parse("ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n");
        assert_eq!(mint.keys(), ["linuxmint", "ubuntu", "debian"]);
        assert_eq!(mint.preferred_order()[0], Apt);

        let endeavour = OsRelease::parse("ID=endeavouros\nID_LIKE=arch\n");
        assert_eq!(endeavour.preferred_order()[0], Pacman);

        let tumbleweed = OsRelease::parse("ID=\"opensuse-tumbleweed\"\nID_LIKE=\"opensuse suse\"\n");
        assert_eq!(tumbleweed.preferred_order()[0], Zypper);

        let unknown = OsRelease::default();
        assert_eq!(*unknown.preferred_order().last().unwrap(), Pip);
    }

    #[test]
    fn test_parse_manager_list() {
        let kinds = parse_manager_list(&["apt".into(), " nix ".into(), "apt".into()]).unwrap();
        assert_eq!(kinds, [Apt, NixEnv]);
        assert!(parse_manager_list(&["brew".into()]).is_err());
    }
}
