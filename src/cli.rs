use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::types::Compression;

/// backmey - back up and restore a Linux desktop
#[derive(Parser)]
#[command(name = "backmey")]
#[command(about = "Back up and restore desktop configuration, themes, fonts and packages")]
#[command(version)]
pub struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a backup archive
    Backup(BackupArgs),
    /// Restore files (and optionally packages) from an archive
    Restore(RestoreArgs),
    /// Print an archive's manifest as JSON
    Inspect(InspectArgs),
    /// List stored backups and templates
    List(ListArgs),
    /// Print the detected desktop environment as JSON
    Detect,
    /// Manage named template archives
    Templates {
        #[command(subcommand)]
        command: TemplateCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    /// Profile the archive is stored under
    #[arg(long)]
    pub profile: String,
    /// Version name (default: current timestamp)
    #[arg(long)]
    pub version: Option<String>,
    /// Write the archive here instead of the backup store
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Backup store root
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
    /// Comma-separated component names
    #[arg(long, value_delimiter = ',')]
    pub components: Vec<String>,
    /// Also back up browser profiles
    #[arg(long)]
    pub with_browser_profiles: bool,
    /// Encrypt with gpg; passphrase from BACKMEY_PASSPHRASE
    #[arg(long)]
    pub encrypt: bool,
    /// Do not dump dconf settings
    #[arg(long)]
    pub skip_dconf: bool,
    /// Do not record installed packages
    #[arg(long)]
    pub no_packages: bool,
    /// Print per-component sizes before archiving
    #[arg(long)]
    pub report_sizes: bool,
    /// Compute and report without writing anything
    #[arg(long)]
    pub dry_run: bool,
    /// Drop caches, build output and VCS directories
    #[arg(long)]
    pub smart_exclude: bool,
    /// Exclude a substring or glob (repeatable)
    #[arg(long = "exclude", value_name = "PAT")]
    pub excludes: Vec<String>,
    /// Add a custom path (repeatable)
    #[arg(long = "include", value_name = "PATH")]
    pub includes: Vec<PathBuf>,
    /// Free-text notes stored in the manifest
    #[arg(long)]
    pub notes: Option<String>,
    /// Shell command run after a successful backup; {archive} is replaced
    /// by the archive path
    #[arg(long)]
    pub sync_command: Option<String>,
    /// Compressor (gzip or zstd)
    #[arg(long)]
    pub compression: Option<Compression>,
}

#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("source").required(true).multiple(true).args(["archive", "profile", "template"])))]
pub struct RestoreArgs {
    /// Archive file to restore
    #[arg(long, conflicts_with_all = ["profile", "template"])]
    pub archive: Option<PathBuf>,
    /// Restore the latest (or --version) backup of this profile
    #[arg(long)]
    pub profile: Option<String>,
    #[arg(long, requires = "profile")]
    pub version: Option<String>,
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
    /// Restore a registered template
    #[arg(long)]
    pub template: Option<String>,
    #[arg(long)]
    pub template_dir: Option<PathBuf>,
    /// Comma-separated component names to restore
    #[arg(long, value_delimiter = ',')]
    pub components: Vec<String>,
    /// Overwrite conflicting files without asking
    #[arg(short, long)]
    pub yes: bool,
    /// Keep conflicting files and continue
    #[arg(long)]
    pub skip_conflicts: bool,
    /// Resolve and report without writing or installing
    #[arg(long)]
    pub dry_run: bool,
    /// Do not copy overwritten files to the snapshot directory
    #[arg(long)]
    pub no_snapshot: bool,
    #[arg(long)]
    pub snapshot_dir: Option<PathBuf>,
    /// Do not load dconf settings
    #[arg(long)]
    pub skip_dconf: bool,
    /// Install recorded packages after restoring files
    #[arg(long)]
    pub install_packages: bool,
    /// Comma-separated package manager priority (e.g. apt,flatpak)
    #[arg(long, value_delimiter = ',')]
    pub install_managers: Vec<String>,
    /// Print install commands instead of running them
    #[arg(long)]
    pub install_dry_run: bool,
    /// Minimum similarity (0-1) for fuzzy package matches
    #[arg(long, value_parser = parse_threshold)]
    pub match_threshold: Option<f64>,
}

#[derive(Args, Debug, Clone)]
#[command(group(ArgGroup::new("source").required(true).args(["archive", "profile"])))]
pub struct InspectArgs {
    #[arg(long)]
    pub archive: Option<PathBuf>,
    #[arg(long)]
    pub profile: Option<String>,
    #[arg(long, requires = "profile")]
    pub version: Option<String>,
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Include registered templates
    #[arg(long)]
    pub templates: bool,
    /// Machine-readable output
    #[arg(long)]
    pub json: bool,
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
    #[arg(long)]
    pub template_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TemplateCommands {
    /// Copy an archive into the template directory under a name
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        template_dir: Option<PathBuf>,
    },
    /// List registered templates
    List {
        #[arg(long)]
        template_dir: Option<PathBuf>,
    },
}

fn parse_threshold(value: &str) -> Result<f64, String> {
    let threshold: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number", value))?;
    if (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(format!("must be between 0 and 1, got {}", threshold))
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["backmey"]).is_err());
    }

    #[test]
    fn test_cli_backup_flags() {
        let cli = Cli::try_parse_from([
            "backmey",
            "backup",
            "--profile",
            "work",
            "--components",
            "shells,themes",
            "--exclude=*.log",
            "--exclude",
            "secret",
            "--include",
            "~/notes",
            "--compression",
            "zstd",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Backup(args) => {
                assert_eq!(args.profile, "work");
                assert_eq!(args.components, ["shells", "themes"]);
                assert_eq!(args.excludes, ["*.log", "secret"]);
                assert_eq!(args.includes, [PathBuf::from("~/notes")]);
                assert_eq!(args.compression, Some(Compression::Zstd));
                assert!(args.dry_run);
                assert!(!args.encrypt);
            }
            _ => panic!("Expected Backup command"),
        }
    }

    #[test]
    fn test_cli_backup_requires_profile() {
        assert!(Cli::try_parse_from(["backmey", "backup"]).is_err());
    }

    #[test]
    fn test_cli_restore_sources() {
        let cli = Cli::try_parse_from(["backmey", "restore", "--profile", "work", "--version", "v1", "--yes"]).unwrap();
        match cli.command {
            Commands::Restore(args) => {
                assert_eq!(args.profile.as_deref(), Some("work"));
                assert_eq!(args.version.as_deref(), Some("v1"));
                assert!(args.yes);
            }
            _ => panic!("Expected Restore command"),
        }

        assert!(Cli::try_parse_from(["backmey", "restore"]).is_err());
        assert!(Cli::try_parse_from(["backmey", "restore", "--archive", "a.tar.gz", "--profile", "p"]).is_err());
        assert!(Cli::try_parse_from(["backmey", "restore", "--archive", "a.tar.gz", "--template", "t"]).is_err());
        assert!(Cli::try_parse_from(["backmey", "restore", "--template", "t"]).is_ok());
    }

    #[test]
    fn test_cli_match_threshold_range() {
        let cli = Cli::try_parse_from(["backmey", "restore", "--archive", "a", "--match-threshold", "0.7"]).unwrap();
        match cli.command {
            Commands::Restore(args) => assert_eq!(args.match_threshold, Some(0.7)),
            _ => panic!("Expected Restore command"),
        }
        assert!(Cli::try_parse_from(["backmey", "restore", "--archive", "a", "--match-threshold", "1.5"]).is_err());
        assert!(Cli::try_parse_from(["backmey", "restore", "--archive", "a", "--match-threshold", "abc"]).is_err());
    }

    #[test]
    fn test_cli_install_managers_list() {
        let cli = Cli::try_parse_from([
            "backmey",
            "restore",
            "--archive",
            "a",
            "--install-managers",
            "apt,flatpak",
        ])
        .unwrap();
        match cli.command {
            Commands::Restore(args) => assert_eq!(args.install_managers, ["apt", "flatpak"]),
            _ => panic!("Expected Restore command"),
        }
    }

    #[test]
    fn test_cli_templates_and_global_verbose() {
        let cli = Cli::try_parse_from([
            "backmey",
            "templates",
            "register",
            "--name",
            "base",
            "--archive",
            "a.tar.gz",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Templates {
                command: TemplateCommands::Register { name, archive, .. },
            } => {
                assert_eq!(name, "base");
                assert_eq!(archive, PathBuf::from("a.tar.gz"));
            }
            _ => panic!("Expected templates register"),
        }
    }

    #[test]
    fn test_cli_inspect_needs_source() {
        assert!(Cli::try_parse_from(["backmey", "inspect"]).is_err());
        assert!(Cli::try_parse_from(["backmey", "inspect", "--archive", "a.tar.gz"]).is_ok());
        assert!(Cli::try_parse_from(["backmey", "list", "--json", "--templates"]).is_ok());
        assert!(Cli::try_parse_from(["backmey", "detect"]).is_ok());
    }
}
