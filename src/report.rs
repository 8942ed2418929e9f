//! Run summaries printed on stdout
//!
//! Backups and restores collect their counters into a summary value; the
//! binary prints it once at the end of every run (dry runs included), so
//! callers wrapping the engine always see the same shape.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::packages::{InstallPlan, Outcome, StepOutcome};
use crate::types::PackageManagerKind;

/// Human-readable byte count (`512 B`, `1.5 KB`, `3.2 GB`)
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Per-component size table
pub fn size_report(sizes: &BTreeMap<String, u64>, paths: usize) -> String {
    let mut out = String::from("Component sizes:\n");
    for (component, size) in sizes {
        let _ = writeln!(out, "  - {}: {}", component, format_size(*size));
    }
    let _ = writeln!(
        out,
        "  Total: {} across {} path(s)",
        format_size(sizes.values().sum()),
        paths
    );
    out
}

/// Counters of one backup run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupSummary {
    pub profile: String,
    pub version: String,
    /// Final archive; for a dry run, where it would have been written
    pub archive: PathBuf,
    pub components: Vec<String>,
    pub paths: usize,
    pub files: u64,
    pub bytes_read: u64,
    pub archive_bytes: u64,
    pub packages: usize,
    pub packages_canonical: usize,
    pub has_dconf: bool,
    pub encrypted: bool,
    pub dry_run: bool,
    pub warnings: Vec<String>,
}

impl BackupSummary {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let title = if self.dry_run { "Backup dry-run summary" } else { "Backup complete" };
        let _ = writeln!(out, "{}:", title);
        let _ = writeln!(out, "  Profile: {}  Version: {}", self.profile, self.version);
        let _ = writeln!(
            out,
            "  {}: {}",
            if self.dry_run { "Target archive" } else { "Archive" },
            self.archive.display()
        );
        let _ = writeln!(
            out,
            "  Components ({}): {}",
            self.components.len(),
            self.components.join(", ")
        );
        let _ = writeln!(
            out,
            "  Paths: {}  Files: {}  Bytes read: {}",
            self.paths,
            self.files,
            format_size(self.bytes_read)
        );
        if !self.dry_run {
            let _ = writeln!(
                out,
                "  Archive size: {}{}",
                format_size(self.archive_bytes),
                if self.encrypted { " (encrypted)" } else { "" }
            );
            let _ = writeln!(
                out,
                "  Packages: {} ({} canonical)  dconf: {}",
                self.packages,
                self.packages_canonical,
                if self.has_dconf { "yes" } else { "no" }
            );
        }
        write_warnings(&mut out, &self.warnings);
        out
    }
}

/// Counters of one restore run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreSummary {
    pub archive: PathBuf,
    pub components: Vec<String>,
    pub new_files: usize,
    pub overwritten: usize,
    pub identical: usize,
    pub skipped: usize,
    pub bytes_restored: u64,
    pub snapshot: Option<PathBuf>,
    pub dconf_loaded: bool,
    pub packages: Option<PackageSummary>,
    pub dry_run: bool,
    pub warnings: Vec<String>,
}

impl RestoreSummary {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let title = if self.dry_run { "Restore dry-run summary" } else { "Restore complete" };
        let _ = writeln!(out, "{}:", title);
        let _ = writeln!(out, "  Archive: {}", self.archive.display());
        let _ = writeln!(
            out,
            "  Components ({}): {}",
            self.components.len(),
            self.components.join(", ")
        );
        let verb = if self.dry_run { "would be " } else { "" };
        let _ = writeln!(
            out,
            "  Files {}restored: {} new, {} overwritten, {} identical, {} skipped",
            verb, self.new_files, self.overwritten, self.identical, self.skipped
        );
        let _ = writeln!(out, "  Bytes {}restored: {}", verb, format_size(self.bytes_restored));
        match &self.snapshot {
            Some(dir) => {
                let _ = writeln!(out, "  Snapshot: {}", dir.display());
            }
            None => out.push_str("  Snapshot: none\n"),
        }
        if self.dconf_loaded {
            out.push_str("  dconf settings loaded\n");
        }
        if let Some(packages) = &self.packages {
            out.push_str(&packages.render());
        }
        write_warnings(&mut out, &self.warnings);
        out
    }
}

/// Package section of a restore report
#[derive(Debug, Clone, Default, Serialize)]
pub struct PackageSummary {
    pub resolved: usize,
    pub fuzzy: Vec<(String, String)>,
    pub unresolved: Vec<String>,
    pub already_installed: usize,
    pub commands: Vec<String>,
    pub steps: Vec<(PackageManagerKind, StepOutcome)>,
    /// True when nothing was executed and only the plan is shown
    pub preview: bool,
}

impl PackageSummary {
    pub fn from_plan(plan: &InstallPlan, steps: Vec<(PackageManagerKind, StepOutcome)>, preview: bool) -> Self {
        Self {
            resolved: plan.count(Outcome::Resolved),
            fuzzy: plan
                .fuzzy()
                .filter_map(|r| Some((r.requested.clone(), r.resolved.clone()?)))
                .collect(),
            unresolved: plan.unresolved().map(|r| r.requested.clone()).collect(),
            already_installed: plan.already_installed.len(),
            commands: plan.steps.iter().map(|s| s.command.join(" ")).collect(),
            steps,
            preview,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "  Packages: {} resolved, {} fuzzy, {} unresolved, {} already installed",
            self.resolved,
            self.fuzzy.len(),
            self.unresolved.len(),
            self.already_installed
        );
        for (requested, resolved) in &self.fuzzy {
            let _ = writeln!(out, "    ~ {} -> {}", requested, resolved);
        }
        if self.preview {
            if !self.commands.is_empty() {
                out.push_str("  Install commands (not executed):\n");
            }
            for command in &self.commands {
                let _ = writeln!(out, "    $ {}", command);
            }
        }
        for (manager, outcome) in &self.steps {
            let status = match outcome {
                StepOutcome::DryRun => "dry run".to_string(),
                StepOutcome::Installed => "installed".to_string(),
                StepOutcome::Failed(reason) => format!("failed: {}", reason),
            };
            let _ = writeln!(out, "    {}: {}", manager, status);
        }
        if !self.unresolved.is_empty() {
            let _ = writeln!(
                out,
                "  Manual install required: {}",
                self.unresolved.join(", ")
            );
        }
        out
    }
}

fn write_warnings(out: &mut String, warnings: &[String]) {
    let _ = writeln!(out, "  Warnings: {}", warnings.len());
    for warning in warnings {
        let _ = writeln!(out, "    ! {}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1048576), "1.0 MB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GB");
        assert_eq!(format_size(3 * 1024u64.pow(4)), "3.0 TB");
        assert_eq!(format_size(2048 * 1024u64.pow(4)), "2048.0 TB");
    }

    #[test]
    fn test_size_report_totals() {
        let mut sizes = BTreeMap::new();
        sizes.insert("configs".to_string(), 2048);
        sizes.insert("shells".to_string(), 100);
        let report = size_report(&sizes, 3);
        assert!(report.contains("  - configs: 2.0 KB"));
        assert!(report.contains("  - shells: 100 B"));
        assert!(report.contains("Total: 2.1 KB across 3 path(s)"));
    }

    #[test]
    fn test_backup_summary_dry_run_shape() {
        let summary = BackupSummary {
            profile: "work".into(),
            version: "v1".into(),
            archive: PathBuf::from("/store/work/v1.tar.gz"),
            components: vec!["configs".into()],
            dry_run: true,
            warnings: vec!["Path not found: .zshrc".into()],
            ..Default::default()
        };
        let text = summary.render();
        assert!(text.starts_with("Backup dry-run summary:"));
        assert!(text.contains("Target archive: /store/work/v1.tar.gz"));
        assert!(text.contains("Warnings: 1"));
        assert!(!text.contains("Archive size"));
    }

    #[test]
    fn test_restore_summary_counts() {
        let summary = RestoreSummary {
            archive: PathBuf::from("a.tar.gz"),
            new_files: 2,
            overwritten: 1,
            identical: 4,
            skipped: 0,
            packages: Some(PackageSummary {
                unresolved: vec!["yay-bin".into()],
                fuzzy: vec![("firefox".into(), "firefox-esr".into())],
                commands: vec!["sudo apt-get install firefox-esr".into()],
                preview: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let text = summary.render();
        assert!(text.contains("2 new, 1 overwritten, 4 identical, 0 skipped"));
        assert!(text.contains("~ firefox -> firefox-esr"));
        assert!(text.contains("$ sudo apt-get install firefox-esr"));
        assert!(text.contains("Manual install required: yay-bin"));
    }
}
