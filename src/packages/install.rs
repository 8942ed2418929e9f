//! Batched install plans.
//!
//! Recorded packages are resolved once, grouped by the manager that will
//! install them, and each group becomes one installer invocation. Packages
//! already installed are left out; unresolved ones are kept on the plan so
//! they can be reported as "manual install required".

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use super::collect::normalize_pkg_name;
use super::resolve::{Outcome, Resolution, SmartResolver};
use super::PackageManager;
use crate::types::PackageManagerKind;

/// One installer invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstallStep {
    pub manager: PackageManagerKind,
    pub packages: Vec<String>,
    pub command: Vec<String>,
}

/// Result of running (or previewing) one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    DryRun,
    Installed,
    Failed(String),
}

/// Everything a restore will do about packages
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallPlan {
    pub steps: Vec<InstallStep>,
    pub resolutions: Vec<Resolution>,
    pub already_installed: Vec<String>,
}

impl InstallPlan {
    /// Resolve `recorded` packages and group them per manager.
    ///
    /// Native packages use `canonical` when present (falling back to the
    /// union of native lists); flatpak and snap entries only go to their own
    /// manager. pip inventories are informational and never planned.
    pub fn build(
        resolver: &mut SmartResolver<'_>,
        managers: &[Box<dyn PackageManager>],
        recorded: &BTreeMap<PackageManagerKind, Vec<String>>,
        canonical: &[String],
        assume_yes: bool,
    ) -> Self {
        let mut installed: BTreeMap<PackageManagerKind, HashSet<String>> = BTreeMap::new();
        for manager in managers {
            if let Ok(names) = manager.list_installed() {
                installed.insert(
                    manager.kind(),
                    names.iter().map(|n| normalize_pkg_name(n)).collect(),
                );
            }
        }
        let is_installed = |name: &str, native: bool, kind: Option<PackageManagerKind>| {
            let key = normalize_pkg_name(name);
            installed.iter().any(|(k, set)| {
                (if native { k.is_native() } else { Some(*k) == kind }) && set.contains(&key)
            })
        };

        let native: Vec<String> = if canonical.is_empty() {
            let mut names: Vec<String> = recorded
                .iter()
                .filter(|(k, _)| k.is_native())
                .flat_map(|(_, v)| v.iter().map(|n| normalize_pkg_name(n)))
                .filter(|n| !n.is_empty())
                .collect();
            names.sort();
            names.dedup();
            names
        } else {
            canonical.to_vec()
        };

        let mut plan = Self::default();
        let mut grouped: BTreeMap<PackageManagerKind, Vec<String>> = BTreeMap::new();
        let mut push = |plan: &mut Self, r: Resolution| {
            if let (Some(kind), Some(name)) = (r.manager, r.resolved.clone()) {
                let group = grouped.entry(kind).or_default();
                if !group.contains(&name) {
                    group.push(name);
                }
            }
            plan.resolutions.push(r);
        };

        for name in &native {
            if is_installed(name, true, None) {
                plan.already_installed.push(name.clone());
                continue;
            }
            let r = resolver.resolve(name);
            push(&mut plan, r);
        }
        for kind in [PackageManagerKind::Flatpak, PackageManagerKind::Snap] {
            for name in recorded.get(&kind).into_iter().flatten() {
                if is_installed(name, false, Some(kind)) {
                    plan.already_installed.push(name.clone());
                    continue;
                }
                let r = resolver.resolve_for(name, kind);
                push(&mut plan, r);
            }
        }

        // steps follow manager priority
        for manager in managers {
            if let Some(packages) = grouped.remove(&manager.kind()) {
                let command = manager.install_command(&packages, assume_yes);
                plan.steps.push(InstallStep {
                    manager: manager.kind(),
                    packages,
                    command,
                });
            }
        }
        plan
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &Resolution> {
        self.resolutions.iter().filter(|r| r.outcome == Outcome::Unresolved)
    }

    pub fn fuzzy(&self) -> impl Iterator<Item = &Resolution> {
        self.resolutions.iter().filter(|r| r.outcome == Outcome::FuzzyResolved)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.resolutions.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step, or only preview when `dry_run`.
    ///
    /// A failing step is reported and the remaining steps still run.
    pub fn execute(
        &self,
        managers: &[Box<dyn PackageManager>],
        assume_yes: bool,
        dry_run: bool,
    ) -> Vec<(PackageManagerKind, StepOutcome)> {
        let mut outcomes = Vec::new();
        for step in &self.steps {
            if dry_run {
                outcomes.push((step.manager, StepOutcome::DryRun));
                continue;
            }
            let Some(manager) = managers.iter().find(|m| m.kind() == step.manager) else {
                outcomes.push((step.manager, StepOutcome::Failed("manager unavailable".into())));
                continue;
            };
            tracing::info!("Installing {} package(s) via {}", step.packages.len(), step.manager);
            let outcome = match manager.install(&step.packages, assume_yes) {
                Ok(status) if status.success() => StepOutcome::Installed,
                Ok(status) => {
                    let msg = format!("{} exited with {}", step.manager, status);
                    tracing::warn!("{}", msg);
                    StepOutcome::Failed(msg)
                }
                Err(e) => {
                    tracing::warn!("{} install failed: {}", step.manager, e);
                    StepOutcome::Failed(e.to_string())
                }
            };
            outcomes.push((step.manager, outcome));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::packages::OsRelease;
    use std::cell::RefCell;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    struct Repo {
        kind: PackageManagerKind,
        index: Vec<&'static str>,
        installed: Vec<&'static str>,
        fail: bool,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl Repo {
        fn new(kind: PackageManagerKind, index: &[&'static str]) -> Self {
            Self {
                kind,
                index: index.to_vec(),
                installed: Vec::new(),
                fail: false,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl PackageManager for Repo {
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
            Ok(ExitStatus::from_raw(if self.fail { 256 } else { 0 }))
        }
    }

    fn recorded(pairs: &[(PackageManagerKind, &[&str])]) -> BTreeMap<PackageManagerKind, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| (*k, v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_plan_batches_per_manager() {
        let managers: Vec<Box<dyn PackageManager>> = vec![
            Box::new(Repo::new(PackageManagerKind::Apt, &["firefox-esr", "git", "vim"])),
            Box::new(Repo::new(PackageManagerKind::Flatpak, &["org.gimp.GIMP"])),
        ];
        let mut resolver = SmartResolver::new(&managers, OsRelease::default(), 0.85);
        let packages = recorded(&[
            (PackageManagerKind::Pacman, &["firefox", "git", "vim", "yay-bin"]),
            (PackageManagerKind::Flatpak, &["org.gimp.GIMP"]),
            (PackageManagerKind::Pip, &["requests"]),
        ]);

        let plan = InstallPlan::build(&mut resolver, &managers, &packages, &[], true);

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].manager, PackageManagerKind::Apt);
        assert_eq!(plan.steps[0].packages, ["firefox-esr", "git", "vim"]);
        assert_eq!(plan.steps[1].packages, ["org.gimp.GIMP"]);
        assert_eq!(plan.count(Outcome::FuzzyResolved), 1);
        let unresolved: Vec<_> = plan.unresolved().map(|r| r.requested.as_str()).collect();
        assert_eq!(unresolved, ["yay-bin"]);
        assert!(plan.steps[0].command.iter().any(|a| a == "-y"));
    }

    #[test]
    fn test_installed_packages_are_skipped() {
        let mut apt = Repo::new(PackageManagerKind::Apt, &["git", "vim"]);
        apt.installed = vec!["git"];
        let managers: Vec<Box<dyn PackageManager>> = vec![Box::new(apt)];
        let mut resolver = SmartResolver::new(&managers, OsRelease::default(), 0.85);

        let plan = InstallPlan::build(
            &mut resolver,
            &managers,
            &BTreeMap::new(),
            &["git".to_string(), "vim".to_string()],
            false,
        );
        assert_eq!(plan.already_installed, ["git"]);
        assert_eq!(plan.steps[0].packages, ["vim"]);
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let managers: Vec<Box<dyn PackageManager>> =
            vec![Box::new(Repo::new(PackageManagerKind::Apt, &["vim"]))];
        let mut resolver = SmartResolver::new(&managers, OsRelease::default(), 0.85);
        let plan = InstallPlan::build(&mut resolver, &managers, &BTreeMap::new(), &["vim".into()], true);

        let outcomes = plan.execute(&managers, true, true);
        assert_eq!(outcomes, [(PackageManagerKind::Apt, StepOutcome::DryRun)]);
    }

    #[test]
    fn test_failed_step_does_not_stop_others() {
        let mut apt = Repo::new(PackageManagerKind::Apt, &["vim"]);
        apt.fail = true;
        let managers: Vec<Box<dyn PackageManager>> = vec![
            Box::new(apt),
            Box::new(Repo::new(PackageManagerKind::Snap, &["spotify"])),
        ];
        let mut resolver = SmartResolver::new(&managers, OsRelease::default(), 0.85);
        let packages = recorded(&[(PackageManagerKind::Snap, &["spotify"])]);
        let plan = InstallPlan::build(&mut resolver, &managers, &packages, &["vim".into()], true);

        let outcomes = plan.execute(&managers, true, false);
        assert!(matches!(outcomes[0].1, StepOutcome::Failed(_)));
        assert_eq!(outcomes[1], (PackageManagerKind::Snap, StepOutcome::Installed));
    }
}
