//! Installed-package inventory taken at backup time.

use std::collections::{BTreeMap, BTreeSet};

use super::PackageManager;
use crate::types::PackageManagerKind;

/// Installed packages of every available manager.
///
/// A manager that fails to list is logged and left out; collection never
/// aborts a backup.
pub fn collect_installed(
    managers: &[Box<dyn PackageManager>],
) -> BTreeMap<PackageManagerKind, Vec<String>> {
    let mut packages = BTreeMap::new();
    for manager in managers {
        match manager.list_installed() {
            Ok(names) if !names.is_empty() => {
                tracing::debug!("Collected {} packages from {}", names.len(), manager.kind());
                packages.insert(manager.kind(), names);
            }
            Ok(_) => tracing::debug!("{} reported no installed packages", manager.kind()),
            Err(e) => tracing::warn!("Could not list {} packages: {}", manager.kind(), e),
        }
    }
    packages
}

/// Normalise a package token for cross-distro comparison.
///
/// Takes the first word, drops `/repo` and `@version` parts and a trailing
/// comma, lowercases, and strips a numeric `-1.2.3` version suffix (except
/// for reverse-DNS flatpak ids).
pub fn normalize_pkg_name(name: &str) -> String {
    let Some(token) = name.split_whitespace().next() else {
        return String::new();
    };
    let token = token.split('/').next().unwrap_or_default();
    let token = token.split('@').next().unwrap_or_default();
    let token = token.trim_end_matches(',').to_lowercase();

    if !token.starts_with("org.") {
        if let Some((base, suffix)) = token.rsplit_once('-') {
            let digits: String = suffix.chars().filter(|c| *c != '.').collect();
            if !base.is_empty() && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return base.to_string();
            }
        }
    }
    token
}

/// Sorted, de-duplicated normalised names of all native-manager packages
pub fn canonicalize(packages: &BTreeMap<PackageManagerKind, Vec<String>>) -> Vec<String> {
    packages
        .iter()
        .filter(|(kind, _)| kind.is_native())
        .flat_map(|(_, names)| names.iter())
        .map(|n| normalize_pkg_name(n))
        .filter(|n| !n.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
