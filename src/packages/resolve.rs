//! Smart Resolve: find an installable equivalent for a recorded package.
//!
//! For every requested name, in order:
//!
//! 1. apply a static per-distribution substitution (`firefox` on Debian is
//!    `firefox-esr`)
//! 2. exact lookup in each manager's index, in priority order
//! 3. fuzzy search: candidates from each manager's search are scored with
//!    normalised Levenshtein similarity after stripping distro suffixes;
//!    the best candidate of the first manager reaching the threshold wins
//!
//! Outcomes are values ([`Outcome`]), never errors: an unresolved package is
//! reported, not raised.

use serde::Serialize;
use std::collections::HashMap;

use super::collect::normalize_pkg_name;
use super::{OsRelease, PackageManager};
use crate::error::BackmeyError;
use crate::types::PackageManagerKind;

/// Per-distribution renames applied before any lookup
const DISTRO_SUBSTITUTIONS: &[(&str, &[(&str, &str)])] = &[
    ("debian", &[("firefox", "firefox-esr"), ("steam", "steam-installer")]),
    ("ubuntu", &[("firefox-esr", "firefox")]),
    ("arch", &[("steam", "steam-native-runtime")]),
    ("manjaro", &[("steam", "steam-native-runtime")]),
    ("fedora", &[("chromium", "chromium-browser")]),
    ("opensuse", &[("chromium-browser", "chromium")]),
];

/// Suffixes that distributions append to otherwise identical packages
const DISTRO_SUFFIXES: &[&str] = &[
    "-native-runtime",
    "-installer",
    "-browser",
    "-stable",
    "-esr",
    "-bin",
    "-git",
];

const DISTRO_PREFIXES: &[&str] = &["python3-", "python-"];

/// How a package was resolved
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Found verbatim (possibly after a static distro substitution)
    Resolved,
    /// Substituted by a fuzzy match at or above the threshold
    FuzzyResolved,
    /// No acceptable candidate on any manager
    Unresolved,
}

/// One package resolution record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub requested: String,
    pub manager: Option<PackageManagerKind>,
    /// Installable name; `None` when unresolved
    pub resolved: Option<String>,
    /// 1.0 for exact matches, the similarity score otherwise
    pub confidence: f64,
    pub outcome: Outcome,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        self.outcome != Outcome::Unresolved
    }

    /// The non-fatal error an unresolved record reports
    pub fn failure(&self) -> Option<BackmeyError> {
        if self.is_resolved() {
            return None;
        }
        Some(BackmeyError::PackageResolution(format!(
            "no match for '{}' (best similarity {:.2})",
            self.requested, self.confidence
        )))
    }
}

/// Normalised Levenshtein similarity in `[0, 1]`; 1.0 means equal.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Canonical form used for fuzzy comparison
pub fn match_key(name: &str) -> String {
    let mut key = normalize_pkg_name(name);
    for prefix in DISTRO_PREFIXES {
        if let Some(rest) = key.strip_prefix(prefix).filter(|r| !r.is_empty()) {
            key = rest.to_string();
            break;
        }
    }
    // suffixes can stack (`foo-bin-git`)
    loop {
        let stripped = DISTRO_SUFFIXES
            .iter()
            .find_map(|s| key.strip_suffix(s).filter(|r| !r.is_empty()).map(String::from));
        match stripped {
            Some(rest) => key = rest,
            None => break,
        }
    }
    key
}

/// Static substitution for the first matching distro key
pub fn distro_substitution(release: &OsRelease, name: &str) -> Option<&'static str> {
    release.keys().iter().find_map(|key| {
        DISTRO_SUBSTITUTIONS
            .iter()
            .find(|(distro, _)| distro == key)
            .and_then(|(_, subs)| subs.iter().find(|(from, _)| *from == name))
            .map(|(_, to)| *to)
    })
}

/// Resolver over an ordered set of managers
pub struct SmartResolver<'a> {
    managers: &'a [Box<dyn PackageManager>],
    release: OsRelease,
    threshold: f64,
    /// Keyed by name and target manager; `None` is the native set
    cache: HashMap<(String, Option<PackageManagerKind>), Resolution>,
}

impl<'a> SmartResolver<'a> {
    pub fn new(managers: &'a [Box<dyn PackageManager>], release: OsRelease, threshold: f64) -> Self {
        Self {
            managers,
            release,
            threshold,
            cache: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Resolve a distribution package against native managers.
    pub fn resolve(&mut self, name: &str) -> Resolution {
        self.resolve_on(name, None)
    }

    /// Resolve a package that only makes sense on one manager (flatpak ids,
    /// snaps, pip distributions).
    pub fn resolve_for(&mut self, name: &str, kind: PackageManagerKind) -> Resolution {
        self.resolve_on(name, Some(kind))
    }

    fn resolve_on(&mut self, name: &str, target: Option<PackageManagerKind>) -> Resolution {
        let cache_key = (name.to_string(), target);
        if let Some(hit) = self.cache.get(&cache_key) {
            return hit.clone();
        }

        let all: &'a [Box<dyn PackageManager>] = self.managers;
        let managers: Vec<&dyn PackageManager> = all
            .iter()
            .map(|m| m.as_ref())
            .filter(|m| target.map_or(m.kind().is_native(), |t| m.kind() == t))
            .collect();

        let resolution = self.resolve_uncached(name, &managers, target.is_none());
        match resolution.outcome {
            Outcome::Resolved => tracing::debug!(
                "{} -> {} via {:?}",
                name,
                resolution.resolved.as_deref().unwrap_or_default(),
                resolution.manager
            ),
            Outcome::FuzzyResolved => tracing::info!(
                "Swapped '{}' -> '{}' (similarity {:.2})",
                name,
                resolution.resolved.as_deref().unwrap_or_default(),
                resolution.confidence
            ),
            Outcome::Unresolved => tracing::debug!("{} unresolved", name),
        }
        self.cache.insert(cache_key, resolution.clone());
        resolution
    }

    fn resolve_uncached(
        &self,
        name: &str,
        managers: &[&dyn PackageManager],
        native: bool,
    ) -> Resolution {
        let substituted = if native {
            distro_substitution(&self.release, name)
        } else {
            None
        };
        let mut exact_candidates: Vec<&str> = Vec::new();
        if let Some(sub) = substituted {
            exact_candidates.push(sub);
        }
        exact_candidates.push(name);

        for manager in managers {
            for candidate in &exact_candidates {
                if manager.exists(candidate) {
                    return Resolution {
                        requested: name.to_string(),
                        manager: Some(manager.kind()),
                        resolved: Some(candidate.to_string()),
                        confidence: 1.0,
                        outcome: Outcome::Resolved,
                    };
                }
            }
        }

        let wanted = match_key(name);
        let mut best_overall = 0.0_f64;
        for manager in managers {
            let mut candidates = manager.search(name);
            if candidates.is_empty() && wanted != name {
                candidates = manager.search(&wanted);
            }
            let best = candidates
                .iter()
                .map(|c| (c, similarity(&wanted, &match_key(c)), similarity(name, c)))
                .max_by(|a, b| {
                    a.1.total_cmp(&b.1)
                        .then(a.2.total_cmp(&b.2))
                        // shorter names first on a full tie
                        .then(b.0.len().cmp(&a.0.len()))
                });
            if let Some((candidate, score, _)) = best {
                best_overall = best_overall.max(score);
                if score >= self.threshold {
                    return Resolution {
                        requested: name.to_string(),
                        manager: Some(manager.kind()),
                        resolved: Some(candidate.clone()),
                        confidence: score,
                        outcome: Outcome::FuzzyResolved,
                    };
                }
            }
        }

        Resolution {
            requested: name.to_string(),
            manager: None,
            resolved: None,
            confidence: best_overall,
            outcome: Outcome::Unresolved,
        }
    }
}
