//! Desktop environment detection
//!
//! Reports the desktop, display server and session the user is running.
//!
//! # Design
//!
//! - **Never fails**: anything that cannot be determined becomes `"unknown"`
//! - **No side effects**: reads environment variables and `/proc/*/comm`
//!   only; nothing is spawned or written
//! - **Testable**: [`Detection::from_parts`] takes the inputs explicitly

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::components::DEFAULT_COMPONENTS;
use crate::types::DisplayServer;

/// Placeholder for values that could not be detected
pub const UNKNOWN: &str = "unknown";

/// Process names that reveal a running desktop or compositor
const PROCESS_HINTS: &[(&str, &str)] = &[
    ("gnome-shell", "GNOME"),
    ("mutter", "GNOME"),
    ("plasmashell", "KDE Plasma"),
    ("kwin_x11", "KDE Plasma"),
    ("kwin_wayland", "KDE Plasma"),
    ("xfce4-session", "XFCE"),
    ("xfwm4", "XFCE"),
    ("i3", "i3"),
    ("sway", "Sway"),
    ("cinnamon", "Cinnamon"),
    ("lxqt-session", "LXQt"),
    ("budgie-wm", "Budgie"),
    ("budgie-panel", "Budgie"),
    ("Hyprland", "Hyprland"),
    ("hyprland", "Hyprland"),
    ("gala", "Pantheon"),
    ("cosmic-comp", "Cosmic"),
];

/// Keyword (matched case-insensitively) to canonical desktop name
const CANONICAL: &[(&[&str], &str)] = &[
    (&["GNOME"], "GNOME"),
    (&["PLASMA", "KDE"], "KDE Plasma"),
    (&["XFCE"], "XFCE"),
    (&["I3"], "i3"),
    (&["SWAY"], "Sway"),
    (&["CINNAMON"], "Cinnamon"),
    (&["LXQT"], "LXQt"),
    (&["BUDGIE"], "Budgie"),
    (&["HYPR"], "Hyprland"),
    (&["PANTHEON", "GALA"], "Pantheon"),
    (&["COSMIC"], "Cosmic"),
];

/// Environment variables the detector reads
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    pub xdg_current_desktop: Option<String>,
    pub desktop_session: Option<String>,
    pub gdm_session: Option<String>,
    pub xdg_session_type: Option<String>,
    pub wayland_display: Option<String>,
    pub display: Option<String>,
}

impl EnvSnapshot {
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        Self {
            xdg_current_desktop: var("XDG_CURRENT_DESKTOP"),
            desktop_session: var("DESKTOP_SESSION"),
            gdm_session: var("GDMSESSION"),
            xdg_session_type: var("XDG_SESSION_TYPE"),
            wayland_display: var("WAYLAND_DISPLAY"),
            display: var("DISPLAY"),
        }
    }
}

/// Detection result, embedded in every manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub desktop: String,
    pub display_server: DisplayServer,
    pub session: String,
    #[serde(default)]
    pub env_desktops: Vec<String>,
    #[serde(default)]
    pub wm_hints: Vec<String>,
}

impl Default for Detection {
    fn default() -> Self {
        Self {
            desktop: UNKNOWN.to_string(),
            display_server: DisplayServer::Unknown,
            session: UNKNOWN.to_string(),
            env_desktops: Vec::new(),
            wm_hints: Vec::new(),
        }
    }
}

impl Detection {
    /// Detect from the live environment and process table.
    pub fn detect() -> Self {
        let detection = Self::from_parts(&EnvSnapshot::from_env(), &running_process_names());
        tracing::debug!(
            "Detection: desktop={}, display_server={}, session={}",
            detection.desktop,
            detection.display_server,
            detection.session
        );
        detection
    }

    /// Pure detection from explicit inputs.
    pub fn from_parts<S: AsRef<str>>(env: &EnvSnapshot, process_names: &[S]) -> Self {
        let env_desktops: Vec<String> = env
            .xdg_current_desktop
            .as_deref()
            .unwrap_or_default()
            .split(':')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let wm_hints: Vec<String> = process_names
            .iter()
            .filter_map(|name| {
                PROCESS_HINTS
                    .iter()
                    .find(|(proc_name, _)| *proc_name == name.as_ref())
                    .map(|(_, desktop)| desktop.to_string())
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let session = env
            .desktop_session
            .clone()
            .or_else(|| env.gdm_session.clone());

        let mut candidates: Vec<&str> = env_desktops.iter().map(String::as_str).collect();
        candidates.extend(wm_hints.iter().map(String::as_str));
        if let Some(s) = session.as_deref() {
            candidates.push(s);
        }

        Self {
            desktop: choose_best(&candidates).unwrap_or_else(|| UNKNOWN.to_string()),
            display_server: display_server(env),
            session: session.unwrap_or_else(|| UNKNOWN.to_string()),
            env_desktops,
            wm_hints,
        }
    }

    /// Components worth backing up on this desktop when none were requested.
    ///
    /// Full desktop environments keep their state in `configs` and dconf,
    /// so the standalone window-manager component is only suggested for
    /// tiling compositors or when the desktop is unknown.
    pub fn suggested_components(&self) -> Vec<String> {
        let standalone_wm = matches!(self.desktop.as_str(), "i3" | "Sway" | "Hyprland")
            || self.desktop == UNKNOWN;
        DEFAULT_COMPONENTS
            .iter()
            .filter(|c| **c != "wm" || standalone_wm)
            .map(|c| c.to_string())
            .collect()
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} (session: {})",
            self.desktop, self.display_server, self.session
        )
    }
}

fn choose_best(candidates: &[&str]) -> Option<String> {
    for candidate in candidates {
        let upper = candidate.to_uppercase();
        for (keywords, name) in CANONICAL {
            if keywords.iter().any(|k| upper.contains(k)) {
                return Some(name.to_string());
            }
        }
    }
    candidates.first().map(|c| c.to_string())
}

fn display_server(env: &EnvSnapshot) -> DisplayServer {
    match env.xdg_session_type.as_deref().map(str::to_lowercase).as_deref() {
        Some("wayland") => return DisplayServer::Wayland,
        Some("x11") => return DisplayServer::X11,
        Some("tty") => return DisplayServer::Tty,
        _ => {}
    }
    if env.wayland_display.is_some() {
        DisplayServer::Wayland
    } else if env.display.is_some() {
        DisplayServer::X11
    } else {
        DisplayServer::Unknown
    }
}

/// Names of running processes from `/proc/<pid>/comm`; empty on any error.
fn running_process_names() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|e| std::fs::read_to_string(e.path().join("comm")).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
