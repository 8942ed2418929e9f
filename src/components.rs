//! Component registry
//!
//! A component is a named group of home-relative path patterns describing
//! one facet of the desktop (shell dotfiles, themes, fonts, ...). The
//! registry is built once and passed by reference to the archiver and
//! restorer; nothing mutates it afterwards.
//!
//! Patterns are either literal relative paths or globs (`*`, `?`, `[..]`,
//! `{..}`). Literal paths are checked for existence, globs are matched
//! against the home tree below their longest literal prefix.

use globset::{GlobBuilder, GlobMatcher};
use std::collections::BTreeMap;
use std::path::{Component as PathComponent, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{BackmeyError, Result};
use crate::types::{ComponentCategory, PackageManagerKind};

/// Components selected when the user does not pass `--components`
pub const DEFAULT_COMPONENTS: &[&str] = &[
    "configs",
    "shells",
    "wm",
    "terminal",
    "themes",
    "icons",
    "fonts",
    "wallpapers",
];

/// Component name used for `--include` paths
pub const CUSTOM_COMPONENT: &str = "custom";

/// One named group of paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub category: ComponentCategory,
    /// Home-relative literal paths or globs, in archive order
    pub patterns: Vec<String>,
    /// Only collected when this tool is installed
    pub requires: Option<PackageManagerKind>,
}

impl Component {
    fn new(name: &str, category: ComponentCategory, patterns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            category,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            requires: None,
        }
    }

    fn requiring(mut self, kind: PackageManagerKind) -> Self {
        self.requires = Some(kind);
        self
    }

    /// Expand this component's patterns against `home`.
    ///
    /// Returns home-relative paths that exist, in pattern order, without
    /// duplicates. Missing literal paths are simply absent from the result.
    pub fn expand(&self, home: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for pattern in &self.patterns {
            for rel in expand_pattern(pattern, home)? {
                if !found.contains(&rel) {
                    found.push(rel);
                }
            }
        }
        Ok(found)
    }
}

/// Immutable set of known components
#[derive(Debug, Clone)]
pub struct ComponentRegistry {
    components: BTreeMap<String, Component>,
}

impl ComponentRegistry {
    /// The built-in component table
    pub fn builtin() -> Self {
        use ComponentCategory::*;
        Self::from_components(vec![
            Component::new("configs", Config, &[".config"]),
            Component::new("data", Data, &[".local/share"]),
            Component::new("bin", Data, &[".local/bin", "bin"]),
            Component::new("systemd", Config, &[".config/systemd"]),
            Component::new(
                "shells",
                Shell,
                &[
                    ".bashrc",
                    ".bash_profile",
                    ".bash_aliases",
                    ".profile",
                    ".zshrc",
                    ".zprofile",
                    ".config/fish",
                    ".config/starship.toml",
                    ".oh-my-zsh",
                ],
            ),
            Component::new(
                "wm",
                Desktop,
                &[
                    ".config/i3",
                    ".config/sway",
                    ".config/hypr",
                    ".config/hyprland",
                    ".config/awesome",
                    ".config/qtile",
                    ".config/waybar",
                    ".config/river",
                ],
            ),
            Component::new(
                "terminal",
                Application,
                &[
                    ".config/alacritty",
                    ".config/kitty",
                    ".config/wezterm",
                    ".config/ghostty",
                    ".config/tilix",
                    ".config/gnome-terminal",
                    ".config/terminator",
                ],
            ),
            Component::new(
                "themes",
                Appearance,
                &[".themes", ".local/share/themes", ".config/gtk-[34].0", ".gtkrc-2.0"],
            ),
            Component::new("icons", Appearance, &[".icons", ".local/share/icons"]),
            Component::new("fonts", Appearance, &[".fonts", ".local/share/fonts"]),
            Component::new(
                "wallpapers",
                Appearance,
                &[
                    ".local/share/backgrounds",
                    "Pictures/Wallpapers",
                    "Pictures/wallpapers",
                    "Pictures/backgrounds",
                ],
            ),
            Component::new(
                "browsers",
                Application,
                &[
                    ".mozilla",
                    ".config/google-chrome",
                    ".config/chromium",
                    ".config/BraveSoftware",
                    ".config/microsoft-edge*",
                ],
            ),
            Component::new("flatpak", Application, &[".var/app"])
                .requiring(PackageManagerKind::Flatpak),
            Component::new("snap", Application, &["snap"]).requiring(PackageManagerKind::Snap),
        ])
    }

    pub fn from_components(list: Vec<Component>) -> Self {
        Self {
            components: list.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Component> {
        self.components.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    /// Resolve requested names to components, keeping request order.
    ///
    /// Unknown names are a validation error listing the valid ones.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<&Component>> {
        let mut selected: Vec<&Component> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            let component = self.get(name).ok_or_else(|| {
                BackmeyError::validation(format!(
                    "Unknown component '{}' (known: {})",
                    name,
                    self.names().collect::<Vec<_>>().join(", ")
                ))
            })?;
            if !selected.iter().any(|c| c.name == component.name) {
                selected.push(component);
            }
        }
        Ok(selected)
    }

    /// Component owning a home-relative path, by longest matching literal
    /// prefix. Used to attribute archive entries on restore.
    pub fn owner_of(&self, rel: &Path) -> Option<&Component> {
        self.iter()
            .flat_map(|c| c.patterns.iter().map(move |p| (c, p)))
            .filter(|(_, p)| !is_glob(p) && rel.starts_with(p.as_str()))
            .max_by_key(|(_, p)| p.len())
            .map(|(c, _)| c)
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Whether a pattern contains glob metacharacters
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}

/// Expand one pattern to existing home-relative paths, sorted.
pub fn expand_pattern(pattern: &str, home: &Path) -> Result<Vec<PathBuf>> {
    let rel = Path::new(pattern);
    if rel.is_absolute() || rel.components().any(|c| matches!(c, PathComponent::ParentDir)) {
        return Err(BackmeyError::validation(format!(
            "Component pattern must stay inside home: {}",
            pattern
        )));
    }

    if !is_glob(pattern) {
        let abs = home.join(rel);
        return Ok(if abs.symlink_metadata().is_ok() {
            vec![rel.to_path_buf()]
        } else {
            tracing::debug!("{}", BackmeyError::PathNotFound(abs));
            Vec::new()
        });
    }

    let matcher = compile_glob(pattern)?;
    let depth = rel.components().count();
    let prefix: PathBuf = rel
        .components()
        .take_while(|c| !is_glob(&c.as_os_str().to_string_lossy()))
        .collect();
    let base = home.join(&prefix);
    if !base.is_dir() {
        return Ok(Vec::new());
    }

    let mut found: Vec<PathBuf> = WalkDir::new(&base)
        .min_depth(1)
        .max_depth(depth - prefix.components().count())
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.path().strip_prefix(home).ok().map(Path::to_path_buf))
        .filter(|p| p.components().count() == depth && matcher.is_match(p))
        .collect();
    found.sort();
    Ok(found)
}

/// `*` does not cross directory separators
pub fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| BackmeyError::validation(format!("Invalid glob pattern {}: {}", pattern, e)))
}
