//! Type-safe enums shared across backmey
//!
//! Package managers, compression codecs, display servers and component
//! categories are closed sets; modelling them as enums gives exhaustive
//! matching and a single place for their string forms.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Package managers backmey knows how to query and drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
pub enum PackageManagerKind {
    #[strum(serialize = "pacman")]
    Pacman,
    #[strum(serialize = "apt")]
    Apt,
    #[strum(serialize = "dnf")]
    Dnf,
    #[strum(serialize = "zypper")]
    Zypper,
    #[strum(serialize = "nix-env")]
    NixEnv,
    #[strum(serialize = "flatpak")]
    Flatpak,
    #[strum(serialize = "snap")]
    Snap,
    #[strum(serialize = "pip")]
    Pip,
}

impl PackageManagerKind {
    /// Executable whose presence on `PATH` means this manager is usable
    pub fn binary(self) -> &'static str {
        match self {
            Self::Pacman => "pacman",
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Zypper => "zypper",
            Self::NixEnv => "nix-env",
            Self::Flatpak => "flatpak",
            Self::Snap => "snap",
            Self::Pip => "pip",
        }
    }

    /// Distribution-level managers whose names feed the canonical package list
    pub fn is_native(self) -> bool {
        matches!(self, Self::Pacman | Self::Apt | Self::Dnf | Self::Zypper | Self::NixEnv)
    }

    /// Whether installing through this manager needs root
    pub fn needs_sudo(self) -> bool {
        matches!(
            self,
            Self::Pacman | Self::Apt | Self::Dnf | Self::Zypper | Self::Snap
        )
    }
}

/// Compression codec used for the tar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
}

impl Compression {
    /// File extension including the tar part
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gzip => "tar.gz",
            Self::Zstd => "tar.zst",
        }
    }

    /// Sniff the codec from the first bytes of a file
    pub fn from_magic(header: &[u8]) -> Option<Self> {
        match header {
            [0x1f, 0x8b, ..] => Some(Self::Gzip),
            [0x28, 0xb5, 0x2f, 0xfd, ..] => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Graphical session transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DisplayServer {
    Wayland,
    X11,
    Tty,
    #[default]
    Unknown,
}

/// Broad grouping of backup components, used for listing and defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ComponentCategory {
    Config,
    Shell,
    Desktop,
    Appearance,
    Application,
    Data,
    Custom,
}
