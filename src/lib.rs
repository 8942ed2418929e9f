//! backmey library
//!
//! Backup and restore engine for Linux desktop configuration: component
//! registry, archiver, restorer, gpg encryption adapter, manifest inspection,
//! desktop detection and cross-distribution package resolution.

pub mod archive;
pub mod cli;
pub mod components;
pub mod config;
pub mod crypto;
pub mod detect;
pub mod error;
pub mod manifest;
pub mod packages;
pub mod process;
pub mod report;
pub mod restore;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use archive::{Archiver, BackupOptions, ExcludeFilter};
pub use components::{Component, ComponentRegistry};
pub use config::Settings;
pub use crypto::{GpgAdapter, Passphrase};
pub use detect::Detection;
pub use error::{BackmeyError, Result};
pub use manifest::{read_manifest, Manifest};
pub use packages::{InstallPlan, PackageManager, Resolution, SmartResolver};
pub use report::{BackupSummary, RestoreSummary};
pub use restore::{ArchiveSource, ConflictPolicy, PlainArchive, RestoreOptions, Restorer};
pub use store::{BackupStore, TemplateRegistry};
pub use types::{Compression, PackageManagerKind};
