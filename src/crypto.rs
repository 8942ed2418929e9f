//! Symmetric encryption through an external `gpg`.
//!
//! # Security Model
//!
//! **CRITICAL**: the passphrase never appears on a command line (visible in
//! `ps aux`) or in a log line. It is read from `BACKMEY_PASSPHRASE`, held in
//! a [`Passphrase`] that zeroes its memory on drop and redacts itself in
//! `Debug`, and handed to gpg on stdin via `--passphrase-fd 0` with loopback
//! pinentry.
//!
//! Any failure (tool missing, passphrase missing, gpg exiting non-zero) is an
//! [`BackmeyError::Encryption`] and the partial output file is removed.
//! Decrypted plaintext only lives inside a [`DecryptedArchive`], whose
//! temporary directory is deleted when it goes out of scope.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{BackmeyError, Result};
use crate::process::{run_captured, ScratchGuard};

/// Environment variable carrying the passphrase
pub const PASSPHRASE_ENV: &str = "BACKMEY_PASSPHRASE";

/// Secret passphrase, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Read the passphrase from `BACKMEY_PASSPHRASE`.
    pub fn from_env() -> Result<Self> {
        match std::env::var(PASSPHRASE_ENV) {
            Ok(value) if !value.is_empty() => Ok(Self(value)),
            _ => Err(BackmeyError::encryption(format!(
                "{} is not set; export it to encrypt or decrypt archives",
                PASSPHRASE_ENV
            ))),
        }
    }

    /// Bytes fed to gpg's passphrase fd
    fn as_stdin(&self) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(self.0.len() + 1));
        bytes.extend_from_slice(self.0.as_bytes());
        bytes.push(b'\n');
        bytes
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Wrapper around the `gpg` executable
#[derive(Debug, Clone)]
pub struct GpgAdapter {
    program: PathBuf,
    homedir: Option<PathBuf>,
}

impl GpgAdapter {
    /// Find `gpg` (or `gpg2`) on `PATH`.
    pub fn locate() -> Result<Self> {
        which::which("gpg")
            .or_else(|_| which::which("gpg2"))
            .map(|program| Self { program, homedir: None })
            .map_err(|_| {
                BackmeyError::encryption("gpg is not installed; it is required for --encrypt")
            })
    }

    /// Use an isolated keyring directory instead of `~/.gnupg`
    pub fn with_homedir(mut self, homedir: impl Into<PathBuf>) -> Self {
        self.homedir = Some(homedir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(home) = &self.homedir {
            cmd.arg("--homedir").arg(home);
        }
        cmd.args([
            "--batch",
            "--yes",
            "--quiet",
            "--no-symkey-cache",
            "--pinentry-mode",
            "loopback",
            "--passphrase-fd",
            "0",
        ]);
        cmd
    }

    /// Encrypt `input` into `output` with AES-256.
    pub fn encrypt(&self, input: &Path, output: &Path, passphrase: &Passphrase) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["--symmetric", "--cipher-algo", "AES256", "--output"])
            .arg(output)
            .arg(input);
        self.run(cmd, output, passphrase, "encrypt")
    }

    /// Decrypt `input` into `output`.
    pub fn decrypt(&self, input: &Path, output: &Path, passphrase: &Passphrase) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("--output").arg(output).arg("--decrypt").arg(input);
        self.run(cmd, output, passphrase, "decrypt")
    }

    /// Decrypt `input` into a private temporary directory.
    pub fn decrypt_to_temp(&self, input: &Path, passphrase: &Passphrase) -> Result<DecryptedArchive> {
        if !input.is_file() {
            return Err(BackmeyError::not_found(format!(
                "Archive not found: {}",
                input.display()
            )));
        }
        let dir = tempfile::Builder::new().prefix("backmey-decrypt-").tempdir()?;
        let guard = ScratchGuard::new(dir.path());
        let name = input
            .file_stem()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("archive.tar"));
        let path = dir.path().join(name);
        self.decrypt(input, &path, passphrase)?;
        tracing::debug!("Decrypted {} into temporary storage", input.display());
        Ok(DecryptedArchive {
            _dir: dir,
            _guard: guard,
            path,
        })
    }

    fn run(&self, mut cmd: Command, output: &Path, passphrase: &Passphrase, action: &str) -> Result<()> {
        let stdin = passphrase.as_stdin();
        let result = run_captured(&mut cmd, Some(stdin.as_slice()));
        let failure = match result {
            Ok(out) if out.success && output.is_file() => return Ok(()),
            Ok(out) => describe_failure(action, out.stderr.trim()),
            Err(e) => BackmeyError::encryption(format!("gpg {} could not run: {}", action, e)),
        };
        if output.exists() {
            if let Err(e) = std::fs::remove_file(output) {
                tracing::warn!("Failed to remove partial output {}: {}", output.display(), e);
            }
        }
        Err(failure)
    }
}

fn describe_failure(action: &str, stderr: &str) -> BackmeyError {
    let lowered = stderr.to_lowercase();
    let hint = if lowered.contains("bad session key") || lowered.contains("decryption failed") {
        " (wrong passphrase?)"
    } else {
        ""
    };
    BackmeyError::encryption(format!("gpg {} failed{}: {}", action, hint, stderr))
}

/// Plaintext archive that disappears with this value
#[derive(Debug)]
pub struct DecryptedArchive {
    _dir: TempDir,
    _guard: ScratchGuard,
    path: PathBuf,
}

impl DecryptedArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn adapter(home: &Path) -> Option<GpgAdapter> {
        GpgAdapter::locate().ok().map(|g| g.with_homedir(home))
    }

    fn private_dir() -> TempDir {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).unwrap();
        dir
    }

    #[test]
    fn test_debug_is_redacted() {
        let p = Passphrase::new("hunter2");
        let shown = format!("{:?}", p);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("redacted"));
    }

    #[test]
    fn test_passphrase_never_in_args() {
        let g = GpgAdapter { program: PathBuf::from("gpg"), homedir: None };
        let mut cmd = g.command();
        cmd.args(["--symmetric", "in"]);
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"--passphrase-fd".to_string()));
        assert!(!args.iter().any(|a| a.contains("hunter2")));
        assert!(cmd.get_envs().all(|(k, _)| k != PASSPHRASE_ENV));
    }

    #[test]
    fn test_stdin_has_newline() {
        let p = Passphrase::new("abc");
        assert_eq!(p.as_stdin().as_slice(), b"abc\n");
    }

    #[test]
    fn test_round_trip_and_wrong_passphrase() {
        let home = private_dir();
        let Some(gpg) = adapter(home.path()) else {
            eprintln!("gpg not installed, skipping");
            return;
        };
        let work = TempDir::new().unwrap();
        let plain = work.path().join("a.tar.gz");
        let sealed = work.path().join("a.tar.gz.gpg");
        fs::write(&plain, b"payload bytes").unwrap();

        gpg.encrypt(&plain, &sealed, &Passphrase::new("correct horse")).unwrap();
        assert!(sealed.is_file());
        assert_ne!(fs::read(&sealed).unwrap(), b"payload bytes");

        let opened = gpg.decrypt_to_temp(&sealed, &Passphrase::new("correct horse")).unwrap();
        assert_eq!(fs::read(opened.path()).unwrap(), b"payload bytes");
        let temp_path = opened.path().to_path_buf();
        drop(opened);
        assert!(!temp_path.exists());

        let err = gpg.decrypt_to_temp(&sealed, &Passphrase::new("wrong")).unwrap_err();
        assert!(matches!(err, BackmeyError::Encryption(_)));
    }

    #[test]
    fn test_decrypt_missing_input_is_not_found() {
        let home = private_dir();
        let Some(gpg) = adapter(home.path()) else {
            return;
        };
        let err = gpg
            .decrypt_to_temp(Path::new("/nonexistent/a.gpg"), &Passphrase::new("x"))
            .unwrap_err();
        assert!(matches!(err, BackmeyError::NotFound(_)));
    }
}
