//! Process lifecycle management for external tools
//!
//! Every external program backmey drives (gpg, package managers, dconf, the
//! post-backup sync command) is spawned through [`run_captured`] or
//! [`run_inherited`]. Both:
//!
//! - spawn the child in its own process group
//! - set `PR_SET_PDEATHSIG` so the child dies with us
//! - record the PID in the global [`Cleanup`] set
//!
//! Scratch files and directories holding plaintext or staged data are
//! recorded there too, through a [`ScratchGuard`]. On SIGINT/SIGTERM/SIGHUP
//! the signal thread terminates the recorded process groups (SIGTERM, then
//! SIGKILL after a grace period), deletes the scratch paths and exits.
//!
//! # Security
//!
//! Secrets are only ever written to a child's stdin. Arguments are logged at
//! debug level, stdin contents never are.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::error::{BackmeyError, Result};

static CLEANUP: OnceLock<Mutex<Cleanup>> = OnceLock::new();

/// Running children and scratch paths to reap when we are told to stop
#[derive(Debug, Default)]
pub struct Cleanup {
    pids: HashSet<u32>,
    paths: HashSet<PathBuf>,
}

impl Cleanup {
    fn global() -> &'static Mutex<Cleanup> {
        CLEANUP.get_or_init(|| Mutex::new(Cleanup::default()))
    }

    fn with_global(f: impl FnOnce(&mut Cleanup)) {
        if let Ok(mut cleanup) = Self::global().lock() {
            f(&mut cleanup);
        }
    }

    /// Stop every recorded child, then delete every scratch path.
    ///
    /// Children get SIGTERM on their process group and SIGKILL if still
    /// alive after `grace`. Running twice is a no-op.
    pub fn run(&mut self, grace: Duration) {
        let pids: Vec<u32> = self.pids.drain().collect();
        if !pids.is_empty() {
            tracing::info!("Terminating {} child process(es)", pids.len());
            for &pid in &pids {
                if send_signal_to_group(pid, Signal::SIGTERM).is_err() {
                    let _ = send_signal(pid, Signal::SIGTERM);
                }
            }
            let start = Instant::now();
            while start.elapsed() < grace && pids.iter().any(|&pid| is_process_alive(pid)) {
                std::thread::sleep(Duration::from_millis(100));
            }
            for &pid in pids.iter().filter(|&&pid| is_process_alive(pid)) {
                tracing::warn!("Process group {} did not terminate, sending SIGKILL", pid);
                if send_signal_to_group(pid, Signal::SIGKILL).is_err() {
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }

        for path in self.paths.drain() {
            let removed = match path.symlink_metadata() {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
                Ok(_) => fs::remove_file(&path),
                Err(_) => continue,
            };
            match removed {
                Ok(()) => tracing::debug!("Removed scratch path {}", path.display()),
                Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}

/// Keeps a scratch path on the signal-time removal list while alive
#[derive(Debug)]
pub struct ScratchGuard {
    path: PathBuf,
}

impl ScratchGuard {
    pub fn new(path: &Path) -> Self {
        let path = path.to_path_buf();
        Cleanup::with_global(|c| {
            c.paths.insert(path.clone());
        });
        Self { path }
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        Cleanup::with_global(|c| {
            c.paths.remove(&self.path);
        });
    }
}

fn send_signal(pid: u32, signal: Signal) -> std::result::Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID addresses the whole process group
fn send_signal_to_group(pgid: u32, signal: Signal) -> std::result::Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Alive means it exists and is not a zombie
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    if let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // state follows the parenthesised comm, which may itself contain spaces
        if let Some(state) = stat.rsplit(')').next().and_then(|s| s.split_whitespace().next()) {
            return !matches!(state, "Z" | "X");
        }
    }
    true
}

/// Install SIGINT/SIGTERM/SIGHUP handlers that reap children and scratch
/// paths. Call once at program start.
pub fn init_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!("Received signal {}, cleaning up...", sig);
            Cleanup::with_global(|c| c.run(Duration::from_secs(3)));
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group that dies with us
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

/// Captured result of an external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Turn a non-zero exit into a system error carrying stderr.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(BackmeyError::system(format!(
                "{} failed (exit code {}): {}",
                context,
                self.exit_code.unwrap_or(-1),
                self.stderr.trim()
            )))
        }
    }
}

/// Whether `program` resolves on `PATH`
pub fn tool_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

fn with_registered<T>(pid: u32, wait: impl FnOnce() -> std::io::Result<T>) -> std::io::Result<T> {
    Cleanup::with_global(|c| {
        c.pids.insert(pid);
    });
    let result = wait();
    Cleanup::with_global(|c| {
        c.pids.remove(&pid);
    });
    result
}

/// Run `cmd` to completion with stdout/stderr captured.
///
/// `stdin` is written to the child and the pipe closed; it never reaches
/// the log. A non-zero exit is reported in the output, not as an error.
pub fn run_captured(cmd: &mut Command, stdin: Option<&[u8]>) -> Result<CommandOutput> {
    let description = describe(cmd);
    tracing::debug!("exec: {}", description);

    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    let mut child = cmd
        .spawn()
        .map_err(|e| BackmeyError::system(format!("Failed to spawn {}: {}", description, e)))?;
    let pid = child.id();

    let output = with_registered(pid, move || {
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // a child that exits early closes the pipe; its exit status tells the story
            if let Err(e) = pipe.write_all(data) {
                tracing::debug!("stdin write to {} ended early: {}", pid, e);
            }
        }
        child.wait_with_output()
    })
    .map_err(|e| BackmeyError::system(format!("Failed waiting for {}: {}", description, e)))?;

    let exit_code = output.status.code();
    if !output.status.success() {
        tracing::debug!("{} exited with {:?}", description, exit_code);
    }
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code,
        success: output.status.success(),
    })
}

/// Run `cmd` attached to our terminal (installers that may prompt for sudo).
pub fn run_inherited(cmd: &mut Command) -> Result<ExitStatus> {
    let description = describe(cmd);
    tracing::info!("exec: {}", description);

    // stays in our process group so it can read the terminal
    let mut child = cmd
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| BackmeyError::system(format!("Failed to spawn {}: {}", description, e)))?;
    let pid = child.id();

    with_registered(pid, move || child.wait())
        .map_err(|e| BackmeyError::system(format!("Failed waiting for {}: {}", description, e)))
}
