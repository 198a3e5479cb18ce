//! Control of the application that owns the database (Zotero desktop).

use std::fs;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ClerkError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Start, stop and check on the owning application.
pub trait OwnerProcess {
    fn is_running(&self) -> Result<bool>;
    fn request_stop(&self) -> Result<()>;
    fn force_stop(&self) -> Result<()>;
    /// Launch the application. Must be a no-op if it is already running.
    fn start(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Graceful,
    Forced,
}

/// Ask the owner to quit, escalate to a forced stop after `timeout`.
pub fn stop_owner<O: OwnerProcess + ?Sized>(owner: &O, timeout: Duration) -> Result<StopOutcome> {
    if !owner.is_running()? {
        return Ok(StopOutcome::AlreadyStopped);
    }

    info!("Asking the owning application to quit");
    owner.request_stop()?;
    if wait_for_exit(owner, timeout)? {
        return Ok(StopOutcome::Graceful);
    }

    warn!("Still running after {:?}, forcing it to stop", timeout);
    owner.force_stop()?;
    if wait_for_exit(owner, timeout)? {
        return Ok(StopOutcome::Forced);
    }

    Err(ClerkError::Process(
        "owning application did not exit after a forced stop".to_string(),
    ))
}

fn wait_for_exit<O: OwnerProcess + ?Sized>(owner: &O, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if !owner.is_running()? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// The Zotero desktop app, found by exact process name.
#[derive(Debug)]
pub struct ZoteroProcess {
    binary: String,
    process_name: String,
    /// The instance we launched, kept so it can be reaped once it exits
    child: Mutex<Option<Child>>,
}

impl ZoteroProcess {
    pub fn new(binary: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            process_name: process_name.into(),
            child: Mutex::new(None),
        }
    }

    /// Collect the exit status of our own instance if it has quit.
    fn reap(&self) {
        let mut slot = self.child.lock().unwrap_or_else(|e| e.into_inner());
        let Some(child) = slot.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} (pid {}) exited: {}", self.process_name, child.id(), status);
                *slot = None;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Lost track of {} (pid {}): {}", self.process_name, child.id(), e);
                *slot = None;
            }
        }
    }

    fn pids(&self) -> Result<Vec<i32>> {
        self.reap();
        let output = Command::new("pgrep")
            .args(["-x", &self.process_name])
            .output()
            .map_err(|e| ClerkError::Process(format!("failed to run pgrep: {}", e)))?;

        // pgrep exits 1 when nothing matched
        match output.status.code() {
            Some(0) => Ok(String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(|l| l.trim().parse().ok())
                .filter(|&pid| !is_zombie(pid))
                .collect()),
            Some(1) => Ok(Vec::new()),
            _ => Err(ClerkError::Process(format!(
                "pgrep failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    fn signal_all(&self, signal: libc::c_int) -> Result<()> {
        for pid in self.pids()? {
            debug!("Sending signal {} to {}", signal, pid);
            let rc = unsafe { libc::kill(pid, signal) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(ClerkError::Process(format!("kill({}) failed: {}", pid, err)));
                }
            }
        }
        Ok(())
    }
}

/// A zombie has exited and only waits for its parent; it is not running.
fn is_zombie(pid: i32) -> bool {
    // state is the first field after the parenthesized command name
    fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

impl OwnerProcess for ZoteroProcess {
    fn is_running(&self) -> Result<bool> {
        Ok(!self.pids()?.is_empty())
    }

    fn request_stop(&self) -> Result<()> {
        self.signal_all(libc::SIGTERM)
    }

    fn force_stop(&self) -> Result<()> {
        self.signal_all(libc::SIGKILL)
    }

    fn start(&self) -> Result<()> {
        if self.is_running()? {
            debug!("{} already running", self.process_name);
            return Ok(());
        }

        let binary = which::which(&self.binary)
            .map_err(|_| ClerkError::Process(format!("'{}' not found in PATH", self.binary)))?;

        let mut cmd = Command::new(&binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // own process group, so our Ctrl+C does not reach it
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ClerkError::Process(format!("failed to start {}: {}", binary.display(), e)))?;
        info!("Started {} (pid {})", binary.display(), child.id());
        *self.child.lock().unwrap_or_else(|e| e.into_inner()) = Some(child);
        Ok(())
    }
}
