//! Standard-stream capture for log centralization.
//!
//! Anything the worker (or a subprocess it spawns) writes to fd 1/2 must
//! reach the parent as log records; the worker does not need to know it is
//! being captured. We replace fd 1/2 with capture pipes and route every line
//! read from them into the logging redirector: stdout lines as `info`,
//! stderr lines as `error`.
//!
//! CRITICAL: Must be called once, early in worker startup, before any code
//! that caches the standard streams.
//!
//! ## Safety contracts
//!
//! All `unsafe` blocks in this module rely on these guarantees:
//! 1. Called early in worker startup (tokio runtime threads exist but aren't
//!    accessing fds 1/2)
//! 2. Standard fds (1, 2) are guaranteed open by the OS at process startup
//! 3. Ownership transfer to threads via `from_raw_fd` + `forget` prevents
//!    double-close
//!
//! Cannot use Miri: this code makes actual syscalls (dup2/pipe) which Miri
//! can't execute.

#[cfg(unix)]
use std::io;
#[cfg(unix)]
use std::io::BufRead;
#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

#[cfg(unix)]
use nix::unistd::{dup2, pipe};
#[cfg(unix)]
use tokio::sync::mpsc;

#[cfg(unix)]
use crate::logging::LogRecord;

/// Replace fd 1/2 with capture pipes feeding the log channel.
#[cfg(unix)]
pub fn redirect_standard_streams(
    log_tx: mpsc::UnboundedSender<LogRecord>,
    name: Option<String>,
) -> io::Result<()> {
    let (stdout_read, stdout_write) =
        pipe().map_err(|e| io::Error::other(format!("pipe failed: {}", e)))?;
    let (stderr_read, stderr_write) =
        pipe().map_err(|e| io::Error::other(format!("pipe failed: {}", e)))?;

    // Safety: fd 1/2 are open; dup2 is atomic. The OwnedFd wrappers exist
    // only as dup2 targets and must not close the standard fds.
    let mut target_fd1 = unsafe { OwnedFd::from_raw_fd(1) };
    dup2(&stdout_write, &mut target_fd1)
        .map_err(|e| io::Error::other(format!("dup2(stdout) failed: {}", e)))?;
    std::mem::forget(target_fd1); // Don't close fd 1

    let mut target_fd2 = unsafe { OwnedFd::from_raw_fd(2) };
    dup2(&stderr_write, &mut target_fd2)
        .map_err(|e| io::Error::other(format!("dup2(stderr) failed: {}", e)))?;
    std::mem::forget(target_fd2); // Don't close fd 2

    // Write ends are duped to 1/2, close the originals
    drop(stdout_write);
    drop(stderr_write);

    spawn_capture_thread(stdout_read, "info", log_tx.clone(), name.clone());
    spawn_capture_thread(stderr_read, "error", log_tx, name);

    Ok(())
}

#[cfg(unix)]
fn spawn_capture_thread(
    read_fd: OwnedFd,
    level: &'static str,
    tx: mpsc::UnboundedSender<LogRecord>,
    name: Option<String>,
) {
    let raw = read_fd.as_raw_fd();
    std::thread::spawn(move || {
        // NOTE: No tracing in capture threads - an event here would be
        // shipped over the channel, which logs, which would be captured.
        // Safety: we own read_fd (forgotten below, ownership moves here)
        let file = unsafe { std::fs::File::from_raw_fd(raw) };
        let reader = std::io::BufReader::new(file);

        for line in reader.lines() {
            let Ok(line) = line else { break };
            if line.is_empty() {
                continue;
            }
            if tx.send(LogRecord::new(level, name.clone(), line)).is_err() {
                break;
            }
        }
    });
    std::mem::forget(read_fd); // Ownership transferred to thread
}

/// No capture on non-Unix - output written to the standard streams stays
/// local instead of reaching the parent.
#[cfg(not(unix))]
pub fn redirect_standard_streams(
    _log_tx: tokio::sync::mpsc::UnboundedSender<crate::logging::LogRecord>,
    _name: Option<String>,
) -> std::io::Result<()> {
    Ok(())
}
