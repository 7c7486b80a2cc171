//! Child process helpers shared by the recorder and cleanup workers.

use crate::config::CommandSpec;
use crate::error::{AgrecError, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Where a child's stdout/stderr go.
#[derive(Debug, Clone)]
pub enum ChildLog {
    /// Share the supervisor's stdio.
    Inherit,
    /// Truncate the file, write `header` on its own line, then attach.
    Truncate { path: PathBuf, header: String },
    /// Append `header` to the file, then attach.
    Append { path: PathBuf, header: String },
}

/// Spawn `spec` followed by `extra_args`, wiring its output per `log`.
pub fn spawn(spec: &CommandSpec, extra_args: &[String], log: &ChildLog) -> Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).args(extra_args).stdin(Stdio::null());

    match log {
        ChildLog::Inherit => {}
        ChildLog::Truncate { path, header } | ChildLog::Append { path, header } => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let append = matches!(log, ChildLog::Append { .. });
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(path)?;
            writeln!(file, "{header}")?;
            file.flush()?;
            cmd.stdout(file.try_clone()?).stderr(file);
        }
    }

    cmd.spawn().map_err(|source| AgrecError::Spawn {
        program: spec.program.clone(),
        source,
    })
}

/// Human-readable exit description for log lines.
pub fn describe_exit(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit {code}"),
        (None, Some(sig)) => format!("killed by signal {sig}"),
        (None, None) => "unknown exit".to_string(),
    }
}

// ---------------------------------------------------------------------------
// PID helpers (Unix only)
// ---------------------------------------------------------------------------

/// Send SIGTERM to `pid`. A process that is already gone is not an error.
pub fn terminate(pid: u32) -> Result<()> {
    send_signal(pid, libc::SIGTERM)
}

/// Send SIGKILL to `pid`. A process that is already gone is not an error.
pub fn force_kill(pid: u32) -> Result<()> {
    send_signal(pid, libc::SIGKILL)
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| AgrecError::Io(std::io::Error::other(format!("pid {pid} out of range"))))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(raw, signal) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(AgrecError::Io(err))
}

// ---------------------------------------------------------------------------
// Host identity
// ---------------------------------------------------------------------------

/// The kernel hostname, falling back to `$HOSTNAME` and then `localhost`.
pub fn system_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes; gethostname
    // NUL-terminates on success when the name fits.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
        if !name.is_empty() {
            return name;
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
