//! Fire-and-forget children for companion services (e.g. distributed
//! workers) that have to outlive a single request/response check.

use std::{
    ffi::OsStr,
    fmt,
    os::fd::{AsFd, AsRawFd},
    path::Path,
};

use anyhow::{Context, Result};
use libc::{c_int, pid_t};
use tracing::debug;

use crate::{
    ExitStatus,
    sys::{self, ExecArgs, Fork},
};

/// Process id of a background child.
///
/// A bare capability: dropping it does nothing. Whoever holds it is
/// responsible for stopping and reaping the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pid_t);

impl ProcessId {
    pub fn raw(self) -> pid_t {
        self.0
    }

    /// Delivers `signal` to the process.
    pub fn signal(self, signal: c_int) -> Result<()> {
        sys::kill(self.0, signal)
            .with_context(|| format!("could not send signal {signal} to process {}", self.0))
    }

    /// Sends SIGTERM.
    pub fn terminate(self) -> Result<()> {
        self.signal(libc::SIGTERM)
    }

    /// Blocks until the process terminates and reaps it.
    pub fn wait(self) -> Result<ExitStatus> {
        sys::wait_for(self.0).with_context(|| format!("could not wait for process {}", self.0))
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Starts `program` with `argv` and returns without waiting.
///
/// The child's stdout and stderr are redirected onto `out` and `err`, which
/// stay owned by the caller. No record of the child is kept.
pub fn spawn_background<S: AsRef<OsStr>>(
    out: impl AsFd,
    err: impl AsFd,
    program: impl AsRef<Path>,
    argv: &[S],
) -> Result<ProcessId> {
    let program = program.as_ref();
    let exec = ExecArgs::new(program, argv)?;
    let out = out.as_fd().as_raw_fd();
    let err = err.as_fd().as_raw_fd();

    match sys::fork()? {
        Fork::Child => unsafe { sys::redirect_and_exec(&exec, out, err, &[]) },
        Fork::Parent(pid) => {
            debug!(pid, program = %program.display(), "started background process");
            Ok(ProcessId(pid))
        }
    }
}
