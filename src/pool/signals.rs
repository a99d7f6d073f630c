//! Exit analysis for worker processes.
//!
//! Turns a worker's exit status into a reason that can be logged and
//! reported back to the client when a worker dies.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Asked to stop (SIGTERM / SIGINT).
    Stopped(Signal),
    /// SIGKILL, usually from the pool's own escalation or the OOM killer.
    Killed,
    /// Crashed (SIGSEGV, SIGBUS, SIGABRT, ...).
    Crashed(Signal),
    /// Any other signal.
    Signaled(Signal),
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Stopped(sig) => format!("stopped by {:?}", sig),
            Self::Killed => "killed (SIGKILL)".to_string(),
            Self::Crashed(sig) => format!("crashed with {:?}", sig),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze an `ExitStatus` to determine the termination reason.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    let Some(raw) = status.signal() else {
        return TerminationReason::Unknown;
    };

    match Signal::try_from(raw) {
        Ok(sig @ (Signal::SIGTERM | Signal::SIGINT)) => TerminationReason::Stopped(sig),
        Ok(Signal::SIGKILL) => TerminationReason::Killed,
        Ok(sig @ (Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGABRT | Signal::SIGILL)) => {
            TerminationReason::Crashed(sig)
        }
        Ok(sig) => TerminationReason::Signaled(sig),
        Err(_) => TerminationReason::Unknown,
    }
}
