//! Process handle for worker subprocesses.
//!
//! Workers are started in their own process group so that stopping a worker
//! also stops whatever the worker itself launched (e.g. a language server).

use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

use super::signals::{TerminationReason, analyze_exit_status};
use crate::error::{CoqpoolError, Result};

/// How often `stop` polls for exit after sending SIGTERM.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A running worker process, as seen by the pool.
///
/// The pool only ever needs to poll liveness and stop the process; everything
/// else goes through the worker's network endpoint.
pub trait WorkerProcess: Send {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness poll.
    fn is_running(&mut self) -> bool;

    /// Why the process exited, once it has.
    fn exit_reason(&mut self) -> Option<TerminationReason>;

    /// Ask the process to stop, escalating to SIGKILL after `grace`.
    fn stop(&mut self, grace: Duration) -> Result<()>;
}

/// Handle to a spawned worker subprocess.
pub struct Proc {
    child: Child,
    /// Exit status once the process has been reaped.
    status: Option<ExitStatus>,
}

impl Proc {
    /// Wrap a child that was spawned as the leader of its own process group.
    pub fn from_child(child: Child) -> Self {
        Self {
            child,
            status: None,
        }
    }

    fn group(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    fn signal_group(&self, signal: Signal) -> Result<()> {
        match killpg(self.group(), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(CoqpoolError::Worker(format!(
                "Failed to send {:?} to worker {}: {}",
                signal,
                self.child.id(),
                e
            ))),
        }
    }

    /// Try to reap the process (non-blocking).
    fn try_wait(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.status = Some(status),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(pid = self.child.id(), error = %e, "try_wait failed");
                }
            }
        }
        self.status
    }

    /// Send SIGKILL to the process group and wait for the leader to exit.
    fn kill(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        self.signal_group(Signal::SIGKILL)?;
        let status = self.child.wait()?;
        self.status = Some(status);
        Ok(())
    }
}

impl WorkerProcess for Proc {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_running(&mut self) -> bool {
        self.try_wait().is_none()
    }

    fn exit_reason(&mut self) -> Option<TerminationReason> {
        self.try_wait().map(analyze_exit_status)
    }

    fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.try_wait().is_some() {
            return Ok(());
        }

        self.signal_group(Signal::SIGTERM)?;

        let start = Instant::now();
        while start.elapsed() < grace {
            if self.try_wait().is_some() {
                return Ok(());
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }

        tracing::warn!(
            pid = self.child.id(),
            grace_ms = grace.as_millis() as u64,
            "Worker ignored SIGTERM, killing"
        );
        self.kill()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.try_wait().is_none() {
            let _ = self.signal_group(Signal::SIGTERM);
            std::thread::sleep(STOP_POLL_INTERVAL);
            if self.try_wait().is_none() {
                let _ = self.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    fn spawn_grouped(program: &str, args: &[&str]) -> Proc {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()
            .expect("Failed to spawn test process");
        Proc::from_child(child)
    }

    #[test]
    fn test_proc_stop() {
        let mut proc = spawn_grouped("sleep", &["60"]);
        assert!(proc.is_running());
        assert!(proc.pid().is_some());

        proc.stop(Duration::from_secs(1)).expect("Failed to stop");
        assert!(!proc.is_running());
        assert!(matches!(
            proc.exit_reason(),
            Some(TerminationReason::Stopped(Signal::SIGTERM))
        ));
    }

    #[test]
    fn test_proc_stop_escalates_to_kill() {
        // The shell ignores SIGTERM, so stop has to escalate.
        let mut proc = spawn_grouped("sh", &["-c", "trap '' TERM; sleep 60"]);
        std::thread::sleep(Duration::from_millis(50));
        assert!(proc.is_running());

        proc.stop(Duration::from_millis(100)).expect("Failed to stop");
        assert!(!proc.is_running());
        assert_eq!(proc.exit_reason(), Some(TerminationReason::Killed));
    }

    #[test]
    fn test_proc_exit_detected() {
        let mut proc = spawn_grouped("sh", &["-c", "exit 3"]);
        let start = Instant::now();
        while proc.is_running() && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!proc.is_running());
        assert_eq!(proc.exit_reason(), Some(TerminationReason::Exited(3)));

        // Stopping an exited process is a no-op.
        proc.stop(Duration::from_millis(10)).expect("stop after exit");
    }
}
