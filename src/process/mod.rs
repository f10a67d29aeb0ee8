// Worker subprocess supervision.
//
// A worker is a child process running the hidden `worker` subcommand of this
// binary with its test config passed through LOADTEST_* environment
// variables. The supervisor captures a bounded stderr tail for failure
// reporting and escalates stop requests from SIGTERM to SIGKILL.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::error::LoadTestError;

/// Stderr bytes kept per worker. Failure messages only quote the first
/// 500 characters, so a small tail is enough.
const STDERR_TAIL_LIMIT: usize = 4096;

/// How a worker process is launched.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Re-exec the current binary with the hidden `worker` subcommand.
    CurrentExe,
    /// Run an arbitrary shell command. Test hook.
    Shell(String),
}

impl WorkerCommand {
    pub fn current_exe() -> Self {
        WorkerCommand::CurrentExe
    }

    pub fn shell(command: impl Into<String>) -> Self {
        WorkerCommand::Shell(command.into())
    }

    fn build(&self, env: &[(String, String)]) -> Result<Command, LoadTestError> {
        let mut command = match self {
            WorkerCommand::CurrentExe => {
                let exe = std::env::current_exe().map_err(|e| {
                    LoadTestError::WorkerFailed(format!("cannot resolve current executable: {}", e))
                })?;
                let mut command = Command::new(exe);
                command.arg("worker");
                command
            }
            WorkerCommand::Shell(script) => {
                let mut command = Command::new("/bin/sh");
                command.arg("-c").arg(script);
                command
            }
        };
        for (key, value) in env {
            command.env(key, value);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }
}

/// Result of waiting on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The process exited on its own. `code` is None when killed by signal.
    Exited { code: Option<i32> },
    /// The deadline passed with the process still running.
    DeadlineExceeded,
}

/// A spawned worker plus its stderr capture task.
pub struct SupervisedChild {
    child: Child,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
}

impl SupervisedChild {
    pub fn spawn(
        command: &WorkerCommand,
        env: &[(String, String)],
    ) -> Result<Self, LoadTestError> {
        let mut child = command
            .build(env)?
            .spawn()
            .map_err(|e| LoadTestError::WorkerFailed(format!("spawn failed: {}", e)))?;

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        if let Some(mut stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let mut tail = tail.lock().unwrap();
                            tail.extend_from_slice(&buf[..n]);
                            if tail.len() > STDERR_TAIL_LIMIT {
                                let excess = tail.len() - STDERR_TAIL_LIMIT;
                                tail.drain(..excess);
                            }
                        }
                    }
                }
            });
        }

        Ok(Self { child, stderr_tail })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Captured stderr so far, lossily decoded.
    pub fn stderr_tail(&self) -> String {
        String::from_utf8_lossy(&self.stderr_tail.lock().unwrap()).into_owned()
    }

    /// Wait for exit, up to the deadline.
    pub async fn wait_with_deadline(&mut self, deadline: Duration) -> WaitOutcome {
        match tokio::time::timeout(deadline, self.child.wait()).await {
            Ok(Ok(status)) => WaitOutcome::Exited {
                code: status.code(),
            },
            // wait() itself failing means the child is gone; treat as
            // signal-killed.
            Ok(Err(_)) => WaitOutcome::Exited { code: None },
            Err(_) => WaitOutcome::DeadlineExceeded,
        }
    }

    /// Graceful stop: SIGTERM, wait up to `grace`, then SIGKILL.
    /// Returns true when the process exited within the grace period.
    pub async fn terminate(&mut self, grace: Duration) -> bool {
        if let Some(pid) = self.child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => true,
            Err(_) => {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let command = WorkerCommand::shell("exit 7");
        let mut child = SupervisedChild::spawn(&command, &[]).unwrap();
        let outcome = child.wait_with_deadline(Duration::from_secs(5)).await;
        assert_eq!(outcome, WaitOutcome::Exited { code: Some(7) });
    }

    #[tokio::test]
    async fn test_env_is_passed_through() {
        let command = WorkerCommand::shell("test \"$LOADTEST_PROBE\" = hello");
        let env = vec![("LOADTEST_PROBE".to_string(), "hello".to_string())];
        let mut child = SupervisedChild::spawn(&command, &env).unwrap();
        let outcome = child.wait_with_deadline(Duration::from_secs(5)).await;
        assert_eq!(outcome, WaitOutcome::Exited { code: Some(0) });
    }

    #[tokio::test]
    async fn test_stderr_tail_is_captured() {
        let command = WorkerCommand::shell("echo boom >&2; exit 1");
        let mut child = SupervisedChild::spawn(&command, &[]).unwrap();
        let outcome = child.wait_with_deadline(Duration::from_secs(5)).await;
        assert_eq!(outcome, WaitOutcome::Exited { code: Some(1) });
        // The capture task races the exit; give it a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(child.stderr_tail().contains("boom"));
    }

    #[tokio::test]
    async fn test_deadline_exceeded_leaves_child_running() {
        let command = WorkerCommand::shell("sleep 30");
        let mut child = SupervisedChild::spawn(&command, &[]).unwrap();
        let outcome = child.wait_with_deadline(Duration::from_millis(100)).await;
        assert_eq!(outcome, WaitOutcome::DeadlineExceeded);
        assert!(child.terminate(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_terminate_is_graceful_for_cooperative_children() {
        let command = WorkerCommand::shell("sleep 30");
        let mut child = SupervisedChild::spawn(&command, &[]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(child.terminate(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        // Trap and ignore SIGTERM so only SIGKILL can stop it.
        let command = WorkerCommand::shell("trap '' TERM; while true; do sleep 1; done");
        let mut child = SupervisedChild::spawn(&command, &[]).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!child.terminate(Duration::from_millis(300)).await);
    }

    #[tokio::test]
    async fn test_stderr_tail_is_bounded() {
        let command =
            WorkerCommand::shell("yes 0123456789abcdef | head -c 20000 >&2; exit 0");
        let mut child = SupervisedChild::spawn(&command, &[]).unwrap();
        child.wait_with_deadline(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(child.stderr_tail().len() <= STDERR_TAIL_LIMIT);
    }
}
