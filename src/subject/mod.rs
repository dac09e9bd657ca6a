// Subject Process Management
//
// Starts the external intrusion-prevention program, checks that it survived
// startup, and stops it with SIGINT followed by a bounded grace period.
//
// Lifecycle (one-directional, never reused):
//   STARTING -> RUNNING -> STOPPED
//   STARTING -> FAILED
//   RUNNING  -> FAILED   (stop did not end in a clean exit)
//
// A handle that is dropped while the child is still alive kills it, so the
// subject never outlives the harness.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::SubjectConfig;
use crate::error::SubjectError;

/// Subject lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubjectState {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl SubjectState {
    fn can_become(self, next: SubjectState) -> bool {
        matches!(
            (self, next),
            (SubjectState::Starting, SubjectState::Running)
                | (SubjectState::Starting, SubjectState::Failed)
                | (SubjectState::Running, SubjectState::Stopped)
                | (SubjectState::Running, SubjectState::Failed)
        )
    }
}

/// Handle to a launched subject process
#[derive(Debug)]
pub struct SubjectHandle {
    pid: u32,
    state: SubjectState,
    child: Option<Child>,
    working_dir: PathBuf,
    exit_code: Option<i32>,
    // Held so the scratch directory lives as long as the process
    _scratch: Option<TempDir>,
}

impl SubjectHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> SubjectState {
        self.state
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Exit code observed when the process ended, if it ended normally
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_running(&self) -> bool {
        self.state == SubjectState::Running
    }

    fn transition(&mut self, next: SubjectState) {
        if self.state.can_become(next) {
            debug!("Subject (PID {}) {:?} -> {:?}", self.pid, self.state, next);
            self.state = next;
        } else {
            warn!(
                "Ignoring subject state change {:?} -> {:?}",
                self.state, next
            );
        }
    }

    /// Send SIGKILL without waiting
    fn force_kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("Forced kill of PID {} failed: {}", self.pid, e);
            }
        }
    }
}

impl Drop for SubjectHandle {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                warn!("Subject (PID {}) still running at drop, killing it", self.pid);
                let _ = child.start_kill();
            }
        }
    }
}

/// Starts and stops the subject process
#[derive(Debug, Clone)]
pub struct SubjectProcessController {
    args: Vec<String>,
    startup_probe: Duration,
    grace_period: Duration,
}

impl SubjectProcessController {
    pub fn new(config: &SubjectConfig) -> Self {
        Self {
            args: config.args.clone(),
            startup_probe: Duration::from_millis(config.startup_probe_ms),
            grace_period: Duration::from_millis(config.grace_period_ms),
        }
    }

    /// Launch `executable` with its working directory set to `working_dir`,
    /// or to a fresh temporary directory when none is given
    ///
    /// The returned handle is RUNNING if the process survived the startup
    /// probe and FAILED if it had already exited.
    ///
    /// # Errors
    ///
    /// [`SubjectError::Spawn`] if the executable does not exist or cannot be
    /// launched.
    pub async fn start(
        &self,
        executable: &Path,
        working_dir: Option<&Path>,
    ) -> Result<SubjectHandle, SubjectError> {
        if !executable.exists() {
            return Err(SubjectError::Spawn {
                path: executable.to_path_buf(),
                reason: "executable not found".to_string(),
            });
        }

        let (dir, scratch) = prepare_working_dir(working_dir)?;
        info!("Starting subject {:?} in {:?}", executable, dir);

        let mut child = Command::new(executable)
            .args(&self.args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SubjectError::Spawn {
                path: executable.to_path_buf(),
                reason: e.to_string(),
            })?;

        let pid = child.id().ok_or_else(|| SubjectError::Spawn {
            path: executable.to_path_buf(),
            reason: "process exited before a PID was observed".to_string(),
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(pid, stdout));
        }

        let mut handle = SubjectHandle {
            pid,
            state: SubjectState::Starting,
            child: Some(child),
            working_dir: dir,
            exit_code: None,
            _scratch: scratch,
        };

        tokio::time::sleep(self.startup_probe).await;

        let probe = match handle.child.as_mut() {
            Some(child) => child.try_wait(),
            None => Ok(None),
        };
        match probe {
            Ok(None) => {
                info!("Subject running (PID {})", pid);
                handle.transition(SubjectState::Running);
            }
            Ok(Some(status)) => {
                warn!("Subject (PID {}) exited during startup: {}", pid, status);
                handle.exit_code = status.code();
                handle.transition(SubjectState::Failed);
            }
            Err(e) => {
                warn!("Could not poll subject (PID {}): {}", pid, e);
                handle.transition(SubjectState::Failed);
                handle.force_kill();
            }
        }

        Ok(handle)
    }

    /// Interrupt the subject and check for a clean exit within the grace
    /// period
    ///
    /// Returns true only if the process exited with status 0 in time. On any
    /// other result the handle becomes FAILED and a forced kill is issued;
    /// no further waiting happens.
    pub async fn stop(&self, handle: &mut SubjectHandle) -> bool {
        if !handle.is_running() {
            warn!(
                "Subject (PID {}) is {:?}, not stopping",
                handle.pid, handle.state
            );
            return false;
        }

        info!("Stopping subject (PID {})", handle.pid);
        if let Err(e) = self.interrupt(handle.pid) {
            warn!("{}", e);
            handle.transition(SubjectState::Failed);
            handle.force_kill();
            return false;
        }

        let waited = match handle.child.as_mut() {
            Some(child) => tokio::time::timeout(self.grace_period, child.wait()).await,
            None => return false,
        };

        match waited {
            Ok(Ok(status)) => {
                handle.exit_code = status.code();
                if status.success() {
                    info!("Subject (PID {}) exited cleanly", handle.pid);
                    handle.transition(SubjectState::Stopped);
                    true
                } else {
                    warn!("Subject (PID {}) exited with {}", handle.pid, status);
                    handle.transition(SubjectState::Failed);
                    false
                }
            }
            Ok(Err(e)) => {
                warn!("Waiting on subject (PID {}) failed: {}", handle.pid, e);
                handle.transition(SubjectState::Failed);
                handle.force_kill();
                false
            }
            Err(_) => {
                warn!(
                    "Subject (PID {}) still running after {:?}, killing it",
                    handle.pid, self.grace_period
                );
                handle.transition(SubjectState::Failed);
                handle.force_kill();
                false
            }
        }
    }

    fn interrupt(&self, pid: u32) -> Result<(), SubjectError> {
        let raw = i32::try_from(pid).map_err(|_| SubjectError::Signal {
            pid,
            reason: "PID out of range".to_string(),
        })?;
        kill(Pid::from_raw(raw), Signal::SIGINT).map_err(|e| SubjectError::Signal {
            pid,
            reason: e.to_string(),
        })
    }
}

/// Drain the subject's stdout into the debug log until EOF
///
/// Output is raw bytes; the pipe must stay open for as long as the subject
/// may write to it.
async fn forward_output(pid: u32, stdout: ChildStdout) {
    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                debug!(target: "subject", "{}", text.trim_end_matches('\n'));
            }
            Err(e) => {
                warn!("Reading output of subject (PID {}) failed: {}", pid, e);
                break;
            }
        }
    }
}

fn prepare_working_dir(
    requested: Option<&Path>,
) -> Result<(PathBuf, Option<TempDir>), SubjectError> {
    match requested {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| SubjectError::WorkingDir {
                path: dir.to_path_buf(),
                reason: e.to_string(),
            })?;
            Ok((dir.to_path_buf(), None))
        }
        None => {
            let scratch = tempfile::Builder::new()
                .prefix("ips-subject-")
                .tempdir()
                .map_err(|e| SubjectError::WorkingDir {
                    path: std::env::temp_dir(),
                    reason: e.to_string(),
                })?;
            Ok((scratch.path().to_path_buf(), Some(scratch)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(args: &[&str]) -> SubjectProcessController {
        SubjectProcessController::new(&SubjectConfig {
            args: args.iter().map(|a| a.to_string()).collect(),
            startup_probe_ms: 200,
            grace_period_ms: 1500,
            ..SubjectConfig::default()
        })
    }

    #[test]
    fn test_state_transitions_are_one_directional() {
        use SubjectState::*;

        assert!(Starting.can_become(Running));
        assert!(Starting.can_become(Failed));
        assert!(Running.can_become(Stopped));
        assert!(Running.can_become(Failed));

        assert!(!Stopped.can_become(Running));
        assert!(!Failed.can_become(Running));
        assert!(!Stopped.can_become(Failed));
        assert!(!Running.can_become(Starting));
        assert!(!Starting.can_become(Stopped));
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let result = controller(&[])
            .start(Path::new("/nonexistent/ips"), None)
            .await;
        assert!(matches!(result, Err(SubjectError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_early_exit_marks_failed() {
        let handle = controller(&["-c", "exit 3"])
            .start(Path::new("/bin/sh"), None)
            .await
            .unwrap();

        assert_eq!(handle.state(), SubjectState::Failed);
        assert_eq!(handle.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_runs_in_scratch_directory() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let controller = controller(&[
            "-c",
            "touch artifact; trap 'exit 0' INT; while :; do sleep 0.1 & wait; done",
        ]);

        let mut handle = controller.start(Path::new("/bin/sh"), Some(&work)).await.unwrap();
        assert!(handle.is_running());
        assert_eq!(handle.working_dir(), work.as_path());
        assert!(work.join("artifact").exists());

        assert!(controller.stop(&mut handle).await);
        assert_eq!(handle.state(), SubjectState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_after_failed_start_returns_false() {
        let controller = controller(&["-c", "exit 0"]);
        let mut handle = controller.start(Path::new("/bin/sh"), None).await.unwrap();
        assert_eq!(handle.state(), SubjectState::Failed);

        assert!(!controller.stop(&mut handle).await);
        assert_eq!(handle.state(), SubjectState::Failed);
    }
}
