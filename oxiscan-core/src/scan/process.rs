use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::{Result, ScanError};

/// Wraps one spawned scan process: its PID, the merged stream of output
/// lines, and the terminate-then-kill teardown sequence.
///
/// Stdout and stderr are read line-by-line on background tasks and funneled
/// into a single bounded channel, so a slow consumer backpressures the
/// readers instead of buffering without limit.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    lines: mpsc::Receiver<String>,
}

impl ProcessHandle {
    /// Spawns `command` with stdin closed and both output pipes captured.
    ///
    /// When `env` is provided the child sees exactly those variables instead
    /// of inheriting the parent environment, matching how callers hand an
    /// explicit environment to a scan tool.
    pub fn spawn(
        command: &[String],
        cwd: Option<&Path>,
        env: Option<&[(String, String)]>,
        line_capacity: usize,
    ) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ScanError::Precondition("command must not be empty".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        if let Some(vars) = env {
            cmd.env_clear();
            cmd.envs(vars.iter().map(|(key, value)| (key, value)));
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| ScanError::Spawn(format!("{program}: {err}")))?;
        let pid = child
            .id()
            .ok_or_else(|| ScanError::Spawn(format!("{program}: exited before startup")))?;

        let (tx, rx) = mpsc::channel(line_capacity.max(1));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        debug!(pid, program = %program, "spawned scan process");
        Ok(Self {
            child,
            pid,
            lines: rx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next output line in arrival order, or `None` once both pipes hit EOF.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Waits for natural exit. Cancel-safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Graceful teardown: terminate, wait out the grace window, then force
    /// kill. Returns the exit status and whether the kill was forced.
    ///
    /// The forced kill is mandatory once the grace window expires; a child
    /// that survives teardown is a leaked OS resource.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<(ExitStatus, bool)> {
        self.send_terminate()?;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                trace!(pid = self.pid, "process exited within grace window");
                Ok((status?, false))
            }
            Err(_) => {
                warn!(pid = self.pid, "grace window expired, force-killing");
                // start_kill errors when the child already exited between the
                // timeout firing and this call; wait() below settles either way.
                let _ = self.child.start_kill();
                Ok((self.child.wait().await?, true))
            }
        }
    }

    #[cfg(unix)]
    fn send_terminate(&mut self) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(ScanError::Internal(format!(
                "failed to signal pid {}: {err}",
                self.pid
            ))),
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(&mut self) -> Result<()> {
        // No portable soft-terminate outside unix; go straight to kill.
        let _ = self.child.start_kill();
        Ok(())
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                trace!("output pipe closed: {err}");
                break;
            }
        }
    }
}

/// Whether a previously recorded PID still refers to a live process.
///
/// Used when reconciling registry rows left `Running` by a crash; a recycled
/// PID can produce a false positive, which matches the conservative
/// behaviour of only repairing rows whose process is provably gone.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
