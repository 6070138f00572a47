/// Parent side of the keepalive channel: spawn the watchdog, feed it liveness
/// pings (one newline each), and report how it ended.
use crate::priority::{self, IoPriority, PriorityError};
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Byte written for every liveness ping.
pub const PING: u8 = b'\n';

/// How a watchdog process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// Returned from main, e.g. status 1 after its input closed.
    Exited(i32),
    /// Killed by a signal; SIGALRM means the deadline passed.
    Signaled(Signal),
}

impl KeepaliveOutcome {
    /// True when the watchdog's own alarm ended it.
    pub fn timed_out(&self) -> bool {
        matches!(self, KeepaliveOutcome::Signaled(Signal::SIGALRM))
    }
}

/// Errors that can occur while supervising a watchdog.
#[derive(Debug)]
pub enum SupervisorError {
    /// Failed to spawn the watchdog.
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    /// The input channel was already closed or handed to a heartbeat.
    InputClosed,
    /// Writing a ping failed.
    Ping { source: std::io::Error },
    /// Waiting for the process failed.
    Wait { source: std::io::Error },
    /// The heartbeat task panicked or was cancelled.
    Heartbeat { source: tokio::task::JoinError },
    /// The exit status carried neither a code nor a known signal.
    UnknownStatus(std::process::ExitStatus),
    /// Reading the child's priorities failed.
    Priority { source: PriorityError },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program.display(), source)
            }
            SupervisorError::InputClosed => write!(f, "keepalive input is not available"),
            SupervisorError::Ping { source } => write!(f, "failed to send ping: {}", source),
            SupervisorError::Wait { source } => {
                write!(f, "failed to wait for keepalive: {}", source)
            }
            SupervisorError::Heartbeat { source } => {
                write!(f, "heartbeat task failed: {}", source)
            }
            SupervisorError::UnknownStatus(status) => {
                write!(f, "unrecognized exit status: {}", status)
            }
            SupervisorError::Priority { source } => write!(f, "{}", source),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::Ping { source } => Some(source),
            SupervisorError::Wait { source } => Some(source),
            SupervisorError::Heartbeat { source } => Some(source),
            SupervisorError::Priority { source } => Some(source),
            SupervisorError::InputClosed | SupervisorError::UnknownStatus(_) => None,
        }
    }
}

/// A running watchdog and the write end of its stdin.
pub struct KeepaliveProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    pid: u32,
}

/// A background task pinging on a fixed interval.
pub struct Heartbeat {
    stop: oneshot::Sender<()>,
    task: JoinHandle<(ChildStdin, Result<u64, std::io::Error>)>,
}

impl KeepaliveProcess {
    /// Spawn `program`, passing `timeout_secs` as its argument when given.
    ///
    /// stdin is piped; stdout and stderr are inherited. The child is killed
    /// if this handle is dropped while it is still running.
    pub fn spawn(program: &Path, timeout_secs: Option<u32>) -> Result<Self, SupervisorError> {
        let mut cmd = Command::new(program);
        if let Some(secs) = timeout_secs {
            cmd.arg(secs.to_string());
        }
        Self::spawn_command(cmd, program)
    }

    /// Spawn `program` with a raw argument list, e.g. an unparsed timeout.
    pub fn spawn_with_args<I, S>(program: &Path, args: I) -> Result<Self, SupervisorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args);
        Self::spawn_command(cmd, program)
    }

    fn spawn_command(mut cmd: Command, program: &Path) -> Result<Self, SupervisorError> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                program: program.to_path_buf(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take();
        tracing::info!(pid, program = %program.display(), "keepalive started");

        Ok(Self { child, stdin, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send one liveness ping.
    pub async fn ping(&mut self) -> Result<(), SupervisorError> {
        let stdin = self.stdin.as_mut().ok_or(SupervisorError::InputClosed)?;
        write_ping(stdin)
            .await
            .map_err(|e| SupervisorError::Ping { source: e })
    }

    /// Hand stdin to a background task that pings every `interval`.
    pub fn start_heartbeat(&mut self, interval: Duration) -> Result<Heartbeat, SupervisorError> {
        let mut stdin = self.stdin.take().ok_or(SupervisorError::InputClosed)?;
        let (stop, mut stopped) = oneshot::channel();
        let pid = self.pid;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut sent: u64 = 0;
            loop {
                tokio::select! {
                    _ = &mut stopped => return (stdin, Ok(sent)),
                    _ = ticker.tick() => {
                        if let Err(e) = write_ping(&mut stdin).await {
                            tracing::warn!(pid, error = %e, "heartbeat ping failed");
                            return (stdin, Err(e));
                        }
                        sent += 1;
                        tracing::debug!(pid, sent, "heartbeat ping");
                    }
                }
            }
        });

        Ok(Heartbeat { stop, task })
    }

    /// Stop a heartbeat and take stdin back, leaving the channel open.
    /// Returns the number of pings the heartbeat sent.
    pub async fn stop_heartbeat(&mut self, heartbeat: Heartbeat) -> Result<u64, SupervisorError> {
        // The task may already have returned after a failed write
        let _ = heartbeat.stop.send(());
        let (stdin, sent) = heartbeat
            .task
            .await
            .map_err(|e| SupervisorError::Heartbeat { source: e })?;
        self.stdin = Some(stdin);
        sent.map_err(|e| SupervisorError::Ping { source: e })
    }

    /// Close stdin so the watchdog reads end-of-stream.
    pub fn close_input(&mut self) {
        if self.stdin.take().is_some() {
            tracing::debug!(pid = self.pid, "keepalive input closed");
        }
    }

    /// Whether the process has not exited yet.
    pub fn is_running(&mut self) -> Result<bool, SupervisorError> {
        self.child
            .try_wait()
            .map(|status| status.is_none())
            .map_err(|e| SupervisorError::Wait { source: e })
    }

    /// Wait for the process to end.
    pub async fn wait(&mut self) -> Result<KeepaliveOutcome, SupervisorError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| SupervisorError::Wait { source: e })?;

        let outcome = outcome_from_status(status)?;
        tracing::info!(pid = self.pid, outcome = ?outcome, "keepalive ended");
        Ok(outcome)
    }

    /// Kill the process with SIGKILL and reap it.
    pub async fn kill(&mut self) -> Result<(), SupervisorError> {
        self.child
            .kill()
            .await
            .map_err(|e| SupervisorError::Wait { source: e })
    }

    /// The child's current nice value.
    pub fn niceness(&self) -> Result<i32, SupervisorError> {
        priority::niceness_of(self.pid).map_err(|e| SupervisorError::Priority { source: e })
    }

    /// The child's current I/O priority.
    pub fn io_priority(&self) -> Result<IoPriority, SupervisorError> {
        priority::io_priority_of(self.pid).map_err(|e| SupervisorError::Priority { source: e })
    }
}

async fn write_ping(stdin: &mut ChildStdin) -> std::io::Result<()> {
    stdin.write_all(&[PING]).await?;
    stdin.flush().await
}

fn outcome_from_status(
    status: std::process::ExitStatus,
) -> Result<KeepaliveOutcome, SupervisorError> {
    if let Some(code) = status.code() {
        return Ok(KeepaliveOutcome::Exited(code));
    }
    status
        .signal()
        .and_then(|raw| Signal::try_from(raw).ok())
        .map(KeepaliveOutcome::Signaled)
        .ok_or(SupervisorError::UnknownStatus(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    // `sh` stands in for the watchdog here; the real binary is exercised by
    // the integration tests.

    fn sh(script: &str) -> KeepaliveProcess {
        KeepaliveProcess::spawn_with_args(Path::new("sh"), ["-c", script]).unwrap()
    }

    #[test]
    fn test_outcome_from_exit_code() {
        let status = std::process::ExitStatus::from_raw(1 << 8);
        assert_eq!(
            outcome_from_status(status).unwrap(),
            KeepaliveOutcome::Exited(1)
        );
    }

    #[test]
    fn test_outcome_from_alarm_signal() {
        let status = std::process::ExitStatus::from_raw(Signal::SIGALRM as i32);
        let outcome = outcome_from_status(status).unwrap();
        assert_eq!(outcome, KeepaliveOutcome::Signaled(Signal::SIGALRM));
        assert!(outcome.timed_out());
    }

    #[test]
    fn test_other_signal_is_not_a_timeout() {
        assert!(!KeepaliveOutcome::Signaled(Signal::SIGKILL).timed_out());
        assert!(!KeepaliveOutcome::Exited(1).timed_out());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = KeepaliveProcess::spawn(Path::new("nonexistent-binary-xyz"), Some(5))
            .err()
            .unwrap();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.to_string().contains("nonexistent-binary-xyz"));
    }

    #[tokio::test]
    async fn test_ping_reaches_child_stdin() {
        // Exits with 0 only if the first line it reads is empty, i.e. a bare newline
        let mut proc = sh("read line; [ -z \"$line\" ]");
        proc.ping().await.unwrap();
        assert_eq!(proc.wait().await.unwrap(), KeepaliveOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_close_input_sends_eof() {
        let mut proc = sh("cat >/dev/null; exit 1");
        proc.close_input();
        assert_eq!(proc.wait().await.unwrap(), KeepaliveOutcome::Exited(1));
        assert!(matches!(
            proc.ping().await,
            Err(SupervisorError::InputClosed)
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_counts_and_returns_input() {
        let mut proc = sh("cat >/dev/null");
        let heartbeat = proc.start_heartbeat(Duration::from_millis(20)).unwrap();
        assert!(matches!(
            proc.ping().await,
            Err(SupervisorError::InputClosed)
        ));

        tokio::time::sleep(Duration::from_millis(120)).await;
        let sent = proc.stop_heartbeat(heartbeat).await.unwrap();
        // interval ticks immediately, then every 20ms
        assert!(sent >= 2, "sent {sent}");

        // stdin is back and still open
        proc.ping().await.unwrap();
        assert!(proc.is_running().unwrap());

        proc.close_input();
        assert_eq!(proc.wait().await.unwrap(), KeepaliveOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_kill_reports_sigkill() {
        let mut proc = sh("sleep 30");
        proc.kill().await.unwrap();
        assert_eq!(
            proc.wait().await.unwrap(),
            KeepaliveOutcome::Signaled(Signal::SIGKILL)
        );
    }

    #[tokio::test]
    async fn test_niceness_of_child_is_readable() {
        let mut proc = sh("cat >/dev/null");
        let nice = proc.niceness().unwrap();
        assert!((-20..=19).contains(&nice));
        proc.close_input();
        proc.wait().await.unwrap();
    }
}
