//! Child process execution with line-by-line log streaming.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use convoy_model::{LogRecord, OrderId, Stage, TargetId, UnixTime};

/// Runs one stage's commands as child shells, streaming every stdout and
/// stderr line into a log record. Interleave order within a command is
/// preserved; a stop signal kills the child and waits out a grace period.
pub struct Executor {
    task: OrderId,
    target: TargetId,
    stage: Stage,
    debug: bool,
    logs: mpsc::Sender<LogRecord>,
    cancel: CancellationToken,
    grace: Duration,
}

impl Executor {
    /// Create an executor for one (task, stage) pair.
    #[must_use]
    pub fn new(
        task: OrderId,
        target: TargetId,
        stage: Stage,
        debug: bool,
        logs: mpsc::Sender<LogRecord>,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Self {
        Self {
            task,
            target,
            stage,
            debug,
            logs,
            cancel,
            grace,
        }
    }

    /// Run one command to completion in `cwd`. Returns true on a zero
    /// exit status.
    pub async fn execute(&self, command: &str, cwd: &Path) -> bool {
        debug!(task = %self.task, command = %command, "executing");

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(command = %command, error = %e, "failed to spawn command");
                self.log(command, &format!("failed to spawn: {e}"), true).await;
                return false;
            }
        };

        let mut stdout = child
            .stdout
            .take()
            .map(|s| BufReader::new(s).lines());
        let mut stderr = child
            .stderr
            .take()
            .map(|s| BufReader::new(s).lines());

        let mut stdout_done = stdout.is_none();
        let mut stderr_done = stderr.is_none();
        let mut killed = false;

        while !(stdout_done && stderr_done) {
            tokio::select! {
                () = self.cancel.cancelled(), if !killed => {
                    warn!(command = %command, "stop requested, terminating child");
                    let _ = child.start_kill();
                    killed = true;
                }
                line = next_line(&mut stdout), if !stdout_done => {
                    match line {
                        Some(line) => self.log(command, &line, false).await,
                        None => stdout_done = true,
                    }
                }
                line = next_line(&mut stderr), if !stderr_done => {
                    match line {
                        Some(line) => self.log(command, &line, false).await,
                        None => stderr_done = true,
                    }
                }
            }
        }

        let status = if killed {
            match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(Ok(status)) => Some(status),
                _ => None,
            }
        } else {
            child.wait().await.ok()
        };

        match status {
            Some(status) if status.success() && !killed => true,
            Some(status) => {
                let code = status.code().unwrap_or(-1);
                self.log(command, &format!("exit status {code}"), true).await;
                false
            }
            None => {
                self.log(command, "did not exit within the grace period", true)
                    .await;
                false
            }
        }
    }

    async fn log(&self, command: &str, output: &str, error: bool) {
        let record = LogRecord {
            task: self.task.clone(),
            target: self.target.clone(),
            stage: self.stage,
            command: command.to_owned(),
            output: output.to_owned(),
            error,
            time: UnixTime::now(),
            debug: self.debug,
        };
        if self.logs.send(record).await.is_err() {
            warn!("log sink closed, output lost");
        }
    }
}

async fn next_line<R>(lines: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines.as_mut() {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor(logs: mpsc::Sender<LogRecord>, cancel: CancellationToken) -> Executor {
        Executor::new(
            OrderId::new("o1"),
            TargetId::new("t1"),
            Stage::Install,
            false,
            logs,
            cancel,
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn streams_stdout_lines() {
        let (tx, mut rx) = mpsc::channel(16);
        let cwd = TempDir::new().expect("tempdir");
        let exec = executor(tx, CancellationToken::new());

        assert!(exec.execute("echo one; echo two", cwd.path()).await);

        let first = rx.recv().await.expect("line");
        assert_eq!(first.output, "one");
        assert!(!first.error);
        assert_eq!(first.command, "echo one; echo two");
        let second = rx.recv().await.expect("line");
        assert_eq!(second.output, "two");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let (tx, mut rx) = mpsc::channel(16);
        let cwd = TempDir::new().expect("tempdir");
        let exec = executor(tx, CancellationToken::new());

        assert!(!exec.execute("exit 3", cwd.path()).await);

        let record = rx.recv().await.expect("record");
        assert!(record.error);
        assert_eq!(record.output, "exit status 3");
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let (tx, mut rx) = mpsc::channel(16);
        let cwd = TempDir::new().expect("tempdir");
        let exec = executor(tx, CancellationToken::new());

        assert!(exec.execute("echo oops >&2", cwd.path()).await);

        let record = rx.recv().await.expect("record");
        assert_eq!(record.output, "oops");
    }

    #[tokio::test]
    async fn commands_run_in_the_task_directory() {
        let (tx, mut rx) = mpsc::channel(16);
        let cwd = TempDir::new().expect("tempdir");
        std::fs::write(cwd.path().join("marker"), "x").expect("write");
        let exec = executor(tx, CancellationToken::new());

        assert!(exec.execute("ls", cwd.path()).await);

        let record = rx.recv().await.expect("record");
        assert_eq!(record.output, "marker");
    }

    #[tokio::test]
    async fn stop_kills_the_child() {
        let (tx, mut rx) = mpsc::channel(64);
        let cwd = TempDir::new().expect("tempdir");
        let cancel = CancellationToken::new();
        let exec = executor(tx, cancel.clone());

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        assert!(!exec.execute("sleep 30", cwd.path()).await);
        assert!(started.elapsed() < Duration::from_secs(5));

        stopper.await.expect("stopper");

        let record = rx.recv().await.expect("record");
        assert!(record.error);
    }
}
