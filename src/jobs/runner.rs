//! External process runner.
//!
//! Spawns one command with stdout and stderr attached to the same pipe, so
//! the caller sees the combined output in exactly the order it was written:
//! - lines are trimmed and empty lines are dropped
//! - invalid UTF-8 is decoded lossily rather than ending the stream
//! - the exit code is available once the line stream is exhausted

use std::os::fd::OwnedFd;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ProcessError;

/// Lines buffered between the pipe reader and the consumer.
const LINE_BUFFER: usize = 1024;

/// Exit code reported when the process was terminated by a signal.
pub const SIGNAL_EXIT_CODE: i32 = -1;

/// A running external command.
#[derive(Debug)]
pub struct ProcessRunner {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl ProcessRunner {
    /// Spawn `argv[0]` with the remaining arguments.
    pub fn spawn(argv: &[String]) -> Result<Self, ProcessError> {
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;

        // One pipe for both streams, like `2>&1`.
        let (reader, writer) = std::io::pipe().map_err(ProcessError::Pipe)?;
        let stderr_writer = writer.try_clone().map_err(ProcessError::Pipe)?;

        // The Command (and with it our copies of the write end) is dropped at
        // the end of this statement, so EOF arrives once the child exits.
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_writer))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output =
            pipe::Receiver::from_owned_fd(OwnedFd::from(reader)).map_err(ProcessError::Pipe)?;
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        tokio::spawn(forward_lines(output, tx));

        debug!(program = %program, pid = ?child.id(), "Spawned process");
        Ok(Self { child, lines: rx })
    }

    /// Next output line, or `None` once the output pipe is closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Terminate the process. Remaining buffered lines are still readable.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill process: {e}");
        }
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(mut self) -> Result<i32, ProcessError> {
        let status = self.child.wait().await.map_err(ProcessError::Wait)?;
        Ok(status.code().unwrap_or(SIGNAL_EXIT_CODE))
    }
}

/// Read the output pipe line by line and forward non-empty trimmed lines.
async fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line.to_string()).await.is_err() {
                    // Consumer went away; nothing left to deliver to.
                    break;
                }
            }
            Err(e) => {
                warn!("Output read failed: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    async fn collect(runner: &mut ProcessRunner) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = runner.next_line().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn streams_trimmed_non_empty_lines() {
        let mut runner = ProcessRunner::spawn(&sh("echo '  one  '; echo; echo two")).unwrap();
        assert_eq!(collect(&mut runner).await, ["one", "two"]);
        assert_eq!(runner.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn merges_stderr_in_emission_order() {
        let mut runner = ProcessRunner::spawn(&sh(
            "for i in $(seq 1 300); do echo o$i; echo e$i 1>&2; done",
        ))
        .unwrap();
        let lines = collect(&mut runner).await;

        let expected: Vec<String> = (1..=300)
            .flat_map(|i| [format!("o{i}"), format!("e{i}")])
            .collect();
        assert_eq!(lines, expected);
        assert_eq!(runner.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn preserves_order_within_a_stream() {
        let mut runner = ProcessRunner::spawn(&sh("for i in 1 2 3 4 5; do echo $i; done")).unwrap();
        assert_eq!(collect(&mut runner).await, ["1", "2", "3", "4", "5"]);
        runner.wait().await.unwrap();
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let mut runner = ProcessRunner::spawn(&sh("echo bye; exit 3")).unwrap();
        assert_eq!(collect(&mut runner).await, ["bye"]);
        assert_eq!(runner.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn spawn_failure_is_distinct() {
        let err = ProcessRunner::spawn(&["/nonexistent/dashborg-tool".to_string()]).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));

        let err = ProcessRunner::spawn(&[]).unwrap_err();
        assert!(matches!(err, ProcessError::EmptyCommand));
    }

    #[tokio::test]
    async fn kill_ends_the_stream() {
        let mut runner = ProcessRunner::spawn(&sh("echo started; exec sleep 30")).unwrap();
        assert_eq!(runner.next_line().await.as_deref(), Some("started"));
        runner.kill().await;
        assert!(runner.next_line().await.is_none());
        assert_eq!(runner.wait().await.unwrap(), SIGNAL_EXIT_CODE);
    }
}
