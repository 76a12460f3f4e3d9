use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::errors::{ContainerError, ContainerResult};

/// Captured output of a finished subprocess. Both pipes are fully drained
/// before this is produced.
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug)]
pub enum StreamedLine {
    Stdout(String),
    Stderr(String),
}

/// Seam between the container manager and the runtime CLI. The production
/// implementation spawns real processes; tests substitute a recording mock.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Run to completion. A non-zero exit is an error carrying the stderr
    /// tail. Arguments are passed as a list; nothing is shell-interpreted.
    async fn run(&self, binary: &str, args: &[&str]) -> ContainerResult<CommandOutput>;

    /// Run while forwarding output line-by-line, resolving with the exit
    /// code once both pipes hit EOF.
    async fn run_streamed(
        &self,
        binary: &str,
        args: &[&str],
        lines: mpsc::UnboundedSender<StreamedLine>,
    ) -> ContainerResult<i32>;
}

pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, binary: &str, args: &[&str]) -> ContainerResult<CommandOutput> {
        let output = Command::new(binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: format!("{binary} {}", args.join(" ")),
                message: tail(&stderr),
            });
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: output.status.code().unwrap_or_default(),
        })
    }

    async fn run_streamed(
        &self,
        binary: &str,
        args: &[&str],
        lines: mpsc::UnboundedSender<StreamedLine>,
    ) -> ContainerResult<i32> {
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ContainerError::CommandFailed {
                command: binary.to_string(),
                message: "stdout pipe missing".to_string(),
            }
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ContainerError::CommandFailed {
                command: binary.to_string(),
                message: "stderr pipe missing".to_string(),
            }
        })?;

        let out_lines = lines.clone();
        let out_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if out_lines.send(StreamedLine::Stdout(line)).is_err() {
                    break;
                }
            }
        });
        let err_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if lines.send(StreamedLine::Stderr(line)).is_err() {
                    break;
                }
            }
        });

        let status = child.wait().await?;
        let _ = out_task.await;
        let _ = err_task.await;

        Ok(status.code().unwrap_or_default())
    }
}

const TAIL_LIMIT: usize = 2048;

/// Last `TAIL_LIMIT` bytes of a pipe capture, on a char boundary.
fn tail(s: &str) -> String {
    let trimmed = s.trim_end();
    if trimmed.len() <= TAIL_LIMIT {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - TAIL_LIMIT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let out = SystemRunner
            .run("/bin/sh", &["-c", "printf hello"])
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let err = SystemRunner
            .run("/bin/sh", &["-c", "echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            ContainerError::CommandFailed { message, .. } => {
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn streamed_yields_both_pipes_and_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let code = SystemRunner
            .run_streamed("/bin/sh", &["-c", "echo out; echo err >&2; exit 2"], tx)
            .await
            .unwrap();
        assert_eq!(code, 2);

        let mut saw_out = false;
        let mut saw_err = false;
        while let Ok(line) = rx.try_recv() {
            match line {
                StreamedLine::Stdout(l) if l == "out" => saw_out = true,
                StreamedLine::Stderr(l) if l == "err" => saw_err = true,
                _ => {}
            }
        }
        assert!(saw_out && saw_err);
    }

    #[test]
    fn tail_truncates_long_output() {
        let long = "x".repeat(TAIL_LIMIT * 2);
        assert_eq!(tail(&long).len(), TAIL_LIMIT);
        assert_eq!(tail("short"), "short");
    }
}
