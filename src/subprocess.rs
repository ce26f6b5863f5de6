//! Runs external processing scripts.
//!
//! A script is invoked as `<interpreter> <script> <args...>`. Its stdout and stderr
//! are logged line by line; the last non-empty stdout line is the result token.
//! Exit code 0 means success, anything else fails with the collected stderr.

use crate::error::ProcessError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Last non-empty stdout line, trimmed.
    pub result: Option<String>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, script: &Path, args: &[PathBuf]) -> Result<ProcessOutput, ProcessError>;
}

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: PathBuf,
    timeout: Option<Duration>,
}

impl ScriptRunner {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout: None,
        }
    }

    /// The script is killed and the run fails once `timeout` elapses.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ProcessRunner for ScriptRunner {
    async fn run(&self, script: &Path, args: &[PathBuf]) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(script)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            script: script.to_path_buf(),
            source,
        })?;
        debug!(script = %script.display(), pid = ?child.id(), "Spawned subprocess");

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let finished = {
            let run = async {
                let (stdout, stderr) = tokio::join!(
                    collect_lines(stdout_pipe, "stdout"),
                    collect_lines(stderr_pipe, "stderr")
                );
                let (stdout, stderr) = (stdout?, stderr?);
                let status = child.wait().await?;
                Ok::<_, std::io::Error>((status, stdout, stderr))
            };
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            }
        };

        let Some(finished) = finished else {
            if let Err(err) = child.kill().await {
                warn!(error = %err, "Could not kill timed out subprocess");
            }
            return Err(ProcessError::Timeout(self.timeout.unwrap_or_default()));
        };

        let (status, stdout, stderr) = finished?;
        if !status.success() {
            return Err(ProcessError::Exit {
                code: status.code(),
                stderr: stderr.join("\n"),
            });
        }

        Ok(ProcessOutput {
            result: last_non_empty_line(&stdout),
            stdout,
            stderr,
        })
    }
}

/// Reads a pipe to EOF. Bytes that are not UTF-8 are replaced rather than ending the read.
async fn collect_lines<R: AsyncRead + Unpin>(
    pipe: Option<R>,
    stream: &'static str,
) -> std::io::Result<Vec<String>> {
    let mut collected = Vec::new();
    let Some(pipe) = pipe else {
        return Ok(collected);
    };
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']).to_string();
        debug!(stream, "{}", line);
        collected.push(line);
    }
    Ok(collected)
}

pub fn last_non_empty_line(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .rev()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
