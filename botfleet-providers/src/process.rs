//! Subprocess helpers shared by the local and docker adapters.

use crate::LogFanout;
use anyhow::{anyhow, Context, Result};
use botfleet_common::progress::LogStream;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Best single-line explanation of a failed command.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.lines().last().unwrap_or(stderr).to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.lines().last().unwrap_or(stdout).to_string();
        }
        match self.code {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

async fn pump<R>(reader: Option<R>, stream: LogStream, logs: Option<LogFanout>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut collected = String::new();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(logs) = &logs {
            logs.publish(stream, &line);
        }
        collected.push_str(&line);
        collected.push('\n');
    }
    collected
}

/// Run a command to completion, forwarding each output line to `logs` as it arrives.
/// The child is killed if it outlives `timeout`.
pub async fn run(
    program: &str,
    args: &[String],
    timeout: Duration,
    logs: Option<&LogFanout>,
) -> Result<CommandOutput> {
    tracing::debug!("[process] {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn `{}`", program))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let waited = tokio::time::timeout(timeout, async {
        let (out, err, status) = tokio::join!(
            pump(stdout, LogStream::Stdout, logs.cloned()),
            pump(stderr, LogStream::Stderr, logs.cloned()),
            child.wait()
        );
        status.map(|s| CommandOutput {
            code: s.code(),
            stdout: out,
            stderr: err,
        })
    })
    .await;

    match waited {
        Ok(result) => result.with_context(|| format!("failed to wait for `{}`", program)),
        Err(_) => {
            let _ = child.start_kill();
            Err(anyhow!(
                "`{} {}` timed out after {}s",
                program,
                args.first().map(String::as_str).unwrap_or_default(),
                timeout.as_secs()
            ))
        }
    }
}

/// Forward a long-lived child's output into `logs` until the stream closes.
pub fn forward_lines<R>(reader: R, stream: LogStream, logs: LogFanout) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.publish(stream, &line);
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn run_collects_and_forwards_lines() {
        let logs = LogFanout::default();
        let mut rx = logs.subscribe();
        let out = run(
            "sh",
            &sh("echo one; echo two 1>&2; exit 3"),
            Duration::from_secs(10),
            Some(&logs),
        )
        .await
        .unwrap();

        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stdout, "one\n");
        assert_eq!(out.failure_message(), "two");

        let mut seen = Vec::new();
        while let Ok(l) = rx.try_recv() {
            seen.push((l.stream, l.line));
        }
        assert!(seen.contains(&(LogStream::Stdout, "one".to_string())));
        assert!(seen.contains(&(LogStream::Stderr, "two".to_string())));
    }

    #[tokio::test]
    async fn run_times_out() {
        let err = run("sh", &sh("sleep 5"), Duration::from_millis(100), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        assert!(run("definitely-not-a-real-binary-xyz", &[], Duration::from_secs(1), None)
            .await
            .is_err());
    }
}
