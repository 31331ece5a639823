// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Captured output is capped at 10 MiB per stream.
const MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// Default idle timeout: coding CLIs legitimately think for many minutes
/// without emitting output, but can also hang indefinitely after finishing.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of one CLI execution.
#[derive(Debug, Clone, Default)]
pub struct CliResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub timed_out: bool,
    /// Killed because no output arrived for the idle window (armed only
    /// after the first output byte).
    pub idle_timeout_triggered: bool,
}

enum StreamEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Eof,
}

/// Executes CLI agents as subprocesses with interleaved output capture and
/// dual timeout semantics.
///
/// The child never inherits this process's stdin, and is killed on total
/// timeout, on idle timeout, and on caller cancellation (the future owns
/// the child with kill-on-drop).
pub struct CliExecutor {
    idle_timeout: Duration,
}

impl CliExecutor {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }

    pub async fn execute(
        &self,
        command: &[String],
        env: &HashMap<String, String>,
        total_timeout: Duration,
        cwd: Option<&Path>,
        idle_timeout: Option<Duration>,
    ) -> CliResult {
        let idle_timeout = idle_timeout.unwrap_or(self.idle_timeout);
        debug!(
            command = %command.join(" "),
            ?cwd,
            total = ?total_timeout,
            idle = ?idle_timeout,
            "spawning CLI agent"
        );

        let Some((program, args)) = command.split_first() else {
            return CliResult {
                stderr: "empty command".into(),
                return_code: -1,
                ..Default::default()
            };
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // NotFound covers both a missing executable and a missing
                // working directory; tell them apart for the caller.
                let stderr = match cwd {
                    Some(dir) if !dir.exists() => {
                        format!("Working directory not found: {}", dir.display())
                    }
                    _ => format!("Command not found: {program}"),
                };
                warn!(%stderr, "CLI spawn failed");
                return CliResult {
                    stderr,
                    return_code: 127,
                    ..Default::default()
                };
            }
            Err(e) => {
                return CliResult {
                    stderr: e.to_string(),
                    return_code: -1,
                    ..Default::default()
                };
            }
        };

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone(), true));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone(), false));
        }
        drop(tx);

        let start = Instant::now();
        let total_deadline = start + total_timeout;
        let mut last_output = start;
        let mut got_output = false;
        let mut stdout_buf: Vec<u8> = Vec::new();
        let mut stderr_buf: Vec<u8> = Vec::new();

        let (timed_out, idle_triggered, return_code) = loop {
            let idle_deadline = last_output + idle_timeout;
            tokio::select! {
                biased;
                // Total timeout takes precedence when both trip together.
                _ = tokio::time::sleep_until(total_deadline) => {
                    warn!(elapsed = ?start.elapsed(), "total timeout exceeded, killing process");
                    let _ = child.kill().await;
                    break (true, false, -1);
                }
                _ = tokio::time::sleep_until(idle_deadline), if got_output => {
                    warn!(idle = ?idle_timeout, "idle timeout exceeded, killing process");
                    let _ = child.kill().await;
                    break (false, true, -1);
                }
                event = rx.recv() => match event {
                    Some(StreamEvent::Stdout(data)) => {
                        got_output = true;
                        last_output = Instant::now();
                        append_capped(&mut stdout_buf, &data);
                    }
                    Some(StreamEvent::Stderr(data)) => {
                        got_output = true;
                        last_output = Instant::now();
                        append_capped(&mut stderr_buf, &data);
                    }
                    Some(StreamEvent::Eof) => {}
                    // Both pumps finished: wait for exit, bounded by the
                    // remaining total budget.
                    None => {
                        match tokio::time::timeout_at(total_deadline, child.wait()).await {
                            Ok(Ok(status)) => break (false, false, status.code().unwrap_or(-1)),
                            Ok(Err(e)) => {
                                warn!(error = %e, "wait failed");
                                break (false, false, -1);
                            }
                            Err(_) => {
                                let _ = child.kill().await;
                                break (true, false, -1);
                            }
                        }
                    }
                }
            }
        };

        CliResult {
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            return_code,
            timed_out,
            idle_timeout_triggered: idle_triggered,
        }
    }
}

async fn pump(
    mut stream: impl AsyncReadExt + Unpin,
    tx: mpsc::Sender<StreamEvent>,
    is_stdout: bool,
) {
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(StreamEvent::Eof).await;
                return;
            }
            Ok(n) => {
                let data = buf[..n].to_vec();
                let event = if is_stdout {
                    StreamEvent::Stdout(data)
                } else {
                    StreamEvent::Stderr(data)
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn append_capped(buf: &mut Vec<u8>, data: &[u8]) {
    let room = MAX_OUTPUT_SIZE.saturating_sub(buf.len());
    buf.extend_from_slice(&data[..data.len().min(room)]);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn env() -> HashMap<String, String> {
        HashMap::from([(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_default(),
        )])
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let ex = CliExecutor::new(DEFAULT_IDLE_TIMEOUT);
        let r = ex
            .execute(
                &sh("echo out; echo err >&2; exit 3"),
                &env(),
                Duration::from_secs(10),
                None,
                None,
            )
            .await;
        assert_eq!(r.return_code, 3);
        assert!(r.stdout.contains("out"));
        assert!(r.stderr.contains("err"));
        assert!(!r.timed_out);
        assert!(!r.idle_timeout_triggered);
    }

    #[tokio::test]
    async fn command_not_found_is_distinguished() {
        let ex = CliExecutor::new(DEFAULT_IDLE_TIMEOUT);
        let r = ex
            .execute(
                &["definitely-not-a-real-binary-xyz".to_string()],
                &env(),
                Duration::from_secs(5),
                None,
                None,
            )
            .await;
        assert_eq!(r.return_code, 127);
        assert!(r.stderr.contains("Command not found"), "{}", r.stderr);
    }

    #[tokio::test]
    async fn missing_cwd_is_distinguished() {
        let ex = CliExecutor::new(DEFAULT_IDLE_TIMEOUT);
        let r = ex
            .execute(
                &sh("echo hi"),
                &env(),
                Duration::from_secs(5),
                Some(Path::new("/definitely/not/a/dir")),
                None,
            )
            .await;
        assert_eq!(r.return_code, 127);
        assert!(r.stderr.contains("Working directory not found"), "{}", r.stderr);
    }

    #[tokio::test]
    async fn total_timeout_kills_silent_process() {
        let ex = CliExecutor::new(DEFAULT_IDLE_TIMEOUT);
        let r = ex
            .execute(&sh("sleep 30"), &env(), Duration::from_millis(300), None, None)
            .await;
        assert!(r.timed_out);
        assert!(!r.idle_timeout_triggered);
    }

    #[tokio::test]
    async fn idle_timeout_fires_only_after_first_output() {
        let ex = CliExecutor::new(DEFAULT_IDLE_TIMEOUT);
        // Emits a byte, then goes silent well past the idle window.
        let r = ex
            .execute(
                &sh("echo hello; sleep 30"),
                &env(),
                Duration::from_secs(20),
                None,
                Some(Duration::from_millis(400)),
            )
            .await;
        assert!(r.idle_timeout_triggered, "idle kill expected");
        assert!(!r.timed_out);
        assert!(r.stdout.contains("hello\n"));
    }

    #[tokio::test]
    async fn silent_process_is_not_idle_killed_before_first_output() {
        let ex = CliExecutor::new(DEFAULT_IDLE_TIMEOUT);
        // Never outputs; idle window is short but must not fire.
        let r = ex
            .execute(
                &sh("sleep 1"),
                &env(),
                Duration::from_secs(10),
                None,
                Some(Duration::from_millis(200)),
            )
            .await;
        assert!(!r.idle_timeout_triggered);
        assert!(!r.timed_out);
        assert_eq!(r.return_code, 0);
    }

    #[tokio::test]
    async fn total_timeout_wins_over_idle_when_both_exceeded() {
        let ex = CliExecutor::new(DEFAULT_IDLE_TIMEOUT);
        let r = ex
            .execute(
                &sh("echo x; sleep 30"),
                &env(),
                Duration::from_millis(300),
                None,
                Some(Duration::from_millis(300)),
            )
            .await;
        assert!(r.timed_out, "total timeout must take precedence");
        assert!(!r.idle_timeout_triggered);
    }
}
