//! Subprocess execution with deadlines and cooperative cancellation.
//!
//! Children are polled rather than waited on so the caller's deadline and
//! cancellation token stay live. Termination is graceful: SIGTERM, a grace
//! window, then SIGKILL.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::context::CancelToken;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

/// Keep only the last `lines` lines of captured output.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

/// SIGTERM, wait up to `grace`, then SIGKILL.
fn stop_child(child: &mut Child, grace: Duration) {
    terminate(child);
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(100)),
            _ => break,
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn drain(child: &mut Child) -> (Vec<u8>, Vec<u8>) {
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }
    (stdout_bytes, stderr_bytes)
}

/// Run a command to completion, bounded by `timeout` and `cancel`.
///
/// On timeout or cancellation the child is stopped (SIGTERM → `grace` →
/// SIGKILL) and the output captured so far is returned with the matching
/// flag set; the caller decides how to classify it.
#[allow(clippy::too_many_arguments)]
pub fn run_command(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    envs: &[(&str, &str)],
    timeout: Duration,
    grace: Duration,
    cancel: &CancelToken,
    output_lines: usize,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        command.env(key, value);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let deadline = Instant::now() + timeout;
    let (exit_code, timed_out, cancelled) = loop {
        match child.try_wait().context("failed to poll command")? {
            Some(status) => break (status.code().unwrap_or(-1), false, false),
            None => {
                if cancel.is_cancelled() {
                    stop_child(&mut child, grace);
                    break (-1, false, true);
                }
                if Instant::now() >= deadline {
                    stop_child(&mut child, grace);
                    break (-1, true, false);
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    };

    let (stdout_bytes, stderr_bytes) = drain(&mut child);
    let mut stderr_tail = tail(&String::from_utf8_lossy(&stderr_bytes), output_lines);
    if timed_out {
        stderr_tail.push_str(&format!(
            "\ncommand timed out after {}",
            humantime::format_duration(timeout)
        ));
    }

    Ok(CommandOutput {
        exit_code,
        stdout_tail: tail(&String::from_utf8_lossy(&stdout_bytes), output_lines),
        stderr_tail,
        timed_out,
        cancelled,
        duration: start.elapsed(),
    })
}
