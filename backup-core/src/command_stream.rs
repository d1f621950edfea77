// Standard library
use std::ffi::OsStr;
use std::thread;
use std::time::{Duration, Instant};

// External crates
use duct::cmd;
use tracing::debug;
use which::which;

use crate::error::{GatewayError, GatewayResult};

/// Captured result of a successful tool invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

fn render_command<A: AsRef<OsStr>>(command: &str, args: &[A]) -> String {
    format!(
        "{} {}",
        command,
        args.iter()
            .map(|a| a.as_ref().to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    )
}

/// Run a command to completion, capturing stdout and stderr separately.
///
/// The child is killed once `timeout` elapses and the call fails with a
/// [`GatewayErrorKind::Timeout`](crate::error::GatewayErrorKind::Timeout)
/// error. A non-zero exit status is classified from stderr.
pub fn run_command_with_timeout<A: AsRef<OsStr>>(
    command: &str,
    args: &[A],
    timeout: Duration,
) -> GatewayResult<CommandOutput> {
    let full_command = render_command(command, args);
    debug!(command = %full_command, timeout_secs = timeout.as_secs(), "running command");

    let os_args: Vec<&OsStr> = args.iter().map(|a| a.as_ref()).collect();
    let handle = cmd(command, os_args)
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .start()
        .map_err(|e| GatewayError::from_io(&e, &format!("failed to start '{full_command}'")))?;

    let start = Instant::now();

    loop {
        if start.elapsed() >= timeout {
            let _ = handle.kill();
            return Err(GatewayError::timeout(format!(
                "command timed out after {}s: {}",
                timeout.as_secs(),
                full_command
            )));
        }

        match handle.try_wait() {
            Ok(Some(output)) => {
                let elapsed = start.elapsed();
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

                if !output.status.success() {
                    debug!(
                        command = %full_command,
                        code = ?output.status.code(),
                        stderr = %stderr.trim(),
                        "command failed"
                    );
                    let message = if stderr.trim().is_empty() {
                        format!(
                            "'{}' exited with status {:?}",
                            full_command,
                            output.status.code()
                        )
                    } else {
                        stderr
                    };
                    return Err(GatewayError::classify(&message));
                }

                debug!(
                    command = %full_command,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "command finished"
                );
                return Ok(CommandOutput {
                    stdout,
                    stderr,
                    elapsed,
                });
            }
            Ok(None) => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                return Err(GatewayError::from_io(
                    &e,
                    &format!("error waiting for '{full_command}'"),
                ));
            }
        }
    }
}

/// Checks if a command-line tool is available in the system's PATH.
pub fn is_tool_installed(tool_name: &str) -> bool {
    which(tool_name).is_ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::GatewayErrorKind;

    #[test]
    fn captures_stdout_of_successful_command() {
        let output =
            run_command_with_timeout("sh", &["-c", "echo hello"], Duration::from_secs(10)).unwrap();
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn non_zero_exit_is_classified_from_stderr() {
        let err = run_command_with_timeout(
            "sh",
            &["-c", "echo 'Error: Instance not found' >&2; exit 1"],
            Duration::from_secs(10),
        )
        .unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::NotFound);
        assert_eq!(err.raw_message, "Error: Instance not found");
    }

    #[test]
    fn silent_failure_reports_exit_status() {
        let err = run_command_with_timeout("sh", &["-c", "exit 3"], Duration::from_secs(10))
            .unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::Unknown);
        assert!(err.raw_message.contains("Some(3)"));
    }

    #[test]
    fn slow_command_is_killed_at_timeout() {
        let started = Instant::now();
        let err = run_command_with_timeout("sleep", &["5"], Duration::from_millis(300)).unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_binary_fails_to_start() {
        let err = run_command_with_timeout(
            "definitely-not-a-real-tool-1f4e",
            &["list"],
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::NotFound);
        assert!(!is_tool_installed("definitely-not-a-real-tool-1f4e"));
    }
}
