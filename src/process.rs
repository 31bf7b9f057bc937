// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External process execution.
//!
//! Komodoenv leans on a handful of external programs: `bash` to find out what
//! a release's enable script actually activates, and Python itself to build
//! and populate the komodoenv. None of them are trusted to finish on their
//! own, so every call is bounded by a timeout.

use std::{
    ffi::OsStr,
    process::{ExitStatus, Stdio},
    time::Duration,
};
use tokio::{process::Command, time::timeout};
use tracing::{debug, instrument};

/// Run command to completion, and capture its standard output.
///
/// The child is killed if it does not finish within `limit`.
///
/// # Errors
///
/// - Return [`ProcessError::Spawn`] if command cannot be started.
/// - Return [`ProcessError::Timeout`] if command did not finish in time.
/// - Return [`ProcessError::Failed`] if command exited unsuccessfully.
#[instrument(skip(cmd), level = "debug")]
pub async fn syscall_capture(cmd: &mut Command, limit: Duration) -> Result<String> {
    let program = program_name(cmd);
    debug!("run {:?}", cmd.as_std());

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = timeout(limit, cmd.output())
        .await
        .map_err(|_| ProcessError::Timeout {
            program: program.clone(),
            limit,
        })?
        .map_err(|err| ProcessError::Spawn {
            source: err,
            program: program.clone(),
        })?;

    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

        // INVARIANT: Chomp trailing newlines.
        let stderr = stderr.trim_end_matches(['\r', '\n']).to_string();
        return Err(ProcessError::Failed {
            program,
            status: output.status,
            stderr,
        });
    }

    Ok(stdout)
}

/// Run command to completion, discarding its output.
///
/// # Errors
///
/// - Same as [`syscall_capture`].
pub async fn syscall_quiet(cmd: &mut Command, limit: Duration) -> Result<()> {
    syscall_capture(cmd, limit).await.map(|_| ())
}

fn program_name(cmd: &Command) -> String {
    let program: &OsStr = cmd.as_std().get_program();
    program.to_string_lossy().into_owned()
}

/// External process error types.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Command could not be started at all.
    #[error("failed to run {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// Command did not finish in time, and was killed.
    #[error("command {program:?} did not finish within {limit:?}")]
    Timeout { program: String, limit: Duration },

    /// Command finished unsuccessfully.
    #[error("command {program:?} failed with {status}:\n{stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ProcessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn capture_stdout() -> anyhow::Result<()> {
        let output = syscall_capture(
            Command::new("/bin/sh").args(["-c", "echo hello; echo world"]),
            Duration::from_secs(10),
        )
        .await?;
        assert_eq!(output, "hello\nworld\n");
        Ok(())
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let result = syscall_capture(
            Command::new("/bin/sh").args(["-c", "echo broken >&2; exit 3"]),
            Duration::from_secs(10),
        )
        .await;

        match result {
            Err(ProcessError::Failed { stderr, status, .. }) => {
                assert_eq!(stderr, "broken");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hanging_command_times_out() {
        let result = syscall_capture(
            Command::new("/bin/sh").args(["-c", "sleep 30"]),
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(ProcessError::Timeout { .. })));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let result = syscall_quiet(
            &mut Command::new("/nonexistent/komodoenv-test-binary"),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }
}
