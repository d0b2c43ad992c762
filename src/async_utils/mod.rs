//! Asynchronous utilities for use with Tokio.
//!
//! Mostly glue for running external commands and blocking work without
//! stalling the runtime.

use std::process::Stdio;

use tokio::process::Command;

use crate::prelude::*;

pub mod io;

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. And each line of standard error may be optionally
/// checked by `is_error_line` to determine if the command failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(command_name, output = %stdout, "Standard output from command");
    if !stderr.trim().is_empty() {
        debug!(command_name, output = %stderr, "Standard error from command");
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line {
            if stderr.lines().any(is_error_line) {
                bail!("{} printed error output:\n{}", command_name, stderr);
            }
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        bail!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        )
    } else {
        bail!("{} failed with error output:\n{}", command_name, stderr)
    }
}

/// Make sure an external tool is installed, by running it with `version_arg`.
///
/// `install_hint` is appended to the error so users know what to install.
pub async fn ensure_command_available(
    command_name: &str,
    version_arg: &str,
    install_hint: &str,
) -> Result<()> {
    let status = Command::new(command_name)
        .arg(version_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await;
    match status {
        Ok(_) => {
            debug!(command_name, "Found external tool");
            Ok(())
        }
        Err(err) => Err(anyhow!(err)).with_context(|| {
            format!("could not run `{command_name}`. {install_hint}")
        }),
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}
