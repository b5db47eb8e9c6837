//! Helpers for running blocking work and external commands under Tokio.

use std::pin::Pin;

use futures::Stream;

use crate::prelude::*;

pub mod io;
pub mod size_hint;

/// A boxed, sendable stream. Saves spelling out long stream types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Run CPU-bound work on Tokio's blocking pool.
///
/// If `f` panics, the panic is resumed in the caller, just as if `f` had been
/// called directly. The only error is the runtime shutting down under us.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Ok(value),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => Err(anyhow!("blocking task was cancelled: {err}")),
    }
}

/// Turn a failed external command into an error that includes its output.
///
/// Standard error is only logged loudly when the command fails, because some
/// tools (Tesseract included) print progress chatter there.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name,
        output = %String::from_utf8_lossy(&output.stdout),
        "Standard output from command"
    );

    if output.status.success() {
        if !stderr.trim().is_empty() {
            debug!(command_name, output = %stderr, "Standard error from command");
        }
        return Ok(());
    }
    error!(command_name, output = %stderr, "Command failed");
    match output.status.code() {
        Some(exit_code) => Err(anyhow!(
            "{command_name} failed with exit code {exit_code} and error output:\n{stderr}"
        )),
        None => Err(anyhow!(
            "{command_name} was terminated by a signal, with error output:\n{stderr}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[tokio::test]
    async fn blocking_work_returns_value() {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    #[should_panic(expected = "kaboom")]
    async fn blocking_panics_propagate() {
        let _ = spawn_blocking_propagating_panics(|| -> u8 { panic!("kaboom") }).await;
    }

    #[test]
    #[cfg(unix)]
    fn command_failure_includes_stderr() {
        let output = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .output()
            .unwrap();
        let err = check_for_command_failure("sh", &output).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("oops"), "{msg}");
    }

    #[test]
    #[cfg(unix)]
    fn stderr_chatter_is_not_failure() {
        let output = Command::new("sh")
            .args(["-c", "echo 'Estimating resolution' >&2"])
            .output()
            .unwrap();
        check_for_command_failure("sh", &output).unwrap();
    }
}
