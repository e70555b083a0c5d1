//! Small helpers for running external commands and writing output.

use anyhow::anyhow;
use tokio::{fs::File, io::AsyncWrite};

use crate::prelude::*;

/// Report any command failures, and include any error output.
///
/// Poppler's tools are chatty on standard error even when they succeed, so a
/// caller may pass a line predicate to decide which of those lines actually
/// indicate a failure.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    error_line_check: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        stdout = %stdout,
        stderr = %stderr,
        "Output from command"
    );

    if output.status.success() {
        if let Some(is_error_line) = error_line_check {
            if let Some(line) = stderr.lines().find(|line| is_error_line(line)) {
                return Err(anyhow!(
                    "{} printed error output: {}",
                    command_name,
                    line,
                ));
            }
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// Create an async writer for either standard output or a file.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}
