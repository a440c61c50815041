use std::process::Command;

use fc_error::{FanctlError, Result};
use tracing::trace;

/// Run an external tool and return its stdout
///
/// A non-zero exit status is an error carrying the tool's stderr.
pub fn run_command(program: &str, args: &[&str]) -> Result<String> {
    run_command_accepting(program, args, |code| code == 0)
}

/// Like [`run_command`], but `accept` decides which exit codes still carry
/// usable output. A tool killed by a signal is always an error.
pub fn run_command_accepting(program: &str, args: &[&str], accept: impl Fn(i32) -> bool) -> Result<String> {
    let rendered = format!("{} {}", program, args.join(" "));
    trace!(command = %rendered, "Running command");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| FanctlError::firmware(&rendered, e))?;

    if !output.status.code().is_some_and(accept) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FanctlError::firmware(
            rendered,
            format!("{}: {}", output.status, stderr.trim()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
