//! Running the grid command-line tools the agent delegates to

use std::io::{self, Write};
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

/// Write `contents` to a private temporary file for a tool that only reads files
///
/// The file is removed when the returned handle is dropped.
pub(crate) async fn scratch_file(prefix: &'static str, contents: Vec<u8>) -> io::Result<NamedTempFile> {
    tokio::task::spawn_blocking(move || -> io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new().prefix(prefix).tempfile()?;
        file.write_all(&contents)?;
        file.flush()?;
        Ok(file)
    })
    .await
    .map_err(io::Error::other)?
}

/// Substitute `{name}` placeholders in every argument
pub(crate) fn expand(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

/// Run `argv` to completion and return its stdout
///
/// A non-zero exit is an error carrying the command's stderr.
pub(crate) async fn run(argv: &[String], envs: &[(&str, String)]) -> Result<Vec<u8>, String> {
    let (program, args) = argv.split_first().ok_or_else(|| "empty command".to_string())?;

    debug!(program = %program, args = ?args, "Running external command");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        command.env(key, value);
    }

    let output = command
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        ));
    }

    Ok(output.stdout)
}
