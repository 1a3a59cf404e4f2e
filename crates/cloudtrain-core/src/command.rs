//! External command execution (archive packing and unpacking via `tar`).

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Run `program args...` to completion. A non-zero exit is an error.
pub async fn run_command(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let start = Instant::now();
    let rendered = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    debug!(command = %rendered, "running command");

    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        return Err(PipelineError::CommandFailed {
            command: rendered,
            exit_code,
            stderr,
        });
    }

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Extract a gzipped tarball into `dest`.
pub async fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let archive = archive.to_string_lossy();
    let dest = dest.to_string_lossy();
    run_command("tar", &["-xzf", &archive, "-C", &dest]).await?;
    Ok(())
}

/// Pack the contents of `dir` (not the directory itself) into a gzipped tarball.
pub async fn create_tar_gz(dir: &Path, archive: &Path) -> Result<()> {
    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let archive = archive.to_string_lossy();
    let dir = dir.to_string_lossy();
    run_command("tar", &["-czf", &archive, "-C", &dir, "."]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_simple_command() {
        let out = run_command("echo", &["hello"]).await.expect("echo");
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_failing_command_is_error() {
        let err = run_command("false", &[]).await.unwrap_err();
        match err {
            PipelineError::CommandFailed { command, exit_code, .. } => {
                assert_eq!(command, "false");
                assert_ne!(exit_code, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_tar_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("train.py"), b"print('hi')").unwrap();
        std::fs::write(src.join("nested/util.py"), b"x = 1").unwrap();

        let archive = dir.path().join("out/sourcedir.tar.gz");
        create_tar_gz(&src, &archive).await.unwrap();
        assert!(archive.exists());

        let dest = dir.path().join("unpacked");
        extract_tar_gz(&archive, &dest).await.unwrap();
        assert_eq!(
            std::fs::read(dest.join("nested/util.py")).unwrap(),
            b"x = 1".to_vec()
        );
    }
}
