// src/graph/runner.rs
//! Executes one `ToolCommand`. The trait is the seam between the task graph and the OS,
//! so the graph can be driven by a recording runner in tests.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::{BoxFuture, FutureExt};
use tokio::process::Command;

use crate::config::defs::{ExecutionProfile, ToolError, STDERR_TAIL_LINES};
use crate::utils::command::ToolCommand;
use crate::utils::streams::tail_lines;

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stderr_tail: String,
}

pub trait ToolRunner: Send + Sync {
    fn run<'a>(&'a self, command: &'a ToolCommand) -> BoxFuture<'a, Result<ToolOutput, ToolError>>;
}

/// Runs tools as child processes, optionally wrapped in a container.
pub struct ProcessRunner {
    profile: ExecutionProfile,
    cwd: PathBuf,
}

impl ProcessRunner {
    pub fn new(profile: ExecutionProfile, cwd: &Path) -> Self {
        ProcessRunner {
            profile,
            cwd: cwd.to_path_buf(),
        }
    }
}

impl ToolRunner for ProcessRunner {
    fn run<'a>(&'a self, command: &'a ToolCommand) -> BoxFuture<'a, Result<ToolOutput, ToolError>> {
        async move {
            let argv = container_argv(&self.profile, command, &self.cwd);
            let stdout = match &command.stdout {
                Some(path) => Stdio::from(File::create(path).map_err(|e| ToolError::Io {
                    tool: command.tool.clone(),
                    error: format!("cannot create {}: {}", path.display(), e),
                })?),
                None => Stdio::null(),
            };

            let child = Command::new(&argv[0])
                .args(&argv[1..])
                .current_dir(&self.cwd)
                .stdin(Stdio::null())
                .stdout(stdout)
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| ToolError::Spawn {
                    tool: command.tool.clone(),
                    error: e.to_string(),
                })?;

            let output = child.wait_with_output().await.map_err(|e| ToolError::Io {
                tool: command.tool.clone(),
                error: e.to_string(),
            })?;
            let stderr_tail = tail_lines(&output.stderr, STDERR_TAIL_LINES);
            if !output.status.success() {
                return Err(ToolError::ExitStatus {
                    tool: command.tool.clone(),
                    code: output.status.code(),
                    stderr: stderr_tail,
                });
            }
            Ok(ToolOutput { stderr_tail })
        }
        .boxed()
    }
}

/// Host directories a containerised command needs: parents of every declared file,
/// explicit mounts and the working directory.
fn mount_dirs(command: &ToolCommand, cwd: &Path) -> BTreeSet<PathBuf> {
    let mut dirs = BTreeSet::new();
    let files = command
        .inputs
        .iter()
        .chain(command.outputs.iter())
        .chain(command.stdout.iter());
    for file in files {
        if let Some(parent) = file.parent() {
            if !parent.as_os_str().is_empty() {
                dirs.insert(parent.to_path_buf());
            }
        }
    }
    dirs.extend(command.mounts.iter().filter(|m| !m.as_os_str().is_empty()).cloned());
    dirs.insert(cwd.to_path_buf());
    dirs
}

/// Full argv for `command` under `profile`.
pub fn container_argv(profile: &ExecutionProfile, command: &ToolCommand, cwd: &Path) -> Vec<String> {
    let cwd_str = cwd.to_string_lossy().to_string();
    match profile {
        ExecutionProfile::Standard => command.argv(),
        ExecutionProfile::Docker { image } => {
            let mut argv: Vec<String> = vec!["docker".into(), "run".into(), "--rm".into()];
            for dir in mount_dirs(command, cwd) {
                let dir = dir.to_string_lossy().to_string();
                argv.push("-v".into());
                argv.push(format!("{}:{}", dir, dir));
            }
            argv.extend(["-w".to_string(), cwd_str, image.clone()]);
            argv.extend(command.argv());
            argv
        }
        ExecutionProfile::Singularity { image } => {
            let mut argv: Vec<String> = vec!["singularity".into(), "exec".into()];
            for dir in mount_dirs(command, cwd) {
                argv.push("-B".into());
                argv.push(dir.to_string_lossy().to_string());
            }
            argv.extend(["--pwd".to_string(), cwd_str, image.clone()]);
            argv.extend(command.argv());
            argv
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::command::samtools;
    use tempfile::tempdir;

    #[test]
    fn test_container_argv_mounts() {
        let cmd = samtools::index(Path::new("/data/in/S1.bam"), Path::new("/out/S1/S1.bam.bai"), 2);
        let standard = container_argv(&ExecutionProfile::Standard, &cmd, Path::new("/run"));
        assert_eq!(standard, cmd.argv());

        let docker = container_argv(
            &ExecutionProfile::Docker { image: "xenotx:1.0".to_string() },
            &cmd,
            Path::new("/run"),
        );
        assert_eq!(&docker[..3], &["docker", "run", "--rm"]);
        assert!(docker.contains(&"/data/in:/data/in".to_string()));
        assert!(docker.contains(&"/out/S1:/out/S1".to_string()));
        assert!(docker.contains(&"/run:/run".to_string()));
        let image_at = docker.iter().position(|a| a == "xenotx:1.0").expect("image present");
        assert_eq!(docker[image_at + 1], "samtools");

        let singularity = container_argv(
            &ExecutionProfile::Singularity { image: "xenotx.sif".to_string() },
            &cmd,
            Path::new("/run"),
        );
        assert_eq!(&singularity[..2], &["singularity", "exec"]);
        assert_eq!(singularity.iter().filter(|a| *a == "-B").count(), 3);
    }

    #[tokio::test]
    async fn test_process_runner_captures_stdout_and_failures() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let runner = ProcessRunner::new(ExecutionProfile::Standard, dir.path());

        let out = dir.path().join("echo.txt");
        let echo = ToolCommand::new("echo").arg("chrX_donor").stdout_to(&out);
        runner.run(&echo).await?;
        assert_eq!(std::fs::read_to_string(&out)?, "chrX_donor\n");

        let chatty = ToolCommand::new("sh").args(["-c", "echo warming up >&2; echo done >&2"]);
        assert_eq!(runner.run(&chatty).await?.stderr_tail, "warming up\ndone");

        let fail = ToolCommand::new("sh").args(["-c", "echo boom >&2; exit 3"]);
        match runner.run(&fail).await {
            Err(ToolError::ExitStatus { code, stderr, .. }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected exit status error, got {:?}", other),
        }

        let missing = ToolCommand::new("no-such-tool-xenotx");
        assert!(matches!(runner.run(&missing).await, Err(ToolError::Spawn { .. })));
        Ok(())
    }
}
