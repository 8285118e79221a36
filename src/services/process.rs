//! External script invocation.
//!
//! Launching never blocks the caller: the child runs on its own task, its
//! stdout and stderr are streamed line by line into the log, and the exit
//! status is delivered through the returned [`ScriptTask`].

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Maximum stderr retained for error reporting (64 KiB).
const MAX_CAPTURED_STDERR: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to run {script}: {source}")]
    Spawn {
        script: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{script} exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        script: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{script} finished without reporting a result")]
    Abandoned { script: String },
}

/// Handle on a running script. Dropping it does not stop the script.
#[derive(Debug)]
pub struct ScriptTask {
    script: String,
    rx: oneshot::Receiver<Result<ScriptOutput, ProcessError>>,
}

impl ScriptTask {
    /// A task that has already finished with `result`.
    pub fn finished(script: impl Into<String>, result: Result<ScriptOutput, ProcessError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            script: script.into(),
            rx,
        }
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// Wait for the script to exit. Non-zero exits are errors.
    pub async fn wait(self) -> Result<ScriptOutput, ProcessError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Abandoned {
                script: self.script,
            }),
        }
    }
}

/// Starts external scripts with positional arguments.
pub trait ScriptLauncher: Send + Sync {
    fn launch(&self, script: &Path, args: &[String]) -> ScriptTask;
}

/// Runs scripts through a shell (`bash <script> <args..>`).
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    shell: String,
}

impl ShellLauncher {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl ScriptLauncher for ShellLauncher {
    fn launch(&self, script: &Path, args: &[String]) -> ScriptTask {
        let name = script.display().to_string();
        let mut cmd = Command::new(&self.shell);
        cmd.arg(script)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(script = %name, ?args, "Launching script");
        let (tx, rx) = oneshot::channel();
        let task_name = name.clone();
        tokio::spawn(async move {
            let result = run_to_exit(cmd, &task_name).await;
            let _ = tx.send(result);
        });

        ScriptTask { script: name, rx }
    }
}

async fn run_to_exit(mut cmd: Command, script: &str) -> Result<ScriptOutput, ProcessError> {
    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        script: script.to_string(),
        source,
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_name = script.to_string();
    let stdout_task = tokio::spawn(async move {
        let Some(stdout) = stdout else { return };
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(script = %out_name, "{line}");
        }
    });

    let err_name = script.to_string();
    let stderr_task = tokio::spawn(async move {
        let mut captured = String::new();
        let Some(stderr) = stderr else { return captured };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(script = %err_name, "{line}");
            if captured.len() + line.len() < MAX_CAPTURED_STDERR {
                captured.push_str(&line);
                captured.push('\n');
            }
        }
        captured
    });

    let status = child.wait().await.map_err(|source| ProcessError::Spawn {
        script: script.to_string(),
        source,
    })?;
    let _ = stdout_task.await;
    let stderr = stderr_task.await.unwrap_or_default();
    let exit_code = status.code().unwrap_or(-1);
    let duration_ms = start.elapsed().as_millis() as u64;

    if status.success() {
        info!(script, exit_code, duration_ms, "Script finished");
        Ok(ScriptOutput {
            exit_code,
            stderr,
            duration_ms,
        })
    } else {
        Err(ProcessError::NonZeroExit {
            script: script.to_string(),
            exit_code,
            stderr: stderr.trim_end().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_script(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new()
            .suffix(".sh")
            .tempfile()
            .expect("create temp file");
        writeln!(f, "#!/bin/bash").expect("write shebang");
        write!(f, "{body}").expect("write body");
        f
    }

    #[tokio::test]
    async fn test_arguments_are_positional() {
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("args.txt");
        let script = write_temp_script(&format!("echo \"$1|$2|$3\" > {}\n", target.display()));
        let task = ShellLauncher::new("bash").launch(
            script.path(),
            &["u1".to_string(), "job 1".to_string(), "svs".to_string()],
        );
        let output = task.wait().await.expect("script succeeds");
        assert_eq!(output.exit_code, 0);
        assert_eq!(std::fs::read_to_string(target).unwrap().trim(), "u1|job 1|svs");
    }

    #[tokio::test]
    async fn test_nonzero_exit_captures_stderr() {
        let script = write_temp_script("echo boom >&2\nexit 3\n");
        let result = ShellLauncher::new("bash").launch(script.path(), &[]).wait().await;
        match result {
            Err(ProcessError::NonZeroExit {
                exit_code, stderr, ..
            }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_error() {
        let result = ShellLauncher::new("/nonexistent/shell")
            .launch(Path::new("whatever.sh"), &[])
            .wait()
            .await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_finished_task() {
        let task = ScriptTask::finished(
            "stub.sh",
            Ok(ScriptOutput {
                exit_code: 0,
                stderr: String::new(),
                duration_ms: 0,
            }),
        );
        assert_eq!(task.script(), "stub.sh");
        assert!(task.wait().await.is_ok());
    }
}
