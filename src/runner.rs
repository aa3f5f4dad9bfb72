use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::UploaderError;
use crate::progress::{ProgressEvent, ProgressSink, Status};

/// An external command run on behalf of one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTask {
    pub label: String,
    pub action: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl TaskOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, command: &str) -> Result<TaskOutput, UploaderError>;
}

/// Runs commands through the platform shell so pipelines work.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn execute(&self, command: &str) -> Result<TaskOutput, UploaderError> {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C");
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c");
            cmd
        };
        let output = cmd
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| UploaderError::Filesystem(format!("spawn `{command}`: {err}")))?;
        Ok(TaskOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code(),
        })
    }
}

/// Runs `task`, bracketing it with progress events. A nonzero exit is an error.
pub async fn run_task(
    runner: &dyn CommandRunner,
    task: &ShellTask,
    sink: &dyn ProgressSink,
) -> Result<TaskOutput, UploaderError> {
    sink.event(ProgressEvent::sample(&task.action, Status::Started, &task.label));
    let output = runner.execute(&task.command).await?;
    debug!(
        label = %task.label,
        command = %task.command,
        code = ?output.code,
        stderr = %output.stderr.trim(),
        "executed command"
    );
    if !output.success() {
        return Err(UploaderError::Subprocess {
            label: task.label.clone(),
            command: task.command.clone(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    sink.event(ProgressEvent::sample(&task.action, Status::Finished, &task.label));
    Ok(output)
}
