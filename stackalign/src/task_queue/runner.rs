use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{TaskFailure, TaskRunner};
use crate::primitive::{PrimitiveError, RegistrationPrimitive};
use crate::task::{decode_result, execute_task, AlignTask, TaskResult};

/// Runs each task in a child process speaking the delimited JSON protocol.
///
/// Children are killed when their task is aborted.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl TaskRunner for ProcessRunner {
    type Input = AlignTask;
    type Output = TaskResult;

    async fn run(&self, index: usize, task: &AlignTask) -> Result<TaskResult, TaskFailure> {
        let payload = serde_json::to_vec(task)
            .map_err(|err| TaskFailure::new(format!("Failed to encode task {index}: {err}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                TaskFailure::new(format!(
                    "Failed to launch {}: {err}",
                    self.program.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that dies early closes its stdin; its output still explains why.
            if let Err(err) = stdin.write_all(&payload).await {
                debug!(index, %err, "worker did not read its task");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| TaskFailure::new(format!("Failed to wait for worker: {err}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code();

        if !output.status.success() {
            return Err(TaskFailure {
                message: format!("Worker for section {index} exited with {}", output.status),
                stdout,
                stderr,
                exit_code,
            });
        }

        match decode_result(&stdout) {
            Ok(result) if result.index == index => Ok(result),
            Ok(result) => Err(TaskFailure {
                message: format!("Worker answered for section {} instead of {index}", result.index),
                stdout,
                stderr,
                exit_code,
            }),
            Err(err) => Err(TaskFailure {
                message: err.to_string(),
                stdout,
                stderr,
                exit_code,
            }),
        }
    }
}

/// Runs each task on the blocking thread pool against a shared primitive.
///
/// Aborting a task abandons its result but cannot interrupt the blocking call.
#[derive(Clone)]
pub struct InProcessRunner {
    primitive: Arc<dyn RegistrationPrimitive>,
}

impl InProcessRunner {
    pub fn new(primitive: Arc<dyn RegistrationPrimitive>) -> Self {
        Self { primitive }
    }
}

impl std::fmt::Debug for InProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessRunner").finish_non_exhaustive()
    }
}

#[async_trait]
impl TaskRunner for InProcessRunner {
    type Input = AlignTask;
    type Output = TaskResult;

    async fn run(&self, index: usize, task: &AlignTask) -> Result<TaskResult, TaskFailure> {
        let primitive = self.primitive.clone();
        let task = task.clone();
        let joined = tokio::task::spawn_blocking(move || execute_task(&task, primitive.as_ref()))
            .await
            .map_err(|err| TaskFailure::new(format!("Task {index} panicked: {err}")))?;

        joined.map_err(|err| match err {
            PrimitiveError::Exit {
                ref stderr, status, ..
            } => TaskFailure {
                message: err.to_string(),
                stderr: stderr.clone(),
                exit_code: status,
                ..Default::default()
            },
            other => TaskFailure::new(other.to_string()),
        })
    }
}
