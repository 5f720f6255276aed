use std::{
    io,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use crate::core::{
    artifact::{ArtifactError, create_temp_file, read_bounded, remove_quietly},
    domain::{Fault, OmitString, Phase},
    layout::Layout,
    traits::sandbox::{ProcessOutcome, ProcessSpec, Sandbox, SandboxError, SandboxGuard},
    watchdog::run_supervised,
};

pub mod compiling;
pub mod running;
pub mod scratch;

/// Infrastructure failures. All of them end a request with an InternalError.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("cannot write source file {path}: {source}")]
    WriteSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot remove source file {path}: {source}")]
    RemoveSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("cannot find test cases for problem {0}")]
    UnknownProblem(String),
    #[error("cannot find executable {0}")]
    MissingExecutable(String),
    #[error("problem {0} has no custom checker")]
    MissingCustomChecker(String),
    #[error("checker failed with exit code {exit_code}")]
    CheckerFailed {
        exit_code: i32,
        signal: Option<i32>,
    },
}

/// Set-once error slot shared by concurrent tasks. The first error wins.
#[derive(Debug, Default)]
pub struct FirstError(OnceLock<PipelineError>);

impl FirstError {
    pub fn set(&self, err: PipelineError) {
        if let Err(dropped) = self.0.set(err) {
            tracing::debug!("Dropping error after the first one: {}", dropped);
        }
    }

    pub fn into_inner(self) -> Option<PipelineError> {
        self.0.into_inner()
    }
}

#[derive(Debug)]
pub struct Captured {
    pub outcome: ProcessOutcome,
    pub fault: Option<Fault>,
    pub stderr: Option<OmitString>,
}

/// Runs `phase` in a fresh writable-root sandbox with no stdin and stderr
/// captured into a bounded transcript.
pub async fn run_capturing_stderr(
    sandbox: &dyn Sandbox,
    layout: &Layout,
    phase: &Phase,
    cwd: &Path,
) -> Result<Captured, PipelineError> {
    let handle = SandboxGuard::new(sandbox.prepare(phase, false).await?);
    let (stderr_path, stderr) = create_temp_file(&layout.cache_dir).await?;

    let spec = ProcessSpec {
        args: phase.args.clone(),
        cwd: cwd.to_path_buf(),
        stdin: None,
        stdout: None,
        stderr: Some(stderr),
    };
    let run = run_supervised(&*handle, spec, phase.limits.time_ms).await;
    drop(handle);

    let captured = match run {
        Ok(_) => read_bounded(&stderr_path).await,
        Err(_) => Ok(None),
    };
    remove_quietly(&stderr_path).await;
    let (outcome, fault) = run?;

    Ok(Captured {
        outcome,
        fault,
        stderr: captured?,
    })
}
