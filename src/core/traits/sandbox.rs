use std::{
    fmt::Debug,
    fs::File,
    io,
    ops::{Deref, DerefMut},
    path::PathBuf,
    sync::Arc,
};

use tokio::{sync::oneshot, task::JoinHandle};

use crate::core::domain::{Phase, ResourceUsage};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("cannot init sandbox {id}: {source}")]
    Create {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot start {program} in sandbox {id}: {source}")]
    Spawn {
        id: String,
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot wait for process in sandbox {id}: {source}")]
    Wait {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot destroy sandbox {id}: {source}")]
    Destroy {
        id: String,
        #[source]
        source: io::Error,
    },
}

/// What to start inside a prepared sandbox.
#[derive(Debug)]
pub struct ProcessSpec {
    /// `args[0]` is the program, looked up through the sandbox `PATH`.
    pub args: Vec<String>,
    /// Working directory as seen inside the sandbox.
    pub cwd: PathBuf,
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `-1` when the process was killed by a signal.
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub usage: ResourceUsage,
    /// The sandbox itself observed an out-of-memory kill.
    pub oom_killed: bool,
}

/// Synchronous, idempotent force-termination of a started process.
#[mockall::automock]
pub trait Terminate: Debug + Send + Sync {
    fn terminate(&self) -> io::Result<()>;
}

/// A process running inside a sandbox.
#[derive(Debug)]
pub struct Started {
    pub terminator: Arc<dyn Terminate>,
    /// Fires once when the memory ceiling is exceeded; dropped without firing otherwise.
    pub oom: oneshot::Receiver<()>,
    /// Resolves when the process has been reaped.
    pub wait: JoinHandle<io::Result<ProcessOutcome>>,
}

pub trait SandboxHandle: Debug + Send + Sync {
    fn id(&self) -> &str;

    fn spawn(&self, spec: ProcessSpec) -> Result<Started, SandboxError>;

    /// Idempotent teardown.
    fn destroy(&mut self) -> Result<(), SandboxError>;
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait Sandbox: Debug + Send + Sync {
    /// Allocates an isolated environment bounded by `phase.limits`.
    async fn prepare(
        &self,
        phase: &Phase,
        read_only_root: bool,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError>;
}

/// Destroys the wrapped handle when it goes out of scope.
#[derive(Debug)]
pub struct SandboxGuard(Box<dyn SandboxHandle>);

impl SandboxGuard {
    pub fn new(handle: Box<dyn SandboxHandle>) -> Self {
        SandboxGuard(handle)
    }
}

impl Deref for SandboxGuard {
    type Target = dyn SandboxHandle;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl DerefMut for SandboxGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.destroy() {
            tracing::error!("Failed to destroy sandbox: {}", e);
        }
    }
}
