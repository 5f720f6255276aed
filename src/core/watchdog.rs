use std::{io, sync::Arc, time::Duration};

use tokio::sync::oneshot;

use crate::{
    constants::wall_time_limit,
    core::{
        domain::Fault,
        traits::sandbox::{ProcessOutcome, ProcessSpec, SandboxError, SandboxHandle, Started, Terminate},
    },
};

/// Races the wall clock and the OOM notification against `cancel`, killing the
/// process at most once. Returns the fault that caused the kill.
///
/// `cancel` is raised by the caller as soon as the process has been reaped.
/// An `oom` sender dropped without firing is not an out-of-memory event.
pub async fn watch(
    terminator: Arc<dyn Terminate>,
    wall: Duration,
    oom: oneshot::Receiver<()>,
    cancel: oneshot::Receiver<()>,
) -> Option<Fault> {
    let fault = tokio::select! {
        biased;
        Ok(()) = oom => Fault::OutOfMemory,
        _ = cancel => return None,
        _ = tokio::time::sleep(wall) => Fault::TimeLimitExceeded,
    };

    tracing::debug!("Watchdog fired: {}", fault);
    if let Err(e) = terminator.terminate() {
        tracing::error!("Failed to terminate supervised process: {}", e);
        std::process::abort();
    }
    Some(fault)
}

/// Starts `spec` in `handle` and blocks until the process is gone, with the
/// watchdog enforcing `time_limit_ms` plus the wall clock slack.
pub async fn run_supervised(
    handle: &dyn SandboxHandle,
    spec: ProcessSpec,
    time_limit_ms: u32,
) -> Result<(ProcessOutcome, Option<Fault>), SandboxError> {
    let Started {
        terminator,
        oom,
        wait,
    } = handle.spawn(spec)?;

    let (cancel_tx, cancel_rx) = oneshot::channel();
    let watchdog = tokio::spawn(watch(
        terminator.clone(),
        wall_time_limit(time_limit_ms),
        oom,
        cancel_rx,
    ));

    let outcome = match wait.await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => return Err(abandon(handle, terminator.as_ref(), e)),
        Err(e) => return Err(abandon(handle, terminator.as_ref(), io::Error::other(e))),
    };
    let _ = cancel_tx.send(());

    let fault = match watchdog.await {
        Ok(fault) => fault,
        Err(e) => {
            tracing::error!("Watchdog task failed: {}", e);
            None
        }
    };
    let fault = fault.or(outcome.oom_killed.then_some(Fault::OutOfMemory));

    Ok((outcome, fault))
}

fn abandon(handle: &dyn SandboxHandle, terminator: &dyn Terminate, source: io::Error) -> SandboxError {
    if let Err(e) = terminator.terminate() {
        tracing::error!("Failed to terminate process with lost wait: {}", e);
    }
    SandboxError::Wait {
        id: handle.id().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        core::{
            domain::{Limits, Phase},
            traits::sandbox::{MockTerminate, Sandbox},
        },
        native::local::LocalSandbox,
    };

    fn terminator(times: usize) -> Arc<dyn Terminate> {
        let mut terminator = MockTerminate::new();
        terminator.expect_terminate().times(times).returning(|| Ok(()));
        Arc::new(terminator)
    }

    #[tokio::test]
    async fn test_oom_fires() {
        let (oom_tx, oom_rx) = oneshot::channel();
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        oom_tx.send(()).unwrap();

        let fault = watch(terminator(1), Duration::from_secs(10), oom_rx, cancel_rx).await;

        assert_eq!(fault, Some(Fault::OutOfMemory));
    }

    #[tokio::test]
    async fn test_timer_fires() {
        let (_oom_tx, oom_rx) = oneshot::channel();
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let fault = watch(terminator(1), Duration::from_millis(50), oom_rx, cancel_rx).await;

        assert_eq!(fault, Some(Fault::TimeLimitExceeded));
    }

    #[tokio::test]
    async fn test_cancel_stops_without_terminating() {
        let (_oom_tx, oom_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        cancel_tx.send(()).unwrap();

        let fault = watch(terminator(0), Duration::from_secs(10), oom_rx, cancel_rx).await;

        assert_eq!(fault, None);
    }

    #[tokio::test]
    async fn test_closed_oom_source_is_not_oom() {
        let (oom_tx, oom_rx) = oneshot::channel::<()>();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        drop(oom_tx);

        let watchdog = tokio::spawn(watch(
            terminator(0),
            Duration::from_secs(10),
            oom_rx,
            cancel_rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(()).unwrap();

        assert_eq!(watchdog.await.unwrap(), None);
    }

    fn shell_phase(time_ms: u32) -> Phase {
        Phase {
            exec: "sh".to_string(),
            args: vec!["sh".to_string()],
            limits: Limits {
                time_ms,
                memory_bytes: 256 << 20,
                stack_bytes: Some(8 << 20),
            },
        }
    }

    fn shell(script: &str) -> ProcessSpec {
        ProcessSpec {
            args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            cwd: PathBuf::from("/"),
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    #[tokio::test]
    async fn test_run_supervised_clean_exit() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new(root.path());
        let handle = sandbox.prepare(&shell_phase(1000), false).await.unwrap();

        let (outcome, fault) = run_supervised(handle.as_ref(), shell("exit 0"), 1000)
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(fault, None);
    }

    #[tokio::test]
    async fn test_run_supervised_time_limit() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new(root.path());
        let handle = sandbox.prepare(&shell_phase(100), false).await.unwrap();

        let started = std::time::Instant::now();
        let (outcome, fault) = run_supervised(handle.as_ref(), shell("sleep 5"), 100)
            .await
            .unwrap();

        assert!(started.elapsed() < wall_time_limit(100) + Duration::from_millis(500));
        assert_eq!(fault, Some(Fault::TimeLimitExceeded));
        assert_eq!(outcome.exit_code, -1);
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_run_supervised_spawn_error() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new(root.path());
        let handle = sandbox.prepare(&shell_phase(100), false).await.unwrap();
        let mut spec = shell("");
        spec.cwd = PathBuf::from("/missing");

        let result = run_supervised(handle.as_ref(), spec, 100).await;

        assert!(matches!(result, Err(SandboxError::Spawn { .. })));
    }
}
