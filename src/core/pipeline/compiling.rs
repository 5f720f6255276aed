use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::{StreamExt, stream::FuturesUnordered};
use tokio::fs;

use crate::core::{
    artifact::make_scratch_dir,
    domain::{CompilePhase, CompileResult, OmitString, SourceFile},
    layout::Layout,
    pipeline::{Captured, FirstError, PipelineError, run_capturing_stderr, scratch::ScratchRoot},
    traits::sandbox::Sandbox,
};

#[derive(Debug)]
pub struct CompileOutput {
    pub root: ScratchRoot,
    /// Build directory of every target that compiled, relative to the work dir.
    pub exec_dirs: HashMap<String, PathBuf>,
    /// Result of every target that ran its compiler.
    pub results: HashMap<String, CompileResult>,
    /// First infrastructure failure among the targets.
    pub error: Option<PipelineError>,
}

/// Builds every target concurrently, each in its own directory and sandbox.
///
/// Only failing to create the scratch root is returned as `Err`; once the root
/// exists it is handed back so the caller can clean it up.
#[tracing::instrument(skip_all, fields(targets = phases.len()))]
pub async fn compile_all(
    phases: &[CompilePhase],
    sandbox: Arc<dyn Sandbox>,
    layout: Arc<Layout>,
) -> Result<CompileOutput, PipelineError> {
    let root = ScratchRoot::create(&layout).await?;
    let mut output = CompileOutput {
        root,
        exec_dirs: HashMap::new(),
        results: HashMap::new(),
        error: None,
    };

    let mut targets = Vec::with_capacity(phases.len());
    for phase in phases {
        match make_scratch_dir(output.root.path(), layout.work_user).await {
            Ok((name, _)) => targets.push((phase.clone(), Path::new(output.root.name()).join(name))),
            Err(e) => {
                output.error = Some(e.into());
                return Ok(output);
            }
        }
    }

    let first_error = Arc::new(FirstError::default());
    let mut tasks = targets
        .into_iter()
        .map(|(phase, dir)| {
            let sandbox = sandbox.clone();
            let layout = layout.clone();
            let first_error = first_error.clone();

            tokio::spawn(async move {
                match compile_target(&phase, &dir, &layout, sandbox.as_ref()).await {
                    Ok(result) => Some((phase.exec_name, dir, result)),
                    Err(e) => {
                        tracing::error!("Failed to compile {}: {}", phase.exec_name, e);
                        first_error.set(e);
                        None
                    }
                }
            })
        })
        .collect::<FuturesUnordered<_>>();

    while let Some(joined) = tasks.next().await {
        match joined {
            Ok(Some((exec_name, dir, result))) => {
                tracing::debug!("Compiled {}: succeeded = {}", exec_name, result.succeeded);
                if result.succeeded {
                    output.exec_dirs.insert(exec_name.clone(), dir);
                }
                output.results.insert(exec_name, result);
            }
            Ok(None) => {}
            Err(e) => first_error.set(e.into()),
        }
    }

    // Every task has been joined, so this is the last reference.
    output.error = Arc::into_inner(first_error).and_then(FirstError::into_inner);
    Ok(output)
}

async fn compile_target(
    phase: &CompilePhase,
    dir: &Path,
    layout: &Layout,
    sandbox: &dyn Sandbox,
) -> Result<CompileResult, PipelineError> {
    let global_dir = layout.global(dir);
    write_sources(&phase.sources, &global_dir).await?;

    let captured =
        run_capturing_stderr(sandbox, layout, &phase.compile, &layout.in_rootfs(dir)).await;
    let removed = delete_sources(&phase.sources, &global_dir).await;

    let Captured {
        outcome,
        fault,
        stderr,
    } = captured?;
    removed?;

    Ok(match fault {
        Some(fault) => CompileResult {
            succeeded: false,
            stderr: Some(OmitString::from_message(fault)),
        },
        None => CompileResult {
            succeeded: outcome.exit_code == 0,
            stderr,
        },
    })
}

async fn write_sources(sources: &[SourceFile], dir: &Path) -> Result<(), PipelineError> {
    for source in sources {
        let path = dir.join(&source.name);
        fs::write(&path, &source.content)
            .await
            .map_err(|source| PipelineError::WriteSource { path, source })?;
    }
    Ok(())
}

async fn delete_sources(sources: &[SourceFile], dir: &Path) -> Result<(), PipelineError> {
    for source in sources {
        let path = dir.join(&source.name);
        fs::remove_file(&path)
            .await
            .map_err(|source| PipelineError::RemoveSource { path, source })?;
    }
    Ok(())
}
