use std::{
    fs,
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use nix::{
    sys::resource::{Resource, setrlimit},
    unistd::Pid,
};

use crate::{
    constants::TOKEN_LEN,
    core::{
        artifact::gen_token,
        domain::Phase,
        layout::strip_root,
        traits::sandbox::{ProcessSpec, Sandbox, SandboxError, SandboxHandle, Started},
    },
    native::process::{self, GroupKiller},
};

/// Runs processes directly on the host, with in-sandbox paths resolved
/// against `root`. Only the stack and memory ceilings are enforced.
#[derive(Debug)]
pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    pub fn new(root: impl AsRef<Path>) -> Self {
        LocalSandbox {
            root: root.as_ref().into(),
        }
    }
}

#[async_trait::async_trait]
impl Sandbox for LocalSandbox {
    async fn prepare(
        &self,
        phase: &Phase,
        _read_only_root: bool,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        Ok(Box::new(LocalHandle {
            id: gen_token(TOKEN_LEN),
            root: self.root.clone(),
            memory_bytes: phase.limits.memory_bytes,
            stack_bytes: phase.limits.stack_bytes(),
        }))
    }
}

#[derive(Debug)]
pub struct LocalHandle {
    id: String,
    root: PathBuf,
    memory_bytes: u64,
    stack_bytes: u64,
}

impl SandboxHandle for LocalHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn spawn(&self, mut spec: ProcessSpec) -> Result<Started, SandboxError> {
        let program = spec.args.first().cloned().unwrap_or_default();
        let spawn_err = |source| SandboxError::Spawn {
            id: self.id.clone(),
            program: program.clone(),
            source,
        };

        let mut command = process::build_command(&mut spec).map_err(spawn_err)?;
        command.current_dir(self.root.join(strip_root(&spec.cwd)));
        let stack_bytes = self.stack_bytes;
        unsafe {
            command.pre_exec(move || {
                setrlimit(Resource::RLIMIT_STACK, stack_bytes, stack_bytes)?;
                Ok(())
            });
        }

        let child = process::spawn(command).map_err(spawn_err)?;
        tracing::debug!("Started {} as pid {} in sandbox {}", program, child.pid, self.id);

        let pid = child.pid;
        let limit_kb = self.memory_bytes / 1024;
        let oom = process::watch_memory(move || {
            resident_kb(pid).is_some_and(|rss| rss > limit_kb)
        });
        let wait = process::wait(&child, |_| {});

        Ok(Started {
            terminator: Arc::new(GroupKiller::new(&child)),
            oom,
            wait,
        })
    }

    fn destroy(&mut self) -> Result<(), SandboxError> {
        Ok(())
    }
}

/// `VmRSS` of a live process, in KiB.
fn resident_kb(pid: Pid) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::Limits;

    fn phase(memory_bytes: u64) -> Phase {
        Phase {
            exec: "sh".to_string(),
            args: vec!["sh".to_string()],
            limits: Limits {
                time_ms: 1000,
                memory_bytes,
                stack_bytes: Some(8 << 20),
            },
        }
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tsh\nVmPeak:\t  2412 kB\nVmRSS:\t   1024 kB\nThreads:\t1\n";

        assert_eq!(parse_vm_rss(status), Some(1024));
        assert_eq!(parse_vm_rss("Name:\tzombie\n"), None);
    }

    #[tokio::test]
    async fn test_spawn_resolves_cwd_against_root() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("work")).unwrap();
        let out_path = root.path().join("out");
        let sandbox = LocalSandbox::new(root.path());

        let handle = sandbox.prepare(&phase(64 << 20), true).await.unwrap();
        let started = handle
            .spawn(ProcessSpec {
                args: vec!["sh".to_string(), "-c".to_string(), "pwd".to_string()],
                cwd: PathBuf::from("/work"),
                stdin: None,
                stdout: Some(std::fs::File::create(&out_path).unwrap()),
                stderr: None,
            })
            .unwrap();
        let outcome = started.wait.await.unwrap().unwrap();

        assert_eq!(outcome.exit_code, 0);
        let printed = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(
            Path::new(printed.trim()).canonicalize().unwrap(),
            root.path().join("work").canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_memory_ceiling_notifies() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new(root.path());

        let handle = sandbox.prepare(&phase(1024), false).await.unwrap();
        let started = handle
            .spawn(ProcessSpec {
                args: vec!["sleep".to_string(), "5".to_string()],
                cwd: PathBuf::from("/"),
                stdin: None,
                stdout: None,
                stderr: None,
            })
            .unwrap();

        assert!(started.oom.await.is_ok());
        started.terminator.terminate().unwrap();
        let outcome = started.wait.await.unwrap().unwrap();
        assert_eq!(outcome.signal, Some(libc::SIGKILL));
    }
}
