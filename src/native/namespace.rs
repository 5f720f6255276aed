use std::{
    ffi::CString,
    io,
    os::{
        fd::{AsRawFd, RawFd},
        unix::{ffi::OsStrExt, process::CommandExt},
    },
    path::{Path, PathBuf},
    sync::Arc,
};

use nix::{
    errno::Errno,
    mount::{MsFlags, mount},
    sched::{CloneFlags, unshare},
    sys::resource::{Resource, setrlimit},
    unistd::{Gid, Pid, Uid, chdir, chroot, setgid, setgroups, setuid},
};

use crate::{
    constants::TOKEN_LEN,
    core::{
        artifact::gen_token,
        domain::Phase,
        layout::WorkUser,
        traits::sandbox::{ProcessSpec, Sandbox, SandboxError, SandboxHandle, Started, Terminate},
    },
    native::{
        cgroup::{self, Cgroup},
        process::{self, ReapSlot},
    },
};

/// Linux sandbox: one cgroup v2 group per handle plus fresh PID, mount, IPC,
/// UTS and network namespaces around a chroot into the configured rootfs.
#[derive(Debug)]
pub struct NamespaceSandbox {
    rootfs: PathBuf,
    cgroup_parent: PathBuf,
    work_user: Option<WorkUser>,
}

impl NamespaceSandbox {
    pub fn new(
        rootfs: impl AsRef<Path>,
        cgroup_parent: impl AsRef<Path>,
        work_user: Option<WorkUser>,
    ) -> io::Result<Self> {
        cgroup::prepare_parent(cgroup_parent.as_ref())?;
        Ok(NamespaceSandbox {
            rootfs: rootfs.as_ref().into(),
            cgroup_parent: cgroup_parent.as_ref().into(),
            work_user,
        })
    }
}

#[async_trait::async_trait]
impl Sandbox for NamespaceSandbox {
    #[tracing::instrument(skip(self, phase), fields(exec = %phase.exec))]
    async fn prepare(
        &self,
        phase: &Phase,
        read_only_root: bool,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let id = gen_token(TOKEN_LEN);
        let cgroup = Cgroup::create(&self.cgroup_parent, &id, &phase.limits).map_err(|source| {
            SandboxError::Create {
                id: id.clone(),
                source,
            }
        })?;
        tracing::debug!("Created cgroup {}", cgroup.path().display());

        Ok(Box::new(NamespaceHandle {
            id,
            cgroup,
            rootfs: self.rootfs.clone(),
            read_only_root,
            stack_bytes: phase.limits.stack_bytes(),
            work_user: self.work_user,
        }))
    }
}

#[derive(Debug)]
pub struct NamespaceHandle {
    id: String,
    cgroup: Cgroup,
    rootfs: PathBuf,
    read_only_root: bool,
    stack_bytes: u64,
    work_user: Option<WorkUser>,
}

impl SandboxHandle for NamespaceHandle {
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
        let procs = self.cgroup.procs_file().map_err(spawn_err)?;
        let confinement = Confinement {
            procs_fd: procs.as_raw_fd(),
            rootfs: c_path(&self.rootfs).map_err(spawn_err)?,
            cwd: c_path(&spec.cwd).map_err(spawn_err)?,
            read_only_root: self.read_only_root,
            stack_bytes: self.stack_bytes,
            work_user: self.work_user,
        };
        unsafe {
            command.pre_exec(move || confinement.enter());
        }

        let child = process::spawn(command).map_err(spawn_err)?;
        drop(procs);
        tracing::debug!("Started {} as pid {} in sandbox {}", program, child.pid, self.id);

        let events_path = self.cgroup.path().to_path_buf();
        let oom = process::watch_memory(move || {
            cgroup::memory_events(&events_path)
                .map(|events| events.oom > 0 || events.oom_kill > 0)
                .unwrap_or(false)
        });

        let events_path = self.cgroup.path().to_path_buf();
        let wait = process::wait(&child, move |outcome| {
            if let Ok(events) = cgroup::memory_events(&events_path) {
                outcome.oom_killed = events.oom_kill > 0;
            }
        });

        Ok(Started {
            terminator: Arc::new(CgroupKiller {
                cgroup: self.cgroup.path().to_path_buf(),
                pid: child.pid,
                slot: child.slot.clone(),
            }),
            oom,
            wait,
        })
    }

    fn destroy(&mut self) -> Result<(), SandboxError> {
        self.cgroup.remove().map_err(|source| SandboxError::Destroy {
            id: self.id.clone(),
            source,
        })
    }
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Everything the child does between fork and exec. Built beforehand so
/// nothing is allocated after fork.
struct Confinement {
    procs_fd: RawFd,
    rootfs: CString,
    cwd: CString,
    read_only_root: bool,
    stack_bytes: u64,
    work_user: Option<WorkUser>,
}

impl Confinement {
    fn enter(&self) -> io::Result<()> {
        let pid = b"0";
        if unsafe { libc::write(self.procs_fd, pid.as_ptr().cast(), pid.len()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        unshare(
            CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWUTS
                | CloneFlags::CLONE_NEWNET,
        )?;
        // Only children enter the new PID namespace: from here on this is its init.
        process::fork_supervised()?;

        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )?;
        mount(
            Some(self.rootfs.as_c_str()),
            self.rootfs.as_c_str(),
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?;
        if self.read_only_root {
            mount(
                None::<&str>,
                self.rootfs.as_c_str(),
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )?;
        }
        chroot(self.rootfs.as_c_str())?;
        mount_proc()?;
        chdir(self.cwd.as_c_str())?;

        setrlimit(Resource::RLIMIT_STACK, self.stack_bytes, self.stack_bytes)?;

        if let Some(user) = self.work_user {
            setgroups(&[Gid::from_raw(user.gid)])?;
            setgid(Gid::from_raw(user.gid))?;
            setuid(Uid::from_raw(user.uid))?;
        }

        if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Fresh procfs for the new PID namespace; skipped when the rootfs has no `/proc`.
fn mount_proc() -> io::Result<()> {
    match mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    ) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Kills every process of the sandbox through `cgroup.kill`.
#[derive(Debug)]
struct CgroupKiller {
    cgroup: PathBuf,
    pid: Pid,
    slot: Arc<ReapSlot>,
}

impl Terminate for CgroupKiller {
    fn terminate(&self) -> io::Result<()> {
        let reaped = self.slot.lock();
        if *reaped {
            return Ok(());
        }
        if let Err(e) = cgroup::kill(&self.cgroup) {
            tracing::warn!(
                "cgroup.kill failed for {}, killing process group: {}",
                self.cgroup.display(),
                e
            );
            return process::kill_group(self.pid);
        }
        Ok(())
    }
}
