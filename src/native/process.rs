use std::{
    fs::File,
    io,
    os::unix::process::CommandExt,
    process::{Command, Stdio},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::{
        signal::{Signal, kill, killpg},
        wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid},
    },
    unistd::{ForkResult, Pid, fork, getpid},
};
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    constants::DEFAULT_ENV,
    core::{
        domain::ResourceUsage,
        traits::sandbox::{ProcessOutcome, ProcessSpec, Terminate},
    },
};

const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(10);
const FALLBACK_MAX_FD: libc::c_int = 4096;

/// Set once the process has been reaped. Signals are only sent while holding
/// the lock with the flag unset, so a recycled pid is never hit.
#[derive(Debug, Default)]
pub struct ReapSlot(Mutex<bool>);

impl ReapSlot {
    pub fn lock(&self) -> MutexGuard<'_, bool> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
pub struct Child {
    pub pid: Pid,
    pub slot: Arc<ReapSlot>,
}

/// Command for `spec` with the fixed environment, its own process group and
/// the stdio bindings moved out of `spec`.
pub fn build_command(spec: &mut ProcessSpec) -> io::Result<Command> {
    let (program, args) = spec
        .args
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(DEFAULT_ENV.iter().copied())
        .process_group(0)
        .stdin(stdio(spec.stdin.take()))
        .stdout(stdio(spec.stdout.take()))
        .stderr(stdio(spec.stderr.take()));
    Ok(command)
}

fn stdio(file: Option<File>) -> Stdio {
    file.map(Stdio::from).unwrap_or_else(Stdio::null)
}

pub fn spawn(mut command: Command) -> io::Result<Child> {
    let child = command.spawn()?;
    Ok(Child {
        pid: Pid::from_raw(child.id() as i32),
        slot: Arc::default(),
    })
}

/// Reaps `child` on a blocking thread. `after_exit` runs once the process is gone.
pub fn wait(
    child: &Child,
    after_exit: impl FnOnce(&mut ProcessOutcome) + Send + 'static,
) -> JoinHandle<io::Result<ProcessOutcome>> {
    let pid = child.pid;
    let slot = child.slot.clone();

    tokio::task::spawn_blocking(move || {
        let mut outcome = reap(pid, &slot)?;
        after_exit(&mut outcome);
        Ok(outcome)
    })
}

fn reap(pid: Pid, slot: &ReapSlot) -> io::Result<ProcessOutcome> {
    loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let mut reaped = slot.lock();
    // The leader is still a zombie here, so its group id is not reusable yet.
    let _ = killpg(pid, Signal::SIGKILL);

    let mut status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut rusage) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    *reaped = true;
    drop(reaped);

    let (exit_code, signal) = if libc::WIFEXITED(status) {
        (libc::WEXITSTATUS(status), None)
    } else if libc::WIFSIGNALED(status) {
        (-1, Some(libc::WTERMSIG(status)))
    } else {
        (-1, None)
    };

    Ok(ProcessOutcome {
        exit_code,
        signal,
        usage: ResourceUsage {
            user_time: timeval(rusage.ru_utime),
            sys_time: timeval(rusage.ru_stime),
            max_rss_kb: rusage.ru_maxrss.max(0) as u64,
        },
        oom_killed: false,
    })
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Forks from inside `pre_exec`. The child returns and goes on to exec; the
/// parent stays behind as a plain waiter that mirrors the child's exit status,
/// so waiting on the spawned pid still observes the real outcome and rusage.
///
/// Only async-signal-safe calls are made here.
pub fn fork_supervised() -> io::Result<()> {
    match unsafe { fork() }? {
        ForkResult::Child => Ok(()),
        ForkResult::Parent { child } => supervise(child),
    }
}

fn supervise(child: Pid) -> ! {
    // The exec status pipe of the spawner must only be held by the child,
    // otherwise spawning blocks until the child exits.
    close_inherited_fds();

    let status = loop {
        match waitpid(child, None) {
            Ok(status) => break status,
            Err(Errno::EINTR) => continue,
            Err(_) => unsafe { libc::_exit(127) },
        }
    };

    match status {
        WaitStatus::Exited(_, code) => unsafe { libc::_exit(code) },
        WaitStatus::Signaled(_, signal, _) => {
            unsafe { libc::signal(signal as libc::c_int, libc::SIG_DFL) };
            let _ = kill(getpid(), signal);
            unsafe { libc::_exit(128 + signal as libc::c_int) }
        }
        _ => unsafe { libc::_exit(127) },
    }
}

fn close_inherited_fds() {
    let ret = unsafe { libc::syscall(libc::SYS_close_range, 3, libc::c_uint::MAX, 0) };
    if ret < 0 {
        for fd in 3..FALLBACK_MAX_FD {
            unsafe { libc::close(fd) };
        }
    }
}

pub fn kill_group(pid: Pid) -> io::Result<()> {
    match killpg(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Kills the whole process group of a child until it is reaped.
#[derive(Debug)]
pub struct GroupKiller {
    pid: Pid,
    slot: Arc<ReapSlot>,
}

impl GroupKiller {
    pub fn new(child: &Child) -> Self {
        GroupKiller {
            pid: child.pid,
            slot: child.slot.clone(),
        }
    }
}

impl Terminate for GroupKiller {
    fn terminate(&self) -> io::Result<()> {
        let reaped = self.slot.lock();
        if *reaped {
            return Ok(());
        }
        kill_group(self.pid)
    }
}

/// Polls `exceeded` until it reports true or the receiver is dropped.
pub fn watch_memory<F>(mut exceeded: F) -> oneshot::Receiver<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    let (mut tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MEMORY_POLL_INTERVAL);
        loop {
            let fired = tokio::select! {
                _ = tx.closed() => return,
                _ = ticker.tick() => exceeded(),
            };
            if fired {
                let _ = tx.send(());
                return;
            }
        }
    });

    rx
}
