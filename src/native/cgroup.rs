use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use crate::{constants::SANDBOX_PIDS_MAX, core::domain::Limits};

const REMOVE_ATTEMPTS: u32 = 50;
const REMOVE_BACKOFF: Duration = Duration::from_millis(10);

/// Makes sure `parent` exists and hands the memory and pids controllers down
/// to its children.
pub fn prepare_parent(parent: &Path) -> io::Result<()> {
    fs::create_dir_all(parent)?;
    fs::write(parent.join("cgroup.subtree_control"), "+memory +pids")
}

/// A cgroup v2 group owned by one sandbox handle.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
    removed: bool,
}

impl Cgroup {
    pub fn create(parent: &Path, name: &str, limits: &Limits) -> io::Result<Self> {
        let path = parent.join(name);
        fs::create_dir(&path)?;
        // Dropping on an early return removes the half-configured group.
        let cgroup = Cgroup {
            path,
            removed: false,
        };

        let memory = limits.memory_bytes.to_string();
        cgroup.write("memory.max", &memory)?;
        cgroup.write("memory.low", &memory)?;
        match cgroup.write("memory.swap.max", "0") {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("Swap accounting is disabled, memory.swap.max not set");
            }
            other => other?,
        }
        cgroup.write("pids.max", &SANDBOX_PIDS_MAX.to_string())?;

        Ok(cgroup)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opened before fork so the child only has to write its pid into it.
    pub fn procs_file(&self) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
    }

    pub fn kill(&self) -> io::Result<()> {
        kill(&self.path)
    }

    /// Kills what is left in the group and removes it. Idempotent.
    ///
    /// A group that is still busy after the kill is retried on the blocking
    /// pool when called from inside the runtime, so async workers never sleep.
    pub fn remove(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        if let Err(e) = self.kill() {
            tracing::warn!("Failed to kill cgroup {}: {}", self.path.display(), e);
        }

        match fs::remove_dir(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::debug!("cgroup {} still busy: {}", self.path.display(), e);
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let path = self.path.clone();
                        runtime.spawn_blocking(move || {
                            if let Err(e) = remove_with_retries(&path) {
                                tracing::error!("Failed to remove cgroup {}: {}", path.display(), e);
                            }
                        });
                    }
                    Err(_) => remove_with_retries(&self.path)?,
                }
            }
        }
        self.removed = true;
        Ok(())
    }

    fn write(&self, file: &str, value: &str) -> io::Result<()> {
        fs::write(self.path.join(file), value)
    }
}

impl Drop for Cgroup {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::error!("Failed to remove cgroup {}: {}", self.path.display(), e);
        }
    }
}

fn remove_with_retries(path: &Path) -> io::Result<()> {
    let mut attempt = 1;
    loop {
        thread::sleep(REMOVE_BACKOFF);
        match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(_) if attempt + 1 < REMOVE_ATTEMPTS => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

pub fn kill(path: &Path) -> io::Result<()> {
    fs::write(path.join("cgroup.kill"), "1")
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryEvents {
    pub oom: u64,
    pub oom_kill: u64,
}

pub fn memory_events(path: &Path) -> io::Result<MemoryEvents> {
    fs::read_to_string(path.join("memory.events")).map(|content| parse_memory_events(&content))
}

fn parse_memory_events(content: &str) -> MemoryEvents {
    let mut events = MemoryEvents::default();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(value) = value.parse() else {
            continue;
        };
        match key {
            "oom" => events.oom = value,
            "oom_kill" => events.oom_kill = value,
            _ => {}
        }
    }
    events
}
