/// Native module contains the sandbox implementations, built on
/// namespaces, cgroup v2 and rlimits through syscalls directly.
pub mod cgroup;
pub mod local;
pub mod namespace;
pub mod process;
