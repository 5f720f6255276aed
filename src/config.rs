use std::{
    io,
    path::{Path, PathBuf},
};

use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::core::layout::{Layout, WorkUser};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{field} must be an absolute path, got {path}")]
    NotAbsolute { field: &'static str, path: PathBuf },
    #[error("{field} {path} is not a directory")]
    MissingDir { field: &'static str, path: PathBuf },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Linux namespaces plus a cgroup v2 group per process.
    #[default]
    Namespace,
    /// Plain host processes; development only.
    Local,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RootfsConfig {
    pub rootfs_path: PathBuf,
    /// Scratch parent as seen inside the sandbox.
    pub work_dir: PathBuf,
    #[serde(default)]
    pub work_user: Option<WorkUser>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Config {
    pub rootfs: RootfsConfig,
    pub data_files_path: PathBuf,
    pub cache_files_path: PathBuf,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub sandbox: SandboxKind,
    #[serde(default = "default_cgroup_parent")]
    pub cgroup_parent: PathBuf,
}

fn default_listen_addr() -> String {
    "127.0.0.1:50051".to_string()
}

fn default_cgroup_parent() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/execution-worker")
}

#[derive(Debug, Parser)]
#[command(version, about = "Compiles, runs and judges submissions")]
pub struct Args {
    #[arg(short, long, default_value = "./config.json")]
    pub config: PathBuf,
    /// Overrides `listen_addr` from the config file.
    #[arg(long)]
    pub listen: Option<String>,
    /// Overrides `sandbox` from the config file.
    #[arg(long, value_enum)]
    pub sandbox: Option<SandboxKind>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply(&mut self, args: &Args) {
        if let Some(listen) = &args.listen {
            self.listen_addr = listen.clone();
        }
        if let Some(sandbox) = args.sandbox {
            self.sandbox = sandbox;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let paths = [
            ("rootfs_path", &self.rootfs.rootfs_path),
            ("work_dir", &self.rootfs.work_dir),
            ("data_files_path", &self.data_files_path),
            ("cache_files_path", &self.cache_files_path),
        ];
        for (field, path) in paths {
            if !path.is_absolute() {
                return Err(ConfigError::NotAbsolute {
                    field,
                    path: path.clone(),
                });
            }
        }

        let dirs = [
            ("rootfs_path", &self.rootfs.rootfs_path),
            ("data_files_path", &self.data_files_path),
            ("cache_files_path", &self.cache_files_path),
        ];
        for (field, path) in dirs {
            if !path.is_dir() {
                return Err(ConfigError::MissingDir {
                    field,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout {
            rootfs: self.rootfs.rootfs_path.clone(),
            work_dir: self.rootfs.work_dir.clone(),
            cache_dir: self.cache_files_path.clone(),
            work_user: self.rootfs.work_user,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, json: &serde_json::Value) -> PathBuf {
        let path = dir.join("config.json");
        std::fs::write(&path, json.to_string()).unwrap();
        path
    }

    fn full_config(dir: &Path) -> serde_json::Value {
        for sub in ["rootfs", "data", "cache"] {
            std::fs::create_dir_all(dir.join(sub)).unwrap();
        }
        serde_json::json!({
            "rootfs": {
                "rootfs_path": dir.join("rootfs"),
                "work_dir": "/w",
                "work_user": {"uid": 1500, "gid": 1500}
            },
            "data_files_path": dir.join("data"),
            "cache_files_path": dir.join("cache"),
        })
    }

    #[test]
    fn test_load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), &full_config(dir.path()));

        let config = Config::load(&path).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:50051");
        assert_eq!(config.sandbox, SandboxKind::Namespace);
        assert_eq!(config.cgroup_parent, default_cgroup_parent());
        assert!(config.validate().is_ok());

        let layout = config.layout();
        assert_eq!(layout.work_dir, PathBuf::from("/w"));
        assert_eq!(layout.work_dir_global(), dir.path().join("rootfs").join("w"));
        assert_eq!(layout.work_user, Some(WorkUser { uid: 1500, gid: 1500 }));
    }

    #[test]
    fn test_args_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut json = full_config(dir.path());
        json["sandbox"] = "namespace".into();
        let path = write_config(dir.path(), &json);
        let args = Args::parse_from([
            "execution-worker",
            "--config",
            path.to_str().unwrap(),
            "--listen",
            "0.0.0.0:7000",
            "--sandbox",
            "local",
        ]);

        let mut config = Config::load(&args.config).unwrap();
        config.apply(&args);

        assert_eq!(config.listen_addr, "0.0.0.0:7000");
        assert_eq!(config.sandbox, SandboxKind::Local);
    }

    #[test]
    fn test_relative_work_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut json = full_config(dir.path());
        json["rootfs"]["work_dir"] = "w".into();
        let path = write_config(dir.path(), &json);

        let result = Config::load(&path).unwrap().validate();

        assert!(matches!(
            result,
            Err(ConfigError::NotAbsolute { field: "work_dir", .. })
        ));
    }

    #[test]
    fn test_missing_data_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let json = full_config(dir.path());
        std::fs::remove_dir(dir.path().join("data")).unwrap();
        let path = write_config(dir.path(), &json);

        let result = Config::load(&path).unwrap().validate();

        assert!(matches!(
            result,
            Err(ConfigError::MissingDir { field: "data_files_path", .. })
        ));
    }

    #[test]
    fn test_unparsable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
