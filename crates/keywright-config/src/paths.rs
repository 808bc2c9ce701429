use crate::settings::PathsConfig;
use anyhow::Result;
use directories::{BaseDirs, ProjectDirs};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_file: PathBuf,
    pub state_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub ssh_dir: PathBuf,
    pub ssh_config: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self> {
        let proj = ProjectDirs::from("org", "keywright", "keywright")
            .ok_or_else(|| anyhow::anyhow!("project dirs unavailable"))?;
        let home = BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("home directory unavailable"))?;
        let config_dir = proj.config_dir().to_path_buf();
        let data_dir = proj.data_dir().to_path_buf();
        let log_dir = data_dir.join("logs");
        let config_file = config_dir.join("config.toml");
        let state_dir = data_dir.join("state");
        let backup_dir = home.join("ssh_backup");
        let ssh_dir = home.join(".ssh");
        let ssh_config = ssh_dir.join("config");
        Ok(Self {
            config_dir,
            data_dir,
            log_dir,
            config_file,
            state_dir,
            backup_dir,
            ssh_dir,
            ssh_config,
        })
    }

    /// Rooted layout used when every location lives under one directory.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let ssh_dir = root.join(".ssh");
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            log_dir: root.join("data").join("logs"),
            config_file: root.join("config").join("config.toml"),
            state_dir: root.join("data").join("state"),
            backup_dir: root.join("ssh_backup"),
            ssh_config: ssh_dir.join("config"),
            ssh_dir,
        }
    }

    pub fn with_overrides(mut self, paths: &PathsConfig) -> Self {
        if let Some(dir) = &paths.ssh_dir {
            self.ssh_config = dir.join("config");
            self.ssh_dir = dir.clone();
        }
        if let Some(file) = &paths.ssh_config {
            self.ssh_config = file.clone();
        }
        if let Some(dir) = &paths.state_dir {
            self.state_dir = dir.clone();
        }
        if let Some(dir) = &paths.backup_dir {
            self.backup_dir = dir.clone();
        }
        self
    }

    pub fn project_config_path(base: impl AsRef<Path>) -> PathBuf {
        base.as_ref().join(".keywright.toml")
    }
}
