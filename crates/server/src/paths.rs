//! Where the background keeps its files.
//!
//! One data directory holds `config.json` (the persisted user config) and a
//! `logs/` directory. It comes from `--data-dir` / `CHATBRIDGE_DATA_DIR`, or
//! `~/.chatbridge` when neither is set.

use std::io;
use std::path::{Path, PathBuf};

const DEFAULT_DIR_NAME: &str = ".chatbridge";
const CONFIG_FILE: &str = "config.json";
const LOG_DIR: &str = "logs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Use `explicit` when given, else `~/.chatbridge`.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match explicit {
            Some(dir) => Ok(Self::new(dir)),
            None => {
                let home = dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("HOME directory not found"))?;
                Ok(Self::new(home.join(DEFAULT_DIR_NAME)))
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.log_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins() {
        let paths = DataPaths::resolve(Some(Path::new("/srv/chatbridge"))).unwrap();
        assert_eq!(paths.root(), Path::new("/srv/chatbridge"));
        assert_eq!(paths.config_path(), Path::new("/srv/chatbridge/config.json"));
        assert_eq!(paths.log_dir(), Path::new("/srv/chatbridge/logs"));
    }

    #[test]
    fn ensure_dirs_creates_the_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(tmp.path().join("nested"));
        paths.ensure_dirs().unwrap();
        assert!(paths.log_dir().is_dir());
        // Idempotent
        paths.ensure_dirs().unwrap();
    }
}
