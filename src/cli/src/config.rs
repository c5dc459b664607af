use log::{debug, warn};
use megaminx_ll::{EngineConfig, Host, SolverConfig};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// The contents of `config.toml`. Every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CliConfig {
    /// Where pruning tables are stored; defaults to the user cache directory.
    pub data_directory: Option<PathBuf>,
    /// Memory the engine may assume is free for building tables.
    pub memory_budget_bytes: Option<u64>,
    /// Disk space pruning table files may occupy in total.
    pub disk_budget_bytes: Option<u64>,
    pub engine: EngineConfig,
    pub solver: SolverConfig,
}

impl CliConfig {
    /// Read the config at `path`, or the default location when absent. A
    /// missing default config is not an error.
    pub fn load(path: Option<&Path>) -> color_eyre::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_owned(), true),
            None => match dirs::config_dir() {
                Some(mut path) => {
                    path.push("megaminx-ll");
                    path.push("config.toml");
                    (path, false)
                }
                None => return Ok(Self::default()),
            },
        };

        match fs::read_to_string(&path) {
            Ok(text) => {
                debug!("Reading configuration from {}", path.display());
                Ok(toml::from_str(&text)?)
            }
            Err(e) if !required && e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn data_directory(&self) -> color_eyre::Result<PathBuf> {
        if let Some(data_directory) = &self.data_directory {
            return Ok(data_directory.clone());
        }
        let mut cache = dirs::cache_dir()
            .ok_or_else(|| color_eyre::eyre::eyre!("No cache directory; set `data_directory`"))?;
        cache.push("megaminx-ll-tables");
        Ok(cache)
    }
}

/// Capabilities backed by the configured budgets.
pub struct CliHost {
    data_directory: PathBuf,
    memory_budget: Option<u64>,
    disk_budget: Option<u64>,
}

impl CliHost {
    pub fn new(config: &CliConfig) -> color_eyre::Result<Self> {
        Ok(Self {
            data_directory: config.data_directory()?,
            memory_budget: config.memory_budget_bytes,
            disk_budget: config.disk_budget_bytes,
        })
    }

    fn used_disk_space(&self) -> io::Result<u64> {
        let mut used = 0;
        for entry in fs::read_dir(&self.data_directory)? {
            used += entry?.metadata()?.len();
        }
        Ok(used)
    }
}

impl Host for CliHost {
    fn data_directory(&self) -> PathBuf {
        self.data_directory.clone()
    }

    fn available_disk_space(&self) -> Option<u64> {
        let budget = self.disk_budget?;
        match self.used_disk_space() {
            Ok(used) => Some(budget.saturating_sub(used)),
            Err(e) => {
                warn!("Failed to measure the data directory: {e}");
                Some(budget)
            }
        }
    }

    fn available_memory(&self) -> Option<u64> {
        self.memory_budget
    }
}
