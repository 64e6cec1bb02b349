use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::download::DEFAULT_POOL_SIZE;

pub const ENV_DATA_DIR: &str = "NOVELSHELF_DATA_DIR";
pub const ENV_POOL_SIZE: &str = "NOVELSHELF_POOL_SIZE";
pub const ENV_HOSTS: &str = "NOVELSHELF_HOSTS";
pub const ENV_TIMEOUT_SECS: &str = "NOVELSHELF_TIMEOUT_SECS";

/// Runtime settings. Resolved as defaults, then the YAML file, then
/// environment, then command-line flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_dir: PathBuf,
    pub pool_size: usize,
    pub hosts_file: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("novelshelf-data"),
            pool_size: DEFAULT_POOL_SIZE,
            hosts_file: None,
            request_timeout_secs: 30,
            user_agent: format!("novelshelf/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Values given explicitly on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub pool_size: Option<usize>,
    pub hosts_file: Option<PathBuf>,
}

impl Config {
    pub fn load(file: Option<&Path>, overrides: &ConfigOverrides) -> anyhow::Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).context("deserialize config")
    }

    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(raw) = var(ENV_DATA_DIR).filter(|raw| !raw.trim().is_empty()) {
            self.data_dir = PathBuf::from(raw.trim());
        }
        if let Some(raw) = var(ENV_HOSTS).filter(|raw| !raw.trim().is_empty()) {
            self.hosts_file = Some(PathBuf::from(raw.trim()));
        }
        if let Some(raw) = var(ENV_POOL_SIZE) {
            self.pool_size = parse_number(&raw)
                .with_context(|| format!("invalid {ENV_POOL_SIZE}={raw:?}. expected a number"))?;
        }
        if let Some(raw) = var(ENV_TIMEOUT_SECS) {
            let secs: u64 = parse_number(&raw).with_context(|| {
                format!("invalid {ENV_TIMEOUT_SECS}={raw:?}. expected a number of seconds")
            })?;
            if secs == 0 {
                anyhow::bail!("invalid {ENV_TIMEOUT_SECS}={raw:?}. must be at least 1");
            }
            self.request_timeout_secs = secs;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(dir) = &overrides.data_dir {
            self.data_dir.clone_from(dir);
        }
        if let Some(pool_size) = overrides.pool_size {
            self.pool_size = pool_size;
        }
        if let Some(hosts) = &overrides.hosts_file {
            self.hosts_file = Some(hosts.clone());
        }
    }

    /// Clamps the pool size and rejects values that cannot work.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        self.pool_size = self.pool_size.max(1);
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }
        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent is empty");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

fn parse_number<T>(raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(raw.trim().parse::<T>()?)
}
