// Engine Configuration
// Directories, pool size, remote dispatch and broker settings

use crate::broker::BrokerEndpoint;
use crate::error::{EngineError, EngineResult};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration shared by the scheduler, background runner and broker client.
///
/// Every field has a default, so a YAML file only needs to name what it
/// changes:
///
/// ```yaml
/// log_dir: /data/run1/log
/// workers: 4
/// remote:
///   enabled: true
///   hosts: [node1, node2]
/// broker:
///   queue: gatk
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory receiving job logs and per-task logs
    pub log_dir: PathBuf,
    /// Scratch directory for generated scripts and pid files
    pub temp_dir: PathBuf,
    /// Number of pool workers (tasks of a stage running at once)
    pub workers: usize,
    /// Remote dispatch over ssh
    pub remote: RemoteConfig,
    /// Host slot broker settings
    pub broker: BrokerConfig,
}

/// Subdirectories of `temp_dir` holding generated scripts
const SCRATCH_SUBDIRS: [&str; 2] = ["executor", "background"];

/// Per-user, per-process scratch directory under the system temp dir
fn default_temp_dir() -> PathBuf {
    let user = std::env::var("USER").unwrap_or_else(|_| nix::unistd::getuid().to_string());
    std::env::temp_dir().join(format!("stage-engine-{}-{}", user, std::process::id()))
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("log"),
            temp_dir: default_temp_dir(),
            workers: 1,
            remote: RemoteConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

/// Remote dispatch of single-process tasks to a host list
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub hosts: Vec<String>,
    /// Shell started on the remote side to read the job script
    pub shell: String,
    /// Program used to reach the hosts, called as `<ssh> -q <host> <command>`
    pub ssh: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hosts: Vec::new(),
            shell: "/bin/bash".to_string(),
            ssh: "ssh".to_string(),
        }
    }
}

impl RemoteConfig {
    /// Remote dispatch only pays off with more than one host to spread over
    pub fn is_active(&self) -> bool {
        self.enabled && self.hosts.len() > 1
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Queue name; brokers with different names are independent
    pub queue: String,
    /// Directory holding the broker and client sockets
    pub socket_dir: PathBuf,
    /// How long a client waits for a grant (unset = until granted)
    pub acquire_timeout_secs: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            socket_dir: dirs::runtime_dir().unwrap_or_else(std::env::temp_dir),
            acquire_timeout_secs: None,
        }
    }
}

impl BrokerConfig {
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint::new(&self.socket_dir, &self.queue)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> EngineResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.workers == 0 {
            return Err(EngineError::Config(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.remote.enabled && self.remote.hosts.is_empty() {
            return Err(EngineError::Config(
                "remote dispatch is enabled but no hosts are listed".to_string(),
            ));
        }
        Ok(())
    }

    /// Consolidated log of a whole job
    pub fn job_log_path(&self, job_name: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", job_name))
    }

    /// Private log of the task at `index` within its stage
    pub fn task_log_path(&self, job_name: &str, index: usize) -> PathBuf {
        self.log_dir.join(format!("{}-{}.log", job_name, index))
    }

    pub fn background_log_path(&self, job_name: &str) -> PathBuf {
        self.log_dir.join(format!("{}.background.log", job_name))
    }

    /// Remove the default scratch directory once nothing is left in it.
    ///
    /// A configured `temp_dir` belongs to the user and is left alone, as is
    /// any directory still holding scripts.
    pub fn clean_temp_dir(&self) {
        if self.temp_dir != default_temp_dir() {
            return;
        }
        let dirs = SCRATCH_SUBDIRS
            .iter()
            .map(|sub| self.temp_dir.join(sub))
            .chain(std::iter::once(self.temp_dir.clone()));
        for dir in dirs {
            if let Err(e) = std::fs::remove_dir(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(dir = %dir.display(), error = %e, "scratch directory kept");
                }
            }
        }
    }
}
