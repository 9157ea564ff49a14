// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, bail};
use log::{Level, debug, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/datadog-agent/supervisor.yaml";
const DEFAULT_AGENT_DIR: &str = "/opt/datadog-agent";
const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Convert a seconds value from YAML into a `Duration`. Zero, negative and
/// non-finite values all mean "disabled".
pub(crate) fn secs(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::from_secs_f64(v)
    } else {
        Duration::ZERO
    }
}

/// CPU and memory ceiling for one service. Zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Quota {
    /// Fraction of one CPU, e.g. `0.5` for half a core.
    pub cpu: f64,
    /// Hard memory ceiling in bytes.
    pub memory: u64,
}

impl Quota {
    pub fn is_empty(&self) -> bool {
        self.cpu <= 0.0 && self.memory == 0
    }
}

/// OS resource limits the quota layer does not cover. Applied by wrapping the
/// program in a shell that calls `ulimit` before exec'ing it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Ulimits {
    pub nofile: Option<u64>,
    pub nproc: Option<u64>,
    pub core: Option<u64>,
}

impl Ulimits {
    pub fn is_empty(&self) -> bool {
        self.nofile.is_none() && self.nproc.is_none() && self.core.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub description: Option<String>,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    pub environment_file: Option<String>,
    pub inherit_env: bool,
    /// Redirect target; when absent the stream is captured in memory.
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub ulimits: Ulimits,
    pub quota: Quota,
    pub auto_start: bool,
    /// Number of consecutive quick exits tolerated; 0 never gives up.
    pub quick_exit_limit: u32,
    /// Seconds a run must last to not count as a quick exit; 0 disables.
    pub min_live_time: f64,
    pub kill_wait: f64,
    pub final_wait: f64,
    pub restart_delay: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            description: None,
            program: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            environment_file: None,
            inherit_env: false,
            stdout: None,
            stderr: None,
            user: None,
            group: None,
            ulimits: Ulimits::default(),
            quota: Quota::default(),
            auto_start: true,
            quick_exit_limit: 5,
            min_live_time: 0.0,
            kill_wait: 10.0,
            final_wait: 5.0,
            restart_delay: 1.0,
        }
    }
}

impl ServiceConfig {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn min_live_time(&self) -> Duration {
        secs(self.min_live_time)
    }

    pub fn kill_wait(&self) -> Duration {
        secs(self.kill_wait)
    }

    pub fn final_wait(&self) -> Duration {
        secs(self.final_wait)
    }

    pub fn restart_delay(&self) -> Duration {
        secs(self.restart_delay)
    }

    /// Basename of the program, used to recognise the service in the process
    /// table. Placeholders are left as-is; only the last path segment matters.
    pub fn program_name(&self) -> &str {
        self.program
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.program)
    }

    pub fn validate(&self, name: &str) -> crate::errors::Result<()> {
        if self.program.trim().is_empty() {
            return Err(crate::errors::Error::Config(format!(
                "service {name}: program is required"
            )));
        }
        if name.is_empty() || name.contains('/') || name.contains('.') {
            return Err(crate::errors::Error::Config(format!(
                "invalid service name {name:?}: must be non-empty without '/' or '.'"
            )));
        }
        if !self.quota.cpu.is_finite() || self.quota.cpu < 0.0 {
            return Err(crate::errors::Error::Config(format!(
                "service {name}: quota.cpu must be a non-negative number"
            )));
        }
        Ok(())
    }
}

/// Directories substituted into `${...}` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Directories {
    pub agent_dir: PathBuf,
    pub run_dir: PathBuf,
    pub conf_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Directories {
    /// All rooted at `agent_dir`, the layout used by tests and sandboxes.
    pub fn under(agent_dir: &Path) -> Self {
        Self {
            agent_dir: agent_dir.to_path_buf(),
            run_dir: agent_dir.join("run"),
            conf_dir: agent_dir.join("etc"),
            bin_dir: agent_dir.join("bin"),
            log_dir: agent_dir.join("logs"),
        }
    }

    pub fn placeholders(&self) -> Vec<(&'static str, String)> {
        vec![
            ("agent_dir", self.agent_dir.display().to_string()),
            ("run_dir", self.run_dir.display().to_string()),
            ("conf_dir", self.conf_dir.display().to_string()),
            ("bin_dir", self.bin_dir.display().to_string()),
            ("log_dir", self.log_dir.display().to_string()),
        ]
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the supervisor's own pid and socket files.
    pub name: String,
    pub agent_dir: PathBuf,
    pub run_dir: Option<PathBuf>,
    pub conf_dir: Option<PathBuf>,
    pub bin_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub services: BTreeMap<String, ServiceConfig>,
    /// Optional directory of `<service>.yaml` files merged into `services`.
    pub services_dir: Option<PathBuf>,
    pub cleanup_dangling: bool,
    /// Guard loop tick, seconds.
    pub poll_interval: f64,
    pub cgroup_root: PathBuf,
    /// Timeout for a peer status query, seconds.
    pub status_timeout: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "supervisor".to_string(),
            agent_dir: PathBuf::from(DEFAULT_AGENT_DIR),
            run_dir: None,
            conf_dir: None,
            bin_dir: None,
            log_dir: None,
            log_level: "info".to_string(),
            services: BTreeMap::new(),
            services_dir: None,
            cleanup_dangling: false,
            poll_interval: 1.0,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            status_timeout: 1.0,
        }
    }
}

impl Config {
    pub fn directories(&self) -> Directories {
        let base = Directories::under(&self.agent_dir);
        Directories {
            run_dir: self.run_dir.clone().unwrap_or(base.run_dir),
            conf_dir: self
                .conf_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("/etc/datadog-agent")),
            bin_dir: self.bin_dir.clone().unwrap_or(base.bin_dir),
            log_dir: self
                .log_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("/var/log/datadog")),
            agent_dir: base.agent_dir,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        let d = secs(self.poll_interval);
        if d.is_zero() {
            Duration::from_secs(1)
        } else {
            d
        }
    }

    pub fn status_timeout(&self) -> Duration {
        secs(self.status_timeout)
    }

    pub fn log_level(&self) -> Level {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => Level::Trace,
            "debug" => Level::Debug,
            "warn" | "warning" => Level::Warn,
            "error" | "critical" => Level::Error,
            "info" => Level::Info,
            other => {
                warn!("unknown log_level {other:?}, using info");
                Level::Info
            }
        }
    }
}

pub fn config_path() -> PathBuf {
    std::env::var("DD_SUPERVISOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load the top-level config file, merge `services_dir` and validate every
/// service. Invalid services fail the load: the service set is fixed for the
/// supervisor's lifetime, so a typo should be caught at startup.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut config: Config =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;

    if let Some(dir) = config.services_dir.clone() {
        for (name, svc) in load_configs(&dir)? {
            if config.services.contains_key(&name) {
                warn!(
                    "service {name} from {} shadowed by {}",
                    dir.display(),
                    path.display()
                );
                continue;
            }
            config.services.insert(name, svc);
        }
    }

    for (name, svc) in &config.services {
        if let Err(e) = svc.validate(name) {
            bail!("{}: {e}", path.display());
        }
    }
    Ok(config)
}

/// Scan a directory for `*.yaml` files and parse each into a ServiceConfig.
/// The service name is derived from the filename (without extension).
/// Files that fail to parse are logged and skipped.
pub fn load_configs(dir: &Path) -> Result<Vec<(String, ServiceConfig)>> {
    let mut configs = Vec::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read services directory: {}", dir.display()))?;

    let mut yaml_files: Vec<_> = entries
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("skipping unreadable entry in {}: {e}", dir.display());
                None
            }
        })
        .filter(|e| {
            let is_yaml = e
                .path()
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if !is_yaml {
                debug!("skipping non-YAML file: {}", e.path().display());
            }
            is_yaml
        })
        .collect();

    yaml_files.sort_by_key(|e| e.file_name());

    for entry in yaml_files {
        let path = entry.path();
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            warn!("skipping {}: file name is not valid UTF-8", path.display());
            continue;
        };

        match parse_service(&path) {
            Ok(config) => configs.push((name.to_string(), config)),
            Err(e) => warn!("skipping {}: {e:#}", path.display()),
        }
    }

    Ok(configs)
}

fn parse_service(path: &Path) -> Result<ServiceConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: ServiceConfig =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}
