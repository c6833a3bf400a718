//! Configuration loading and command-line overrides

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mutex_core::{CoordinatorConfig, RequestMerge, TransportConfig};
use serde::{Deserialize, Serialize};

/// Main configuration for the demo cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Number of peers started in this process
    #[serde(default = "default_peers")]
    pub peers: usize,

    /// Simulated network
    #[serde(default)]
    pub network: NetworkConfig,

    /// Behaviour of the demo application
    #[serde(default)]
    pub demo: DemoConfig,

    /// How incoming request numbers are merged
    #[serde(default)]
    pub request_merge: RequestMerge,

    /// Stop after this many seconds (runs until Ctrl+C when unset)
    pub duration_secs: Option<u64>,

    /// Interval between status reports in seconds
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Base transit delay per message in milliseconds (default: 5s)
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Extra random delay in milliseconds, 0 for none
    #[serde(default)]
    pub jitter_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Shortest pause between two request decisions (ms)
    #[serde(default = "default_tick_min_ms")]
    pub tick_min_ms: u64,

    /// Longest pause between two request decisions (ms)
    #[serde(default = "default_tick_max_ms")]
    pub tick_max_ms: u64,

    /// Chance of requesting the critical section per decision
    #[serde(default = "default_request_probability")]
    pub request_probability: f64,

    /// Shortest stay inside the critical section (ms)
    #[serde(default = "default_stay_min_ms")]
    pub stay_min_ms: u64,

    /// Longest stay inside the critical section (ms)
    #[serde(default = "default_stay_max_ms")]
    pub stay_max_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            tick_min_ms: default_tick_min_ms(),
            tick_max_ms: default_tick_max_ms(),
            request_probability: default_request_probability(),
            stay_min_ms: default_stay_min_ms(),
            stay_max_ms: default_stay_max_ms(),
        }
    }
}

fn default_peers() -> usize {
    3
}

fn default_delay_ms() -> u64 {
    5000
}

fn default_status_interval() -> u64 {
    10
}

fn default_tick_min_ms() -> u64 {
    1000
}

fn default_tick_max_ms() -> u64 {
    2000
}

fn default_request_probability() -> f64 {
    0.25
}

fn default_stay_min_ms() -> u64 {
    500
}

fn default_stay_max_ms() -> u64 {
    1000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            peers: default_peers(),
            network: NetworkConfig::default(),
            demo: DemoConfig::default(),
            request_merge: RequestMerge::default(),
            duration_secs: None,
            status_interval_secs: default_status_interval(),
        }
    }
}

/// Values given on the command line; they win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub peers: Option<usize>,
    pub delay_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub duration_secs: Option<u64>,
    pub request_merge: Option<RequestMerge>,
}

impl DaemonConfig {
    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults, which are written to `config_file`
    /// for reference.
    pub fn load(config_file: &Path) -> Result<Self> {
        if config_file.exists() {
            let content = std::fs::read_to_string(config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: DaemonConfig = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", config_file))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            return Ok(config);
        }

        tracing::info!("No config file found at {:?}, using defaults", config_file);
        let config = DaemonConfig::default();

        if let Some(dir) = config_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {:?}", dir))?;
        }
        let content = serde_json::to_string_pretty(&config)?;
        std::fs::write(config_file, content)
            .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
        tracing::info!("Created default config at {:?}", config_file);

        Ok(config)
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(peers) = overrides.peers {
            self.peers = peers;
        }
        if let Some(delay_ms) = overrides.delay_ms {
            self.network.delay_ms = delay_ms;
        }
        if let Some(jitter_ms) = overrides.jitter_ms {
            self.network.jitter_ms = jitter_ms;
        }
        if let Some(duration_secs) = overrides.duration_secs {
            self.duration_secs = Some(duration_secs);
        }
        if let Some(request_merge) = overrides.request_merge {
            self.request_merge = request_merge;
        }
        self
    }

    /// Reject settings the demo cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.peers == 0 {
            bail!("At least one peer is required");
        }
        if self.demo.tick_min_ms > self.demo.tick_max_ms {
            bail!(
                "demo.tick_min_ms ({}) exceeds demo.tick_max_ms ({})",
                self.demo.tick_min_ms,
                self.demo.tick_max_ms
            );
        }
        if self.demo.stay_min_ms > self.demo.stay_max_ms {
            bail!(
                "demo.stay_min_ms ({}) exceeds demo.stay_max_ms ({})",
                self.demo.stay_min_ms,
                self.demo.stay_max_ms
            );
        }
        if !(0.0..=1.0).contains(&self.demo.request_probability) {
            bail!(
                "demo.request_probability must be within 0..=1, got {}",
                self.demo.request_probability
            );
        }
        if self.status_interval_secs == 0 {
            bail!("status_interval_secs must be positive");
        }
        Ok(())
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new(
            Duration::from_millis(self.network.delay_ms),
            Duration::from_millis(self.network.jitter_ms),
        )
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            request_merge: self.request_merge,
        }
    }
}
