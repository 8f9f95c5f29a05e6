use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_path")]
    pub path: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_url")]
    pub url: String,
    #[serde(default = "default_sink_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Unset keeps every identity for the life of the process.
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default = "default_purge_every")]
    pub purge_every: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub csv_logging: bool,
    #[serde(default = "default_csv_path")]
    pub csv_log_path: String,
}

fn default_stream_path() -> String { "/raw-tips".to_string() }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 90 }
fn default_sink_url() -> String { "http://72.60.89.248:3001/bet".to_string() }
fn default_sink_timeout() -> u64 { 15 }
fn default_initial_delay() -> u64 { 500 }
fn default_max_delay() -> u64 { 30_000 }
fn default_purge_every() -> u64 { 1_000 }
fn default_csv_path() -> String { "forwarded.csv".to_string() }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            path: default_stream_path(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: default_sink_url(),
            timeout_secs: default_sink_timeout(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: None,
            purge_every: default_purge_every(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            csv_logging: false,
            csv_log_path: default_csv_path(),
        }
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl DedupConfig {
    pub fn window(&self) -> Option<Duration> {
        self.window_secs.map(Duration::from_secs)
    }
}

/// Secrets for the upstream tip stream.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub api_key: String,
    pub base_url: String,
    pub sink_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    key: String,
    base_url: String,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {}", path))
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

impl EnvConfig {
    /// Reads `TIPS_API_KEY` and `TIPS_BASE_URL`, falling back to
    /// `credentials_path` when either is unset.
    pub fn load(credentials_path: &str) -> Result<Self> {
        dotenv::dotenv().ok();

        let sink_url = std::env::var("BET_API_URL").ok();

        match (std::env::var("TIPS_API_KEY"), std::env::var("TIPS_BASE_URL")) {
            (Ok(api_key), Ok(base_url)) => Ok(Self {
                api_key,
                base_url,
                sink_url,
            }),
            _ => {
                let contents = fs::read_to_string(credentials_path).with_context(|| {
                    format!(
                        "TIPS_API_KEY/TIPS_BASE_URL not set and credentials file {} unreadable",
                        credentials_path
                    )
                })?;
                let creds: CredentialsFile = serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse credentials file: {}", credentials_path))?;

                Ok(Self {
                    api_key: creds.key,
                    base_url: creds.base_url,
                    sink_url,
                })
            }
        }
    }
}
