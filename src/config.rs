//! TOML configuration parsing and the owned configuration store.
//!
//! The configuration file is externally owned. The core only reads it: once
//! at startup, at every day rollover, and whenever [`ConfigStore::reload`] is
//! called explicitly. Readers always work from an immutable [`Config`]
//! snapshot.

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::models::{TimeSegment, SEGMENT_TIME_FORMAT};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub line: LineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LineConfig {
    pub name: String,
    #[serde(default)]
    pub target: u32,
    #[serde(default)]
    pub segments: Vec<SegmentConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub target: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_device_path")]
    pub path: String,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: default_device_path(),
            idle_timeout_ms: default_idle_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

fn default_device_path() -> String {
    "/dev/ttyACM0".to_string()
}
fn default_idle_timeout_ms() -> u64 {
    1000
}
fn default_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:5000".to_string()
}

impl Config {
    /// A config with only a line name and target; everything else defaulted.
    pub fn for_line(name: &str, target: u32) -> Self {
        Self {
            line: LineConfig {
                name: name.to_string(),
                target,
                segments: Vec::new(),
            },
            storage: StorageConfig::default(),
            device: DeviceConfig::default(),
            watcher: WatcherConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Parsed time segments. A line without configured segments gets one
    /// segment spanning the whole day with the line target.
    pub fn time_segments(&self) -> Vec<TimeSegment> {
        if self.line.segments.is_empty() {
            return vec![TimeSegment {
                start: NaiveTime::default(),
                end: NaiveTime::from_hms_opt(23, 59, 0).unwrap_or_default(),
                target: self.line.target,
            }];
        }
        self.line
            .segments
            .iter()
            .filter_map(|s| s.to_segment().ok())
            .collect()
    }
}

impl SegmentConfig {
    fn to_segment(&self) -> Result<TimeSegment> {
        Ok(TimeSegment {
            start: parse_time_of_day(&self.start)?,
            end: parse_time_of_day(&self.end)?,
            target: self.target,
        })
    }
}

fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), SEGMENT_TIME_FORMAT)
        .with_context(|| format!("invalid time of day '{}', expected HH:MM", s))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    config.line.name = config.line.name.trim().to_string();
    if config.line.name.is_empty() {
        bail!("line.name must not be empty");
    }
    if config.line.name.contains(['/', '\\']) {
        bail!("line.name must not contain path separators");
    }

    for (idx, seg) in config.line.segments.iter().enumerate() {
        seg.to_segment()
            .with_context(|| format!("line.segments[{}] is invalid", idx))?;
    }

    if config.watcher.poll_interval_ms == 0 {
        bail!("watcher.poll_interval_ms must be > 0");
    }
    if config.device.idle_timeout_ms == 0 {
        bail!("device.idle_timeout_ms must be > 0");
    }

    Ok(config)
}

/// Single owner of the active configuration.
///
/// Hands out immutable snapshots; [`reload`](ConfigStore::reload) swaps in a
/// freshly loaded one. A failed reload leaves the previous snapshot active.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    pub fn open(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// A store with no backing file; `reload` keeps the given config.
    pub fn fixed(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reload(&self) -> Result<Arc<Config>> {
        let Some(path) = &self.path else {
            return Ok(self.snapshot());
        };
        let fresh = Arc::new(load_config(path)?);
        match self.current.write() {
            Ok(mut guard) => *guard = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }
        tracing::info!(line = %fresh.line.name, target = fresh.line.target, "configuration reloaded");
        Ok(fresh)
    }
}
