// src/config.rs

//! Manages daemon configuration: loading, validation, and defaults.

use crate::core::scheduler::parse_crontab;
use crate::core::scheduler::timeparse::parse_time_string;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;

/// Configuration for the mutual-TLS listener. All three paths are required
/// at runtime: the API refuses to start without a CA to verify clients
/// against.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    #[serde(default = "default_ca_path")]
    pub ca_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            ca_path: default_ca_path(),
        }
    }
}

fn default_cert_path() -> String {
    "ace.crt".to_string()
}
fn default_key_path() -> String {
    "ace.key".to_string()
}
fn default_ca_path() -> String {
    "ca.crt".to_string()
}

/// Configuration for the auto-repair daemon, which polls the Spock
/// exception log and dispatches targeted repairs.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AutoRepairConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub dbname: String,
    /// How often the exception log is scanned for PENDING entries.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    /// How often the exception status tables are promoted from the log.
    #[serde(default = "default_status_update_interval")]
    pub status_update_interval: String,
}

fn default_poll_interval() -> String {
    "30s".to_string()
}
fn default_status_update_interval() -> String {
    "30s".to_string()
}

/// A named table-diff job that schedule entries can reference.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScheduleJob {
    pub name: String,
    pub cluster_name: String,
    pub table_name: String,
    #[serde(default)]
    pub dbname: Option<String>,
    #[serde(default)]
    pub block_rows: Option<u64>,
    #[serde(default)]
    pub max_cpu_ratio: Option<f64>,
    #[serde(default)]
    pub batch_size: Option<u64>,
    #[serde(default)]
    pub nodes: Option<String>,
}

/// When and whether a job fires. Exactly one of `crontab_schedule` or
/// `run_frequency` must be present.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScheduleEntry {
    pub job_name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub crontab_schedule: Option<String>,
    /// Interval string such as "1h 30m" or "45s".
    #[serde(default)]
    pub run_frequency: Option<String>,
}

/// Recurring-diff schedule: job definitions plus their triggers.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub jobs: Vec<ScheduleJob>,
    #[serde(default)]
    pub entries: Vec<ScheduleEntry>,
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_cluster_dir")]
    cluster_dir: String,
    #[serde(default = "default_diff_dir")]
    diff_dir: String,
    #[serde(default = "default_task_dir")]
    task_dir: String,
    #[serde(default = "default_statement_timeout_ms")]
    statement_timeout_ms: u64,
    #[serde(default = "default_block_rows")]
    block_rows: u64,
    #[serde(default = "default_max_cpu_ratio")]
    max_cpu_ratio: f64,
    #[serde(default = "default_batch_size")]
    batch_size: u64,
    #[serde(default = "default_worker_pool_size")]
    worker_pool_size: usize,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    auto_repair: AutoRepairConfig,
    #[serde(default)]
    schedule: ScheduleConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_cluster_dir() -> String {
    "clusters".to_string()
}
fn default_diff_dir() -> String {
    "ace_data/diffs".to_string()
}
fn default_task_dir() -> String {
    "ace_data/tasks".to_string()
}
fn default_statement_timeout_ms() -> u64 {
    60_000
}
fn default_block_rows() -> u64 {
    10_000
}
fn default_max_cpu_ratio() -> f64 {
    0.6
}
fn default_batch_size() -> u64 {
    1_000
}
fn default_worker_pool_size() -> usize {
    32
}

/// Represents the final, validated daemon configuration. The configuration
/// is an immutable snapshot captured at startup; components receive it by
/// reference and never mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Directory holding one `<cluster_name>.json` descriptor per cluster.
    pub cluster_dir: String,
    /// Directory diff-file artifacts are written to.
    pub diff_dir: String,
    /// Directory task records are persisted to.
    pub task_dir: String,
    pub statement_timeout_ms: u64,
    pub block_rows: u64,
    pub max_cpu_ratio: f64,
    pub batch_size: u64,
    pub worker_pool_size: usize,
    pub tls: TlsConfig,
    #[serde(default)]
    pub auto_repair: AutoRepairConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            cluster_dir: default_cluster_dir(),
            diff_dir: default_diff_dir(),
            task_dir: default_task_dir(),
            statement_timeout_ms: default_statement_timeout_ms(),
            block_rows: default_block_rows(),
            max_cpu_ratio: default_max_cpu_ratio(),
            batch_size: default_batch_size(),
            worker_pool_size: default_worker_pool_size(),
            tls: TlsConfig::default(),
            auto_repair: AutoRepairConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            cluster_dir: raw.cluster_dir,
            diff_dir: raw.diff_dir,
            task_dir: raw.task_dir,
            statement_timeout_ms: raw.statement_timeout_ms,
            block_rows: raw.block_rows,
            max_cpu_ratio: raw.max_cpu_ratio,
            batch_size: raw.batch_size,
            worker_pool_size: raw.worker_pool_size,
            tls: raw.tls,
            auto_repair: raw.auto_repair,
            schedule: raw.schedule,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.cluster_dir.trim().is_empty() {
            return Err(anyhow!("cluster_dir cannot be empty"));
        }
        if self.block_rows < 2 {
            return Err(anyhow!("block_rows must be at least 2"));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("batch_size cannot be 0"));
        }
        if !(self.max_cpu_ratio > 0.0 && self.max_cpu_ratio <= 1.0) {
            return Err(anyhow!("max_cpu_ratio must be in (0.0, 1.0]"));
        }
        if self.worker_pool_size == 0 {
            return Err(anyhow!("worker_pool_size cannot be 0"));
        }
        if self.tls.cert_path.trim().is_empty()
            || self.tls.key_path.trim().is_empty()
            || self.tls.ca_path.trim().is_empty()
        {
            return Err(anyhow!(
                "tls.cert_path, tls.key_path and tls.ca_path are all required"
            ));
        }

        if self.auto_repair.enabled {
            if self.auto_repair.cluster_name.trim().is_empty() {
                return Err(anyhow!("auto_repair.cluster_name is required"));
            }
            if self.auto_repair.dbname.trim().is_empty() {
                return Err(anyhow!("auto_repair.dbname is required"));
            }
            parse_time_string(&self.auto_repair.poll_interval)
                .map_err(|e| anyhow!("invalid auto_repair.poll_interval: {e}"))?;
            parse_time_string(&self.auto_repair.status_update_interval)
                .map_err(|e| anyhow!("invalid auto_repair.status_update_interval: {e}"))?;
        }

        self.validate_schedule()?;
        Ok(())
    }

    /// Checks that every schedule entry references a defined job and has a
    /// parseable trigger.
    fn validate_schedule(&self) -> Result<()> {
        for entry in &self.schedule.entries {
            if !self
                .schedule
                .jobs
                .iter()
                .any(|job| job.name == entry.job_name)
            {
                return Err(anyhow!(
                    "schedule entry references unknown job '{}'",
                    entry.job_name
                ));
            }

            match (&entry.crontab_schedule, &entry.run_frequency) {
                (Some(crontab), _) => {
                    parse_crontab(crontab).map_err(|e| {
                        anyhow!("invalid crontab_schedule for job '{}': {e}", entry.job_name)
                    })?;
                }
                (None, Some(freq)) => {
                    parse_time_string(freq).map_err(|e| {
                        anyhow!("invalid run_frequency for job '{}': {e}", entry.job_name)
                    })?;
                }
                (None, None) => {
                    return Err(anyhow!(
                        "job '{}' needs either crontab_schedule or run_frequency",
                        entry.job_name
                    ));
                }
            }
        }
        Ok(())
    }
}
