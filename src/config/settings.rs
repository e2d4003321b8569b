/// Runtime configuration structures

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::core::{Instrument, TradingMode};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionSettings,
    pub monitor: MonitorSettings,
    pub recorder: RecorderSettings,
    pub database: DatabaseSettings,
    pub retention: RetentionSettings,
}

/// Who is trading and in which mode; stamped onto every trade record
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSettings {
    pub trader_id: String,
    pub mode: TradingMode,
    /// Counter instrument for stop-loss and take-profit exits
    pub quote_instrument: Instrument,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub tick_interval_ms: u64,
    /// Upper bound on one price lookup; a slower lookup skips the instrument for this tick
    pub price_timeout_ms: u64,
    pub execution_timeout_ms: u64,
    /// Ticks slower than this fraction of the interval are logged as slow
    pub slow_tick_ratio: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecorderSettings {
    pub flush_interval_ms: u64,
    /// Buffer length that forces a flush ahead of the timer
    pub max_buffer_size: usize,
    /// Retries after the first failed attempt before a batch is dead-lettered
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Exhausted batches are also appended here as JSON lines
    pub dead_letter_path: Option<PathBuf>,
    /// Dead-lettered batches kept in memory
    pub dead_letter_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    pub writer_connections: u32,
    pub reader_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub horizon_days: u32,
    pub run_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            trader_id: "sentinel".to_string(),
            mode: TradingMode::Paper,
            quote_instrument: "USDC".to_string(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            price_timeout_ms: 20,
            execution_timeout_ms: 80,
            slow_tick_ratio: 0.5,
        }
    }
}

impl MonitorSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn price_timeout(&self) -> Duration {
        Duration::from_millis(self.price_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn slow_tick_threshold(&self) -> Duration {
        let micros = self.tick_interval_ms as f64 * 1000.0 * self.slow_tick_ratio.max(0.0);
        Duration::from_micros(micros as u64)
    }
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 100,
            max_buffer_size: 1000,
            max_retries: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 1600,
            dead_letter_path: None,
            dead_letter_capacity: 1000,
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/sentinel.db"),
            writer_connections: 1,
            reader_connections: 4,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            horizon_days: 30,
            run_interval_secs: 86_400,
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let monitor = &self.monitor;
        if monitor.tick_interval_ms == 0 {
            bail!("monitor.tick_interval_ms must be greater than zero");
        }
        if monitor.price_timeout_ms >= monitor.tick_interval_ms
            || monitor.execution_timeout_ms >= monitor.tick_interval_ms
        {
            bail!(
                "monitor timeouts ({}ms price, {}ms execution) must be shorter than the {}ms tick",
                monitor.price_timeout_ms,
                monitor.execution_timeout_ms,
                monitor.tick_interval_ms
            );
        }
        if self.recorder.flush_interval_ms == 0 || self.recorder.max_buffer_size == 0 {
            bail!("recorder.flush_interval_ms and recorder.max_buffer_size must be greater than zero");
        }
        if self.retention.horizon_days == 0 {
            bail!("retention.horizon_days must be greater than zero");
        }
        if self.session.quote_instrument.trim().is_empty() {
            bail!("session.quote_instrument must not be empty");
        }
        Ok(())
    }
}
