/// Time partitioning for the time-series tables

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionGranularity {
    Daily,
    Hourly,
}

impl PartitionGranularity {
    /// Partition key for a timestamp: `YYYY-MM-DD` or `YYYY-MM-DDTHH`
    pub fn key_for(&self, ts: DateTime<Utc>) -> String {
        match self {
            PartitionGranularity::Daily => ts.format("%Y-%m-%d").to_string(),
            PartitionGranularity::Hourly => ts.format("%Y-%m-%dT%H").to_string(),
        }
    }

    pub fn span(&self) -> Duration {
        match self {
            PartitionGranularity::Daily => Duration::days(1),
            PartitionGranularity::Hourly => Duration::hours(1),
        }
    }

    /// Inclusive start of the partition named by `key`
    pub fn start_of(&self, key: &str) -> Option<DateTime<Utc>> {
        let naive = match self {
            PartitionGranularity::Daily => NaiveDate::parse_from_str(key, "%Y-%m-%d")
                .ok()?
                .and_hms_opt(0, 0, 0)?,
            PartitionGranularity::Hourly => {
                NaiveDateTime::parse_from_str(&format!("{}:00:00", key), "%Y-%m-%dT%H:%M:%S").ok()?
            }
        };
        Some(Utc.from_utc_datetime(&naive))
    }

    /// Exclusive end of the partition named by `key`
    pub fn end_of(&self, key: &str) -> Option<DateTime<Utc>> {
        self.start_of(key).map(|start| start + self.span())
    }

    /// A partition may be dropped only when every instant it covers is older than `cutoff`
    pub fn is_expired(&self, key: &str, cutoff: DateTime<Utc>) -> bool {
        match self.end_of(key) {
            Some(end) => end <= cutoff,
            None => false,
        }
    }
}

/// The four time-series tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    Trades,
    PerformanceMetrics,
    ProtectionMetrics,
    LatencyMetrics,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Trades,
        Table::PerformanceMetrics,
        Table::ProtectionMetrics,
        Table::LatencyMetrics,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Trades => "trades",
            Table::PerformanceMetrics => "performance_metrics",
            Table::ProtectionMetrics => "protection_metrics",
            Table::LatencyMetrics => "latency_metrics",
        }
    }

    /// Latency samples are far more frequent, so they partition hourly
    pub fn granularity(&self) -> PartitionGranularity {
        match self {
            Table::LatencyMetrics => PartitionGranularity::Hourly,
            _ => PartitionGranularity::Daily,
        }
    }
}
