use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Instrument, ProtectionStatus, TradeSide, TradingMode};
use super::partition::Table;

/// One executed trade. Written once per successful order trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub trader_id: String,
    pub mode: TradingMode,
    pub side: TradeSide,
    pub base_instrument: Instrument,
    pub quote_instrument: Instrument,
    pub amount_in: f64,
    pub amount_out: f64,
    pub executed_price: f64,
    pub transaction_fee: f64,
    pub priority_fee: f64,
    pub expected_slippage_bps: f64,
    pub actual_slippage_bps: f64,
    pub protection_status: ProtectionStatus,
    /// Transaction reference; unique per trade and used for idempotent writes
    pub tx_ref: String,
    pub metadata: serde_json::Value,
}

/// Performance sample, e.g. tick duration or fill quality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub timestamp: DateTime<Utc>,
    pub metric_type: String,
    pub component: String,
    pub value: f64,
    pub success: bool,
}

/// Outcome of the protection layer for one trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionRecord {
    pub timestamp: DateTime<Utc>,
    pub tx_ref: String,
    pub instrument: Instrument,
    pub status: ProtectionStatus,
    pub risk_score: f64,
    pub estimated_loss: f64,
    pub priority_fee: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyRecord {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub operation: String,
    pub latency_ms: f64,
    pub success: bool,
}

impl MetricRecord {
    pub fn new(metric_type: impl Into<String>, component: impl Into<String>, value: f64, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            metric_type: metric_type.into(),
            component: component.into(),
            value,
            success,
        }
    }
}

impl LatencyRecord {
    pub fn new(service: impl Into<String>, operation: impl Into<String>, latency_ms: f64, success: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            service: service.into(),
            operation: operation.into(),
            latency_ms,
            success,
        }
    }
}

/// Anything the batch recorder can buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Trade(TradeRecord),
    Performance(MetricRecord),
    Protection(ProtectionRecord),
    Latency(LatencyRecord),
}

impl Record {
    pub fn table(&self) -> Table {
        match self {
            Record::Trade(_) => Table::Trades,
            Record::Performance(_) => Table::PerformanceMetrics,
            Record::Protection(_) => Table::ProtectionMetrics,
            Record::Latency(_) => Table::LatencyMetrics,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Trade(r) => r.timestamp,
            Record::Performance(r) => r.timestamp,
            Record::Protection(r) => r.timestamp,
            Record::Latency(r) => r.timestamp,
        }
    }
}

/// Filter for `get_trades`; every field is optional
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Matches either leg of the trade
    pub instrument: Option<Instrument>,
    pub trader_id: Option<String>,
    pub limit: Option<u32>,
}

impl TradeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn instrument(mut self, instrument: impl Into<Instrument>) -> Self {
        self.instrument = Some(instrument.into());
        self
    }

    pub fn trader(mut self, trader_id: impl Into<String>) -> Self {
        self.trader_id = Some(trader_id.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub metric_type: String,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtectionAnalysis {
    pub total_trades: i64,
    /// Fraction of trades where protection was engaged at all
    pub engaged_rate: f64,
    /// Fraction of trades where protection succeeded
    pub success_rate: f64,
    pub avg_risk_score: f64,
    pub total_estimated_loss: f64,
    pub avg_priority_fee: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    pub service: String,
    pub operation: String,
    pub count: usize,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
}

/// Nearest-rank percentile over an ascending slice; 0.0 for an empty slice
pub fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx]
}

impl PerformanceStats {
    /// Summarise ascending samples
    pub fn from_sorted(metric_type: &str, samples: &[f64]) -> Self {
        let count = samples.len();
        let mean = if count > 0 {
            samples.iter().sum::<f64>() / count as f64
        } else {
            0.0
        };
        Self {
            metric_type: metric_type.to_string(),
            count,
            mean,
            min: samples.first().copied().unwrap_or(0.0),
            max: samples.last().copied().unwrap_or(0.0),
            p50: percentile(samples, 0.50),
            p95: percentile(samples, 0.95),
            p99: percentile(samples, 0.99),
        }
    }
}

impl LatencyPercentiles {
    pub fn from_sorted(service: &str, operation: &str, samples: &[f64]) -> Self {
        Self {
            service: service.to_string(),
            operation: operation.to_string(),
            count: samples.len(),
            p50: percentile(samples, 0.50),
            p95: percentile(samples, 0.95),
            p99: percentile(samples, 0.99),
            p999: percentile(samples, 0.999),
        }
    }
}
