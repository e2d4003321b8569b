/// Contracts for the collaborators the monitor consumes but does not own:
/// the price cache, the position ledger and the trade executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use super::types::{Instrument, Position, ProtectionStatus, TradeSide};

/// Sub-millisecond key -> price lookup
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Returns `None` when the instrument is unknown or its price is stale
    async fn get_price(&self, instrument: &str) -> Option<f64>;
}

#[async_trait]
pub trait PositionLedger: Send + Sync {
    async fn get_positions(&self) -> HashMap<Instrument, Position>;
}

#[async_trait]
pub trait TradeExecutor: Send + Sync {
    async fn execute_trade(&self, params: TradeParams) -> Result<ExecutionResult, ExecutionError>;
}

/// A concrete trade request derived from a triggered order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeParams {
    pub side: TradeSide,
    /// Instrument given up (the held instrument for sells/swaps)
    pub input_instrument: Instrument,
    /// Instrument received
    pub output_instrument: Instrument,
    pub amount: f64,
    /// Price observed when the order triggered
    pub reference_price: f64,
    /// Tags describing why the trade was submitted (order id, trigger reason)
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Filled,
    PartiallyFilled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub tx_ref: String,
    pub status: FillStatus,
    pub executed_price: f64,
    pub amount_in: f64,
    pub amount_out: f64,
    pub transaction_fee: f64,
    pub priority_fee: f64,
    pub expected_slippage_bps: f64,
    pub actual_slippage_bps: f64,
    pub protection_status: ProtectionStatus,
    /// Adverse-execution risk score assigned by the protection layer (0-100)
    pub risk_score: f64,
    /// Estimated value lost to adverse execution, in quote units
    pub estimated_loss: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Trade rejected: {0}")]
    Rejected(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: f64, available: f64 },

    #[error("Execution timed out after {0}ms")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),
}
