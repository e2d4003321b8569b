/// In-process stand-ins for the price cache, position ledger and trade
/// executor, used for paper sessions and tests.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::{
    ExecutionError, ExecutionResult, FillStatus, Instrument, Position, PositionLedger, PriceSource,
    ProtectionStatus, TradeExecutor, TradeParams, TradeSide,
};

const EPSILON: f64 = 1e-9;

/// Latest observed price per instrument
#[derive(Debug, Default)]
pub struct PriceCache {
    prices: DashMap<Instrument, f64>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, instrument: impl Into<Instrument>, price: f64) {
        self.prices.insert(instrument.into(), price);
    }

    /// Forget an instrument, e.g. when its feed goes stale
    pub fn remove(&self, instrument: &str) {
        self.prices.remove(instrument);
    }

    pub fn price(&self, instrument: &str) -> Option<f64> {
        self.prices.get(instrument).map(|entry| *entry.value())
    }
}

#[async_trait]
impl PriceSource for PriceCache {
    async fn get_price(&self, instrument: &str) -> Option<f64> {
        self.price(instrument)
    }
}

/// Virtual holdings for a paper session
#[derive(Debug, Default)]
pub struct VirtualLedger {
    positions: DashMap<Instrument, Position>,
}

impl VirtualLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_position(&self, instrument: impl Into<Instrument>, amount: f64, entry_price: f64) {
        let position = Position::new(instrument, amount, entry_price);
        info!(
            "📈 Paper position opened: {} {} @ {}",
            position.amount, position.instrument, position.entry_price
        );
        self.positions.insert(position.instrument.clone(), position);
    }

    pub fn position(&self, instrument: &str) -> Option<Position> {
        self.positions.get(instrument).map(|entry| entry.value().clone())
    }

    pub fn amount(&self, instrument: &str) -> f64 {
        self.positions.get(instrument).map(|entry| entry.amount).unwrap_or(0.0)
    }

    /// Move `amount_in` out of `input` and `amount_out` into `output`.
    /// Positions that reach zero are closed.
    pub fn apply_fill(&self, input: &str, amount_in: f64, output: &str, amount_out: f64, price: f64) {
        let emptied = match self.positions.get_mut(input) {
            Some(mut position) => {
                position.amount -= amount_in;
                position.amount <= EPSILON
            }
            None => false,
        };
        if emptied {
            self.positions.remove(input);
            debug!(instrument = input, "Paper position closed");
        }

        self.positions
            .entry(output.to_string())
            .and_modify(|position| position.amount += amount_out)
            .or_insert_with(|| Position::new(output, amount_out, price));
    }
}

#[async_trait]
impl PositionLedger for VirtualLedger {
    async fn get_positions(&self) -> HashMap<Instrument, Position> {
        self.positions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PaperExecutorSettings {
    /// Fraction of notional charged per trade
    pub fee_rate: f64,
    pub priority_fee: f64,
    pub expected_slippage_bps: f64,
    /// Slippage applied to every simulated fill
    pub fill_slippage_bps: f64,
    pub protection_status: ProtectionStatus,
    pub risk_score: f64,
    /// Simulated round-trip time of one execution
    pub latency: Duration,
}

impl Default for PaperExecutorSettings {
    fn default() -> Self {
        Self {
            fee_rate: 0.0025,
            priority_fee: 0.0001,
            expected_slippage_bps: 50.0,
            fill_slippage_bps: 10.0,
            protection_status: ProtectionStatus::Succeeded,
            risk_score: 5.0,
            latency: Duration::ZERO,
        }
    }
}

/// Fills trades at the cached price and books them in the virtual ledger
pub struct PaperExecutor {
    prices: Arc<PriceCache>,
    ledger: Arc<VirtualLedger>,
    settings: PaperExecutorSettings,
    forced_failure: RwLock<Option<ExecutionError>>,
}

impl PaperExecutor {
    pub fn new(prices: Arc<PriceCache>, ledger: Arc<VirtualLedger>, settings: PaperExecutorSettings) -> Self {
        Self {
            prices,
            ledger,
            settings,
            forced_failure: RwLock::new(None),
        }
    }

    /// Make every following execution fail with `error` (or succeed again with `None`)
    pub fn set_failure(&self, error: Option<ExecutionError>) {
        *self.forced_failure.write().unwrap_or_else(PoisonError::into_inner) = error;
    }

    fn fill(&self, params: &TradeParams) -> Result<ExecutionResult, ExecutionError> {
        if let Some(error) = self.forced_failure.read().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(error);
        }
        if !(params.amount.is_finite() && params.amount > 0.0) {
            return Err(ExecutionError::Rejected(format!("invalid amount {}", params.amount)));
        }

        let base = match params.side {
            TradeSide::Buy => &params.output_instrument,
            TradeSide::Sell | TradeSide::Swap => &params.input_instrument,
        };
        let market = self.prices.price(base).unwrap_or(params.reference_price);
        if !(market.is_finite() && market > 0.0) {
            return Err(ExecutionError::Rejected(format!("no price for {}", base)));
        }

        let slippage = self.settings.fill_slippage_bps / 10_000.0;
        let (executed_price, amount_in, gross_out) = match params.side {
            TradeSide::Buy => {
                let price = market * (1.0 + slippage);
                (price, params.amount * price, params.amount)
            }
            TradeSide::Sell | TradeSide::Swap => {
                let price = market * (1.0 - slippage);
                (price, params.amount, params.amount * price)
            }
        };

        let available = self.ledger.amount(&params.input_instrument);
        if params.side.is_closing() && amount_in > available + EPSILON {
            return Err(ExecutionError::InsufficientBalance { requested: amount_in, available });
        }

        let notional = params.amount * executed_price;
        let transaction_fee = notional * self.settings.fee_rate;
        let amount_out = match params.side {
            TradeSide::Buy => gross_out,
            TradeSide::Sell | TradeSide::Swap => gross_out - transaction_fee,
        };

        self.ledger
            .apply_fill(&params.input_instrument, amount_in, &params.output_instrument, amount_out, executed_price);

        Ok(ExecutionResult {
            tx_ref: format!("paper-{}", Uuid::new_v4()),
            status: FillStatus::Filled,
            executed_price,
            amount_in,
            amount_out,
            transaction_fee,
            priority_fee: self.settings.priority_fee,
            expected_slippage_bps: self.settings.expected_slippage_bps,
            actual_slippage_bps: self.settings.fill_slippage_bps,
            protection_status: self.settings.protection_status,
            risk_score: self.settings.risk_score,
            estimated_loss: notional * slippage,
        })
    }
}

#[async_trait]
impl TradeExecutor for PaperExecutor {
    async fn execute_trade(&self, params: TradeParams) -> Result<ExecutionResult, ExecutionError> {
        if !self.settings.latency.is_zero() {
            tokio::time::sleep(self.settings.latency).await;
        }

        let result = self.fill(&params)?;
        info!(
            "📝 Paper {} {:.6} {} -> {:.6} {} @ {:.6} ({})",
            params.side,
            result.amount_in,
            params.input_instrument,
            result.amount_out,
            params.output_instrument,
            result.executed_price,
            result.tx_ref
        );
        Ok(result)
    }
}
