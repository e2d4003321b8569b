/// Conditional order model: trigger conditions, trade actions and amount policies

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Instrument, Position, TradeSide};
use super::OrderError;

pub type OrderId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeOperator {
    And,
    Or,
}

/// Trigger rule for a conditional order.
///
/// Evaluation is a pure function of the observed price, the position and the
/// condition's own state. The only mutable state is a trailing stop's
/// high-water-mark, which only ever moves up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    StopLoss {
        trigger_price: f64,
        is_trailing: bool,
        /// Trail distance in percent of the high-water-mark
        trail_distance: f64,
        high_water_mark: f64,
    },
    TakeProfit {
        trigger_price: f64,
        /// Percent of the position to close, `None` closes everything
        partial_fraction: Option<f64>,
    },
    TimeBasedExit {
        duration: Duration,
        created_at: DateTime<Utc>,
    },
    Composite {
        operator: CompositeOperator,
        conditions: Vec<Condition>,
    },
}

impl Condition {
    pub fn stop_loss(trigger_price: f64) -> Self {
        Condition::StopLoss {
            trigger_price,
            is_trailing: false,
            trail_distance: 0.0,
            high_water_mark: trigger_price,
        }
    }

    /// Trailing stop seeded with the trigger price as its initial high-water-mark
    pub fn trailing_stop(trigger_price: f64, trail_distance: f64) -> Self {
        Condition::StopLoss {
            trigger_price,
            is_trailing: true,
            trail_distance,
            high_water_mark: trigger_price,
        }
    }

    pub fn take_profit(trigger_price: f64, partial_fraction: Option<f64>) -> Self {
        Condition::TakeProfit { trigger_price, partial_fraction }
    }

    pub fn time_exit(duration: Duration, created_at: DateTime<Utc>) -> Self {
        Condition::TimeBasedExit { duration, created_at }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::Composite { operator: CompositeOperator::And, conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Composite { operator: CompositeOperator::Or, conditions }
    }

    /// Short label used to tag trades with the reason they were submitted
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::StopLoss { is_trailing: true, .. } => "trailing_stop",
            Condition::StopLoss { .. } => "stop_loss",
            Condition::TakeProfit { .. } => "take_profit",
            Condition::TimeBasedExit { .. } => "time_exit",
            Condition::Composite { .. } => "composite",
        }
    }

    /// Reject parameters that can never describe a sane order
    pub fn validate(&self) -> Result<(), OrderError> {
        match self {
            Condition::StopLoss { trigger_price, is_trailing, trail_distance, .. } => {
                require_positive_price(*trigger_price)?;
                if *is_trailing {
                    require_percentage("trail_distance", *trail_distance)?;
                }
                Ok(())
            }
            Condition::TakeProfit { trigger_price, partial_fraction } => {
                require_positive_price(*trigger_price)?;
                if let Some(fraction) = partial_fraction {
                    require_percentage("partial_fraction", *fraction)?;
                }
                Ok(())
            }
            Condition::TimeBasedExit { duration, .. } => {
                if duration.is_zero() {
                    return Err(OrderError::InvalidOrderParameter(
                        "time exit duration must be greater than zero".to_string(),
                    ));
                }
                Ok(())
            }
            Condition::Composite { conditions, .. } => {
                if conditions.is_empty() {
                    return Err(OrderError::InvalidOrderParameter(
                        "composite condition needs at least one sub-condition".to_string(),
                    ));
                }
                conditions.iter().try_for_each(Condition::validate)
            }
        }
    }

    /// Effective stop price of a stop-loss, `None` for other kinds
    pub fn stop_price(&self) -> Option<f64> {
        match self {
            Condition::StopLoss { is_trailing: true, trail_distance, high_water_mark, .. } => {
                Some(high_water_mark * (1.0 - trail_distance / 100.0))
            }
            Condition::StopLoss { trigger_price, .. } => Some(*trigger_price),
            _ => None,
        }
    }

    /// True if observing `price` would raise any trailing high-water-mark in this tree
    pub fn needs_high_water_mark_update(&self, price: f64) -> bool {
        match self {
            Condition::StopLoss { is_trailing: true, high_water_mark, .. } => price > *high_water_mark,
            Condition::Composite { conditions, .. } => {
                conditions.iter().any(|c| c.needs_high_water_mark_update(price))
            }
            _ => false,
        }
    }

    /// Raise trailing high-water-marks to `price`; marks never move down.
    /// Returns true if anything changed.
    pub fn update_high_water_mark(&mut self, price: f64) -> bool {
        match self {
            Condition::StopLoss { is_trailing: true, high_water_mark, .. } => {
                if price > *high_water_mark {
                    *high_water_mark = price;
                    true
                } else {
                    false
                }
            }
            Condition::Composite { conditions, .. } => {
                let mut changed = false;
                for condition in conditions.iter_mut() {
                    changed |= condition.update_high_water_mark(price);
                }
                changed
            }
            _ => false,
        }
    }

    pub fn is_triggered(&self, current_price: f64, position: Option<&Position>, now: DateTime<Utc>) -> bool {
        match self {
            Condition::StopLoss { .. } => match self.stop_price() {
                Some(stop) => current_price <= stop,
                None => false,
            },
            Condition::TakeProfit { trigger_price, .. } => current_price >= *trigger_price,
            Condition::TimeBasedExit { duration, created_at } => {
                // A created_at in the future yields a negative delta, which never triggers
                match (now - *created_at).to_std() {
                    Ok(elapsed) => elapsed >= *duration,
                    Err(_) => false,
                }
            }
            Condition::Composite { operator: CompositeOperator::And, conditions } => {
                conditions.iter().all(|c| c.is_triggered(current_price, position, now))
            }
            Condition::Composite { operator: CompositeOperator::Or, conditions } => {
                conditions.iter().any(|c| c.is_triggered(current_price, position, now))
            }
        }
    }
}

/// What to trade when the order fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAction {
    pub side: TradeSide,
    /// The other leg of the trade, e.g. "USDC" for a SOL -> USDC sell
    pub counter_instrument: Instrument,
}

impl OrderAction {
    pub fn sell(counter_instrument: impl Into<Instrument>) -> Self {
        Self { side: TradeSide::Sell, counter_instrument: counter_instrument.into() }
    }

    pub fn buy(counter_instrument: impl Into<Instrument>) -> Self {
        Self { side: TradeSide::Buy, counter_instrument: counter_instrument.into() }
    }

    pub fn swap(counter_instrument: impl Into<Instrument>) -> Self {
        Self { side: TradeSide::Swap, counter_instrument: counter_instrument.into() }
    }

    /// (input, output) instruments for a trade on `instrument`
    pub fn legs(&self, instrument: &str) -> (Instrument, Instrument) {
        match self.side {
            TradeSide::Sell | TradeSide::Swap => (instrument.to_string(), self.counter_instrument.clone()),
            TradeSide::Buy => (self.counter_instrument.clone(), instrument.to_string()),
        }
    }
}

/// How much of the instrument to trade when the order fires
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AmountPolicy {
    FullPosition,
    FixedAmount(f64),
    /// Percent of the current position, in (0, 100]
    Percentage(f64),
}

impl AmountPolicy {
    pub fn validate(&self) -> Result<(), OrderError> {
        match self {
            AmountPolicy::FullPosition => Ok(()),
            AmountPolicy::FixedAmount(amount) => {
                if amount.is_finite() && *amount > 0.0 {
                    Ok(())
                } else {
                    Err(OrderError::InvalidOrderParameter(format!(
                        "fixed amount must be positive, got {}",
                        amount
                    )))
                }
            }
            AmountPolicy::Percentage(pct) => require_percentage("percentage", *pct),
        }
    }

    /// Concrete quantity for a trade given the quantity currently held
    pub fn resolve(&self, side: TradeSide, position_amount: f64) -> f64 {
        let held = position_amount.max(0.0);
        match self {
            AmountPolicy::FullPosition => held,
            AmountPolicy::FixedAmount(amount) if side.is_closing() => amount.min(held),
            AmountPolicy::FixedAmount(amount) => *amount,
            AmountPolicy::Percentage(pct) => held * pct / 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalOrder {
    pub id: OrderId,
    pub instrument: Instrument,
    pub condition: Condition,
    pub action: OrderAction,
    pub amount: AmountPolicy,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl ConditionalOrder {
    pub fn new(
        instrument: impl Into<Instrument>,
        condition: Condition,
        action: OrderAction,
        amount: AmountPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument: instrument.into(),
            condition,
            action,
            amount,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn validate(&self) -> Result<(), OrderError> {
        if self.instrument.trim().is_empty() {
            return Err(OrderError::InvalidOrderParameter("instrument must not be empty".to_string()));
        }
        self.condition.validate()?;
        self.amount.validate()
    }
}

fn require_positive_price(price: f64) -> Result<(), OrderError> {
    if price.is_finite() && price > 0.0 {
        Ok(())
    } else {
        Err(OrderError::InvalidOrderParameter(format!(
            "trigger price must be positive, got {}",
            price
        )))
    }
}

fn require_percentage(field: &str, value: f64) -> Result<(), OrderError> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(OrderError::InvalidOrderParameter(format!(
            "{} must be within (0, 100], got {}",
            field, value
        )))
    }
}
