use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instrument symbol or mint address, e.g. "SOL" or "USDC"
pub type Instrument = String;

/// Holding for a single instrument as reported by the position ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: Instrument,
    /// Quantity currently held
    pub amount: f64,
    pub entry_price: f64,
}

impl Position {
    pub fn new(instrument: impl Into<Instrument>, amount: f64, entry_price: f64) -> Self {
        Self {
            instrument: instrument.into(),
            amount,
            entry_price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
    Swap,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
            TradeSide::Swap => "swap",
        }
    }

    /// Sells and swaps give up the held instrument, so they can never exceed the position
    pub fn is_closing(&self) -> bool {
        matches!(self, TradeSide::Sell | TradeSide::Swap)
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            "swap" => Ok(TradeSide::Swap),
            other => Err(format!("unknown trade side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        }
    }
}

impl FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paper" => Ok(TradingMode::Paper),
            "live" => Ok(TradingMode::Live),
            other => Err(format!("unknown trading mode: {}", other)),
        }
    }
}

/// Outcome of front-running / adverse-execution mitigation applied to a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionStatus {
    #[default]
    None,
    Attempted,
    Succeeded,
    Failed,
}

impl ProtectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionStatus::None => "none",
            ProtectionStatus::Attempted => "attempted",
            ProtectionStatus::Succeeded => "succeeded",
            ProtectionStatus::Failed => "failed",
        }
    }

    pub fn engaged(&self) -> bool {
        !matches!(self, ProtectionStatus::None)
    }
}

impl FromStr for ProtectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ProtectionStatus::None),
            "attempted" => Ok(ProtectionStatus::Attempted),
            "succeeded" => Ok(ProtectionStatus::Succeeded),
            "failed" => Ok(ProtectionStatus::Failed),
            other => Err(format!("unknown protection status: {}", other)),
        }
    }
}
