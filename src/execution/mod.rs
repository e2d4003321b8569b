/// Conditional order execution: order model, order store, tick driver and monitor

pub mod condition;
pub mod monitor;
pub mod order_store;
pub mod scheduler;

pub use condition::{AmountPolicy, CompositeOperator, Condition, ConditionalOrder, OrderAction, OrderId};
pub use monitor::{MonitorServices, OrderMonitor, TickSummary};
pub use order_store::{OrderBook, OrderStore};
pub use scheduler::TickScheduler;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderError {
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Invalid order parameter: {0}")]
    InvalidOrderParameter(String),
}
