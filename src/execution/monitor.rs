/// Order monitor: evaluates active conditional orders against live prices
/// on a fixed tick and executes the ones that fire

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{MonitorSettings, SessionSettings};
use crate::core::{
    ExecutionError, ExecutionResult, Instrument, Position, PositionLedger, PriceSource, TradeExecutor, TradeParams,
};
use crate::database::{BatchRecorder, LatencyRecord, MetricRecord, ProtectionRecord, Record, TradeRecord};
use crate::transport::{EventPublisher, OrderEvent};
use super::condition::{AmountPolicy, Condition, ConditionalOrder, OrderAction, OrderId};
use super::order_store::{read_book, write_book, OrderBook, OrderStore};
use super::scheduler::TickScheduler;
use super::OrderError;

/// Quantities below this are treated as nothing to trade
const MIN_TRADE_AMOUNT: f64 = 1e-12;

/// External services the monitor depends on
#[derive(Clone)]
pub struct MonitorServices {
    pub prices: Arc<dyn PriceSource>,
    pub ledger: Arc<dyn PositionLedger>,
    pub executor: Arc<dyn TradeExecutor>,
    pub events: Arc<dyn EventPublisher>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Instruments with at least one active order
    pub instruments: usize,
    /// Instruments skipped for lack of a timely price
    pub skipped: usize,
    pub triggered: usize,
    pub executed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct InstrumentOutcome {
    skipped: bool,
    triggered: usize,
    executed: usize,
    failed: usize,
}

impl TickSummary {
    fn absorb(&mut self, outcome: InstrumentOutcome) {
        if outcome.skipped {
            self.skipped += 1;
        }
        self.triggered += outcome.triggered;
        self.executed += outcome.executed;
        self.failed += outcome.failed;
    }
}

struct MonitorInner {
    store: Arc<OrderStore>,
    services: MonitorServices,
    recorder: BatchRecorder,
    settings: MonitorSettings,
    session: SessionSettings,
}

/// Owns the evaluation loop and the order management API.
///
/// Every tick snapshots positions, evaluates each instrument's order book in
/// its own task and waits for all of them before the tick completes. A
/// triggered order is removed from its book under the book's write lock, so it
/// is executed at most once even when cancelled concurrently. Failed
/// executions are reported and dropped, never re-queued.
#[derive(Clone)]
pub struct OrderMonitor {
    inner: Arc<MonitorInner>,
    scheduler: TickScheduler,
}

impl OrderMonitor {
    pub fn new(
        store: Arc<OrderStore>,
        services: MonitorServices,
        recorder: BatchRecorder,
        settings: MonitorSettings,
        session: SessionSettings,
    ) -> Self {
        let scheduler = TickScheduler::new(settings.tick_interval());
        Self {
            inner: Arc::new(MonitorInner {
                store,
                services,
                recorder,
                settings,
                session,
            }),
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.inner.store
    }

    /// Close the position when the price falls to `trigger_price`, or, when
    /// trailing, `trail_pct` percent below the highest price seen.
    pub fn add_stop_loss(
        &self,
        instrument: impl Into<Instrument>,
        trigger_price: f64,
        is_trailing: bool,
        trail_pct: f64,
    ) -> Result<OrderId, OrderError> {
        let condition = if is_trailing {
            Condition::trailing_stop(trigger_price, trail_pct)
        } else {
            Condition::stop_loss(trigger_price)
        };
        self.add_exit(instrument.into(), condition, AmountPolicy::FullPosition)
    }

    /// Sell `partial_pct` percent of the position (all of it when `None`)
    /// once the price reaches `trigger_price`
    pub fn add_take_profit(
        &self,
        instrument: impl Into<Instrument>,
        trigger_price: f64,
        partial_pct: Option<f64>,
    ) -> Result<OrderId, OrderError> {
        let amount = match partial_pct {
            Some(pct) => AmountPolicy::Percentage(pct),
            None => AmountPolicy::FullPosition,
        };
        self.add_exit(
            instrument.into(),
            Condition::take_profit(trigger_price, partial_pct),
            amount,
        )
    }

    /// Close the position once `duration` has elapsed from now
    pub fn add_time_exit(&self, instrument: impl Into<Instrument>, duration: Duration) -> Result<OrderId, OrderError> {
        self.add_exit(
            instrument.into(),
            Condition::time_exit(duration, Utc::now()),
            AmountPolicy::FullPosition,
        )
    }

    /// Register an arbitrary order, e.g. one with a composite condition
    pub fn add_order(
        &self,
        instrument: impl Into<Instrument>,
        condition: Condition,
        action: OrderAction,
        amount: AmountPolicy,
        metadata: HashMap<String, String>,
    ) -> Result<OrderId, OrderError> {
        let order = ConditionalOrder::new(instrument, condition, action, amount).with_metadata(metadata);
        self.register(order)
    }

    fn add_exit(&self, instrument: Instrument, condition: Condition, amount: AmountPolicy) -> Result<OrderId, OrderError> {
        let action = OrderAction::sell(self.inner.session.quote_instrument.clone());
        self.register(ConditionalOrder::new(instrument, condition, action, amount))
    }

    fn register(&self, order: ConditionalOrder) -> Result<OrderId, OrderError> {
        let instrument = order.instrument.clone();
        let kind = order.condition.kind();
        match self.inner.store.insert(order) {
            Ok(id) => {
                info!(order_id = %id, instrument = %instrument, "🛡️ {} order registered", kind);
                Ok(id)
            }
            Err(e) => {
                warn!(instrument = %instrument, "Rejected {} order: {}", kind, e);
                Err(e)
            }
        }
    }

    /// True if the order was active and this call removed it
    pub fn cancel_order(&self, id: &OrderId) -> bool {
        let removed = self.inner.store.cancel(id);
        if removed {
            info!(order_id = %id, "Order cancelled");
        }
        removed
    }

    pub fn get_active_orders(&self) -> Vec<ConditionalOrder> {
        self.inner.store.snapshot()
    }

    pub fn update_order(&self, id: &OrderId, condition: Condition) -> Result<(), OrderError> {
        self.inner.store.update_condition(id, condition)?;
        info!(order_id = %id, "Order condition updated");
        Ok(())
    }

    pub fn active_order_count(&self) -> usize {
        self.inner.store.len()
    }

    /// Run one evaluation cycle over every instrument with active orders
    #[instrument(skip(self), level = "debug")]
    pub async fn tick(&self) -> TickSummary {
        let started = Instant::now();
        let positions = self.inner.services.ledger.get_positions().await;
        let books = self.inner.store.books_with_orders();

        let mut summary = TickSummary {
            instruments: books.len(),
            ..TickSummary::default()
        };

        let units = books.into_iter().map(|(instrument, book)| {
            let inner = self.inner.clone();
            let position = positions.get(&instrument).cloned();
            tokio::spawn(async move { inner.evaluate_instrument(instrument, book, position).await })
        });

        for result in join_all(units).await {
            match result {
                Ok(outcome) => summary.absorb(outcome),
                Err(e) => error!("Instrument evaluation task failed: {}", e),
            }
        }

        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.inner.recorder.add(Record::Performance(MetricRecord::new(
            "tick_duration_ms",
            "order_monitor",
            elapsed_ms,
            true,
        )));

        if elapsed > self.inner.settings.slow_tick_threshold() {
            warn!(
                elapsed_ms = elapsed_ms,
                instruments = summary.instruments,
                "🐌 Slow monitor tick (interval {}ms)",
                self.inner.settings.tick_interval_ms
            );
        }
        if summary.triggered > 0 {
            debug!(
                triggered = summary.triggered,
                executed = summary.executed,
                failed = summary.failed,
                elapsed_ms = elapsed_ms,
                "Tick completed"
            );
        }
        summary
    }

    /// Tick until `stop` is called
    #[instrument(skip(self))]
    pub async fn run(&self) {
        info!("🛡️ Order monitor started (tick every {:?})", self.scheduler.period());
        let ticks = self.scheduler.run(|| self.tick()).await;
        info!(ticks = ticks, "🛡️ Order monitor stopped");
    }

    pub fn spawn(&self) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run().await })
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl MonitorInner {
    async fn evaluate_instrument(
        &self,
        instrument: Instrument,
        book: OrderBook,
        position: Option<Position>,
    ) -> InstrumentOutcome {
        let mut outcome = InstrumentOutcome::default();

        let lookup = timeout(self.settings.price_timeout(), self.services.prices.get_price(&instrument)).await;
        let price = match lookup {
            Ok(Some(price)) if price.is_finite() && price > 0.0 => price,
            Ok(_) => {
                debug!(instrument = %instrument, "No price available, skipping this tick");
                outcome.skipped = true;
                return outcome;
            }
            Err(_) => {
                warn!(
                    instrument = %instrument,
                    timeout_ms = self.settings.price_timeout_ms,
                    "Price lookup timed out, skipping this tick"
                );
                outcome.skipped = true;
                return outcome;
            }
        };

        let triggered = take_triggered(&book, price, position.as_ref(), Utc::now());
        if triggered.is_empty() {
            return outcome;
        }

        let ids: Vec<OrderId> = triggered.iter().map(|order| order.id).collect();
        self.store.forget(&ids);
        self.store.prune(&instrument);
        outcome.triggered = triggered.len();

        // Amounts size against the snapshot; closing fills cap later orders in this book
        let held = position.as_ref().map(|p| p.amount).unwrap_or(0.0);
        let mut available = held;
        for order in &triggered {
            if self.execute_order(order, price, held, &mut available).await {
                outcome.executed += 1;
            } else {
                outcome.failed += 1;
            }
        }
        outcome
    }

    async fn execute_order(&self, order: &ConditionalOrder, price: f64, held: f64, available: &mut f64) -> bool {
        let side = order.action.side;
        let trigger_reason = order.condition.kind();
        let mut amount = order.amount.resolve(side, held);
        if side.is_closing() {
            amount = amount.min(*available);
        }

        info!(
            order_id = %order.id,
            instrument = %order.instrument,
            price = price,
            amount = amount,
            "🚨 {} triggered",
            trigger_reason
        );

        if amount < MIN_TRADE_AMOUNT {
            warn!(order_id = %order.id, instrument = %order.instrument, "Triggered order resolved to an empty trade");
            self.publish_failure(order, "no position left to trade".to_string());
            return false;
        }

        let (input_instrument, output_instrument) = order.action.legs(&order.instrument);
        let mut metadata: HashMap<String, Value> = order
            .metadata
            .iter()
            .map(|(key, value)| (key.clone(), Value::String(value.clone())))
            .collect();
        metadata.insert("order_id".to_string(), Value::String(order.id.to_string()));
        metadata.insert("trigger_reason".to_string(), Value::String(trigger_reason.to_string()));
        metadata.insert("trigger_price".to_string(), serde_json::json!(price));

        let params = TradeParams {
            side,
            input_instrument,
            output_instrument,
            amount,
            reference_price: price,
            metadata: metadata.clone(),
        };

        let started = Instant::now();
        let result = match timeout(self.settings.execution_timeout(), self.services.executor.execute_trade(params)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(self.settings.execution_timeout_ms)),
        };
        self.recorder.add(Record::Latency(LatencyRecord::new(
            "executor",
            "execute_trade",
            started.elapsed().as_secs_f64() * 1000.0,
            result.is_ok(),
        )));

        match result {
            Ok(fill) => {
                if side.is_closing() {
                    *available = (*available - fill.amount_in).max(0.0);
                }
                self.record_trade(order, &fill, metadata);
                self.services.events.publish(OrderEvent::OrderExecuted {
                    order_id: order.id,
                    instrument: order.instrument.clone(),
                    side,
                    trigger_reason: trigger_reason.to_string(),
                    amount: fill.amount_in,
                    executed_price: fill.executed_price,
                    tx_ref: fill.tx_ref.clone(),
                    timestamp: Utc::now(),
                });
                info!(
                    order_id = %order.id,
                    instrument = %order.instrument,
                    tx_ref = %fill.tx_ref,
                    "✅ Order executed at {:.6}",
                    fill.executed_price
                );
                true
            }
            Err(e) => {
                error!(
                    order_id = %order.id,
                    instrument = %order.instrument,
                    "❌ Order execution failed, order dropped: {}",
                    e
                );
                self.publish_failure(order, e.to_string());
                false
            }
        }
    }

    fn record_trade(&self, order: &ConditionalOrder, fill: &ExecutionResult, metadata: HashMap<String, Value>) {
        let timestamp = Utc::now();
        self.recorder.add(Record::Trade(TradeRecord {
            timestamp,
            trader_id: self.session.trader_id.clone(),
            mode: self.session.mode,
            side: order.action.side,
            base_instrument: order.instrument.clone(),
            quote_instrument: order.action.counter_instrument.clone(),
            amount_in: fill.amount_in,
            amount_out: fill.amount_out,
            executed_price: fill.executed_price,
            transaction_fee: fill.transaction_fee,
            priority_fee: fill.priority_fee,
            expected_slippage_bps: fill.expected_slippage_bps,
            actual_slippage_bps: fill.actual_slippage_bps,
            protection_status: fill.protection_status,
            tx_ref: fill.tx_ref.clone(),
            metadata: Value::Object(metadata.into_iter().collect()),
        }));
        self.recorder.add(Record::Protection(ProtectionRecord {
            timestamp,
            tx_ref: fill.tx_ref.clone(),
            instrument: order.instrument.clone(),
            status: fill.protection_status,
            risk_score: fill.risk_score,
            estimated_loss: fill.estimated_loss,
            priority_fee: fill.priority_fee,
        }));
    }

    fn publish_failure(&self, order: &ConditionalOrder, error: String) {
        self.services.events.publish(OrderEvent::OrderFailed {
            order_id: order.id,
            instrument: order.instrument.clone(),
            trigger_reason: order.condition.kind().to_string(),
            error,
            timestamp: Utc::now(),
        });
    }
}

/// Raise trailing marks, then take every order that fires at `price` out of
/// the book. Returned orders keep their insertion order.
fn take_triggered(
    book: &OrderBook,
    price: f64,
    position: Option<&Position>,
    now: DateTime<Utc>,
) -> Vec<ConditionalOrder> {
    {
        let orders = read_book(book);
        let needs_write = orders.iter().any(|order| {
            order.condition.needs_high_water_mark_update(price) || order.condition.is_triggered(price, position, now)
        });
        if !needs_write {
            return Vec::new();
        }
    }

    let mut orders = write_book(book);
    let mut fired = Vec::new();
    for (idx, order) in orders.iter_mut().enumerate() {
        if order.condition.update_high_water_mark(price) {
            debug!(order_id = %order.id, high_water_mark = price, "High-water-mark raised");
        }
        if order.condition.is_triggered(price, position, now) {
            fired.push(idx);
        }
    }

    // Highest index first so earlier indices stay valid
    let mut removed: Vec<ConditionalOrder> = fired.iter().rev().map(|&idx| orders.remove(idx)).collect();
    removed.reverse();
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderSettings;
    use crate::core::{ProtectionStatus, TradeSide};
    use crate::database::client::test_support::temp_db;
    use crate::database::{BatchWriter, DatabaseError, TradeFilter};
    use crate::paper::{PaperExecutor, PaperExecutorSettings, PriceCache, VirtualLedger};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryWriter {
        records: Mutex<Vec<Record>>,
    }

    #[async_trait]
    impl BatchWriter for MemoryWriter {
        async fn write_batch(&self, records: &[Record]) -> Result<u64, DatabaseError> {
            self.records.lock().unwrap().extend_from_slice(records);
            Ok(records.len() as u64)
        }
    }

    #[derive(Default)]
    struct CapturedEvents {
        events: Mutex<Vec<OrderEvent>>,
    }

    impl EventPublisher for CapturedEvents {
        fn publish(&self, event: OrderEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Never answers for `stalled`, delegates everything else to the cache
    struct StallingPrices {
        cache: Arc<PriceCache>,
        stalled: String,
    }

    #[async_trait]
    impl PriceSource for StallingPrices {
        async fn get_price(&self, instrument: &str) -> Option<f64> {
            if instrument == self.stalled {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.cache.price(instrument)
        }
    }

    struct Harness {
        monitor: OrderMonitor,
        prices: Arc<PriceCache>,
        ledger: Arc<VirtualLedger>,
        executor: Arc<PaperExecutor>,
        recorder: BatchRecorder,
        writer: Arc<MemoryWriter>,
        events: Arc<CapturedEvents>,
    }

    impl Harness {
        fn new() -> Self {
            Self::build(None, PaperExecutorSettings::default())
        }

        fn build(stalled: Option<&str>, executor_settings: PaperExecutorSettings) -> Self {
            let prices = Arc::new(PriceCache::new());
            let ledger = Arc::new(VirtualLedger::new());
            let executor = Arc::new(PaperExecutor::new(
                prices.clone(),
                ledger.clone(),
                PaperExecutorSettings {
                    fill_slippage_bps: 0.0,
                    ..executor_settings
                },
            ));
            let writer = Arc::new(MemoryWriter::default());
            let recorder = BatchRecorder::new(writer.clone(), RecorderSettings::default());
            let events = Arc::new(CapturedEvents::default());

            let price_source: Arc<dyn PriceSource> = match stalled {
                Some(instrument) => Arc::new(StallingPrices {
                    cache: prices.clone(),
                    stalled: instrument.to_string(),
                }),
                None => prices.clone(),
            };

            let monitor = OrderMonitor::new(
                Arc::new(OrderStore::new()),
                MonitorServices {
                    prices: price_source,
                    ledger: ledger.clone(),
                    executor: executor.clone(),
                    events: events.clone(),
                },
                recorder.clone(),
                MonitorSettings::default(),
                SessionSettings::default(),
            );

            Self { monitor, prices, ledger, executor, recorder, writer, events }
        }

        async fn flushed(&self) -> Vec<Record> {
            self.recorder.flush().await;
            self.writer.records.lock().unwrap().clone()
        }

        fn events(&self) -> Vec<OrderEvent> {
            self.events.events.lock().unwrap().clone()
        }
    }

    fn trades(records: &[Record]) -> Vec<TradeRecord> {
        records
            .iter()
            .filter_map(|r| match r {
                Record::Trade(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_trailing_stop_scenario() {
        let h = Harness::new();
        h.ledger.open_position("SOL", 10.0, 100.0);
        let id = h.monitor.add_stop_loss("SOL", 95.0, true, 5.0).unwrap();

        h.prices.set_price("SOL", 100.0);
        assert_eq!(h.monitor.tick().await.triggered, 0);

        h.prices.set_price("SOL", 120.0);
        assert_eq!(h.monitor.tick().await.triggered, 0);
        let stop = h.monitor.get_active_orders()[0].condition.stop_price().unwrap();
        assert!((stop - 114.0).abs() < 1e-9);

        h.prices.set_price("SOL", 113.0);
        let summary = h.monitor.tick().await;
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.executed, 1);
        assert_eq!(h.monitor.active_order_count(), 0);
        assert_eq!(h.monitor.store().instrument_count(), 0);
        assert!(!h.monitor.cancel_order(&id));
        assert!(h.ledger.position("SOL").is_none());

        let records = h.flushed().await;
        let trades = trades(&records);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, TradeSide::Sell);
        assert_eq!(trades[0].amount_in, 10.0);
        assert_eq!(trades[0].executed_price, 113.0);
        assert_eq!(trades[0].protection_status, ProtectionStatus::Succeeded);
        assert_eq!(trades[0].metadata["trigger_reason"], "trailing_stop");
        assert_eq!(trades[0].metadata["order_id"], id.to_string());

        let protections = records.iter().filter(|r| matches!(r, Record::Protection(_))).count();
        assert_eq!(protections, 1);
        let executor_latency = records
            .iter()
            .filter(|r| matches!(r, Record::Latency(l) if l.service == "executor" && l.success))
            .count();
        assert_eq!(executor_latency, 1);

        let events = h.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], OrderEvent::OrderExecuted { order_id, .. } if *order_id == id));
    }

    #[tokio::test]
    async fn test_trailing_stop_scenario_reaches_the_store() {
        let (_dir, db) = temp_db().await;
        let prices = Arc::new(PriceCache::new());
        let ledger = Arc::new(VirtualLedger::new());
        let executor = Arc::new(PaperExecutor::new(prices.clone(), ledger.clone(), PaperExecutorSettings::default()));
        let recorder = BatchRecorder::new(Arc::new(db.clone()), RecorderSettings::default());
        let flusher = recorder.spawn();

        let monitor = OrderMonitor::new(
            Arc::new(OrderStore::new()),
            MonitorServices {
                prices: prices.clone(),
                ledger: ledger.clone(),
                executor,
                events: Arc::new(CapturedEvents::default()),
            },
            recorder.clone(),
            MonitorSettings::default(),
            SessionSettings::default(),
        );

        ledger.open_position("SOL", 10.0, 100.0);
        monitor.add_stop_loss("SOL", 95.0, true, 5.0).unwrap();
        for price in [100.0, 120.0, 113.0] {
            prices.set_price("SOL", price);
            monitor.tick().await;
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        let stored = db.get_trades(&TradeFilter::new().instrument("SOL")).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].protection_status, ProtectionStatus::Succeeded);
        assert_eq!(stored[0].amount_in, 10.0);

        recorder.shutdown().await;
        flusher.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_execution_is_not_requeued() {
        let h = Harness::new();
        h.ledger.open_position("SOL", 10.0, 100.0);
        let id = h.monitor.add_stop_loss("SOL", 95.0, false, 0.0).unwrap();
        h.executor.set_failure(Some(ExecutionError::Network("rpc unreachable".to_string())));

        h.prices.set_price("SOL", 90.0);
        let summary = h.monitor.tick().await;
        assert_eq!(summary.triggered, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(h.monitor.active_order_count(), 0);

        // Price stays below the stop; nothing left to trigger
        assert_eq!(h.monitor.tick().await.triggered, 0);

        let events = h.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            OrderEvent::OrderFailed { order_id, error, .. } => {
                assert_eq!(*order_id, id);
                assert!(error.contains("rpc unreachable"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let records = h.flushed().await;
        assert!(trades(&records).is_empty());
        assert!(records
            .iter()
            .any(|r| matches!(r, Record::Latency(l) if l.service == "executor" && !l.success)));
        assert_eq!(h.ledger.amount("SOL"), 10.0);
    }

    #[tokio::test]
    async fn test_missing_price_skips_instrument_only() {
        let h = Harness::new();
        h.ledger.open_position("SOL", 10.0, 100.0);
        h.ledger.open_position("BONK", 1_000.0, 0.00002);
        h.monitor.add_stop_loss("SOL", 95.0, false, 0.0).unwrap();
        h.monitor.add_stop_loss("BONK", 0.00001, false, 0.0).unwrap();

        h.prices.set_price("SOL", 90.0);
        let summary = h.monitor.tick().await;

        assert_eq!(summary.instruments, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.executed, 1);
        assert_eq!(h.monitor.get_active_orders()[0].instrument, "BONK");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_price_lookup_does_not_block_other_instruments() {
        let h = Harness::build(Some("BONK"), PaperExecutorSettings::default());
        h.ledger.open_position("SOL", 10.0, 100.0);
        h.ledger.open_position("BONK", 1_000.0, 0.00002);
        h.monitor.add_stop_loss("SOL", 95.0, false, 0.0).unwrap();
        h.monitor.add_stop_loss("BONK", 0.00001, false, 0.0).unwrap();
        h.prices.set_price("SOL", 90.0);
        h.prices.set_price("BONK", 0.000001);

        let summary = h.monitor.tick().await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.executed, 1);
        assert_eq!(h.monitor.active_order_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_timeout_is_reported() {
        let h = Harness::build(
            None,
            PaperExecutorSettings {
                latency: Duration::from_secs(5),
                ..PaperExecutorSettings::default()
            },
        );
        h.ledger.open_position("SOL", 10.0, 100.0);
        h.monitor.add_stop_loss("SOL", 95.0, false, 0.0).unwrap();
        h.prices.set_price("SOL", 90.0);

        let summary = h.monitor.tick().await;
        assert_eq!(summary.failed, 1);
        assert_eq!(h.monitor.active_order_count(), 0);
        assert!(matches!(&h.events()[0], OrderEvent::OrderFailed { error, .. } if error.contains("timed out")));
        assert_eq!(h.ledger.amount("SOL"), 10.0);
    }

    #[tokio::test]
    async fn test_orders_on_one_instrument_never_oversell() {
        let h = Harness::new();
        h.ledger.open_position("SOL", 10.0, 100.0);
        let first = h.monitor.add_stop_loss("SOL", 95.0, false, 0.0).unwrap();
        h.monitor.add_stop_loss("SOL", 92.0, false, 0.0).unwrap();

        h.prices.set_price("SOL", 85.0);
        let summary = h.monitor.tick().await;
        assert_eq!(summary.triggered, 2);
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.failed, 1);

        // Insertion order decides which order gets the position
        let events = h.events();
        assert!(matches!(&events[0], OrderEvent::OrderExecuted { order_id, amount, .. }
            if *order_id == first && *amount == 10.0));
        assert!(matches!(&events[1], OrderEvent::OrderFailed { .. }));
        assert_eq!(trades(&h.flushed().await).len(), 1);
    }

    #[tokio::test]
    async fn test_partial_take_profit() {
        let h = Harness::new();
        h.ledger.open_position("SOL", 10.0, 100.0);
        h.monitor.add_take_profit("SOL", 150.0, Some(25.0)).unwrap();

        h.prices.set_price("SOL", 149.0);
        assert_eq!(h.monitor.tick().await.triggered, 0);

        h.prices.set_price("SOL", 150.0);
        assert_eq!(h.monitor.tick().await.executed, 1);
        assert!((h.ledger.amount("SOL") - 7.5).abs() < 1e-9);

        let trades = trades(&h.flushed().await);
        assert_eq!(trades[0].amount_in, 2.5);
        assert_eq!(trades[0].metadata["trigger_reason"], "take_profit");
    }

    #[tokio::test]
    async fn test_percentage_orders_size_against_snapshot() {
        let h = Harness::new();
        h.ledger.open_position("SOL", 10.0, 100.0);
        h.monitor.add_take_profit("SOL", 150.0, Some(50.0)).unwrap();
        h.monitor.add_take_profit("SOL", 150.0, Some(50.0)).unwrap();

        h.prices.set_price("SOL", 155.0);
        let summary = h.monitor.tick().await;
        assert_eq!(summary.executed, 2);
        assert_eq!(h.ledger.amount("SOL"), 0.0);

        let trades = trades(&h.flushed().await);
        assert_eq!(trades.len(), 2);
        assert!(trades.iter().all(|t| (t.amount_in - 5.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn test_percentage_orders_are_capped_by_earlier_fills() {
        let h = Harness::new();
        h.ledger.open_position("SOL", 10.0, 100.0);
        h.monitor.add_take_profit("SOL", 150.0, Some(80.0)).unwrap();
        h.monitor.add_take_profit("SOL", 150.0, Some(50.0)).unwrap();

        h.prices.set_price("SOL", 155.0);
        assert_eq!(h.monitor.tick().await.executed, 2);

        let mut amounts: Vec<f64> = trades(&h.flushed().await).iter().map(|t| t.amount_in).collect();
        amounts.sort_by(|a, b| a.total_cmp(b));
        assert!((amounts[0] - 2.0).abs() < 1e-9);
        assert!((amounts[1] - 8.0).abs() < 1e-9);
        assert_eq!(h.ledger.amount("SOL"), 0.0);
    }

    #[tokio::test]
    async fn test_composite_order_with_metadata() {
        let h = Harness::new();
        h.ledger.open_position("SOL", 10.0, 100.0);
        let condition = Condition::all(vec![
            Condition::take_profit(110.0, None),
            Condition::time_exit(Duration::from_secs(60), Utc::now() - chrono::Duration::minutes(5)),
        ]);
        let metadata = HashMap::from([("strategy".to_string(), "breakout".to_string())]);
        h.monitor
            .add_order("SOL", condition, OrderAction::sell("USDC"), AmountPolicy::FixedAmount(4.0), metadata)
            .unwrap();

        h.prices.set_price("SOL", 105.0);
        assert_eq!(h.monitor.tick().await.triggered, 0);

        h.prices.set_price("SOL", 111.0);
        assert_eq!(h.monitor.tick().await.executed, 1);

        let trades = trades(&h.flushed().await);
        assert_eq!(trades[0].amount_in, 4.0);
        assert_eq!(trades[0].metadata["strategy"], "breakout");
        assert_eq!(trades[0].metadata["trigger_reason"], "composite");
    }

    #[tokio::test]
    async fn test_many_instruments_in_one_tick() {
        let h = Harness::new();
        for i in 0..50 {
            let instrument = format!("TOKEN{}", i);
            h.ledger.open_position(instrument.as_str(), 1.0, 10.0);
            h.prices.set_price(instrument.as_str(), 5.0);
            h.monitor.add_stop_loss(instrument, 8.0, false, 0.0).unwrap();
        }

        let summary = h.monitor.tick().await;
        assert_eq!(summary.instruments, 50);
        assert_eq!(summary.executed, 50);
        assert_eq!(h.monitor.active_order_count(), 0);
        assert_eq!(h.events().len(), 50);
        assert_eq!(trades(&h.flushed().await).len(), 50);
    }

    #[tokio::test]
    async fn test_tick_records_its_duration() {
        let h = Harness::new();
        h.monitor.tick().await;
        let records = h.flushed().await;
        assert!(records
            .iter()
            .any(|r| matches!(r, Record::Performance(m) if m.metric_type == "tick_duration_ms")));
    }

    #[test]
    fn test_management_api_validation() {
        let h = Harness::new();
        assert!(matches!(
            h.monitor.add_stop_loss("SOL", 0.0, false, 0.0),
            Err(OrderError::InvalidOrderParameter(_))
        ));
        assert!(matches!(
            h.monitor.add_stop_loss("SOL", 95.0, true, 150.0),
            Err(OrderError::InvalidOrderParameter(_))
        ));
        assert!(matches!(
            h.monitor.add_take_profit("SOL", 150.0, Some(0.0)),
            Err(OrderError::InvalidOrderParameter(_))
        ));
        assert_eq!(h.monitor.active_order_count(), 0);

        let id = h.monitor.add_take_profit("SOL", 150.0, None).unwrap();
        h.monitor.add_time_exit("SOL", Duration::from_secs(3600)).unwrap();
        assert_eq!(h.monitor.active_order_count(), 2);

        h.monitor.update_order(&id, Condition::take_profit(175.0, None)).unwrap();
        let updated = h.monitor.get_active_orders().into_iter().find(|o| o.id == id).unwrap();
        assert_eq!(updated.condition, Condition::take_profit(175.0, None));

        assert!(h.monitor.cancel_order(&id));
        assert!(!h.monitor.cancel_order(&id));
        assert_eq!(h.monitor.update_order(&id, Condition::stop_loss(90.0)), Err(OrderError::OrderNotFound(id)));
    }
}
