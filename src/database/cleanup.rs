use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::RetentionSettings;
use super::client::TimeSeriesDb;
use super::partition::Table;
use super::DatabaseError;

/// Outcome of one retention pass
#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub partitions_dropped: usize,
    pub rows_deleted: u64,
    /// Tables whose cleanup failed, with the error; other tables still ran
    pub failures: Vec<(Table, String)>,
}

impl RetentionReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drops whole time partitions older than the retention horizon.
///
/// Only partitions whose entire span lies before the cutoff are dropped, so
/// the partition currently receiving writes is never touched.
pub struct RetentionManager {
    db: TimeSeriesDb,
    settings: RetentionSettings,
    running: Arc<AtomicBool>,
}

impl RetentionManager {
    pub fn new(db: TimeSeriesDb, settings: RetentionSettings) -> Self {
        Self {
            db,
            settings,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Handle that stops the periodic loop at its next wake-up
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn cutoff_for(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.settings.horizon_days))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    #[instrument(skip(self))]
    pub async fn run(self) {
        let period = Duration::from_secs(self.settings.run_interval_secs.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "🧹 Retention manager started: horizon {} days, every {:?}",
            self.settings.horizon_days, period
        );

        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let report = self.run_once_at(Utc::now()).await;
            if report.is_clean() {
                info!(
                    partitions_dropped = report.partitions_dropped,
                    rows_deleted = report.rows_deleted,
                    "✅ Retention pass completed"
                );
            } else {
                warn!(
                    partitions_dropped = report.partitions_dropped,
                    failed_tables = report.failures.len(),
                    "Retention pass completed with failures"
                );
            }
        }

        info!("🧹 Retention manager stopped");
    }

    /// One pass over every table using `now` as the reference time
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> RetentionReport {
        let cutoff = self.cutoff_for(now);
        let mut report = RetentionReport {
            cutoff: Some(cutoff),
            ..RetentionReport::default()
        };

        for table in Table::ALL {
            match self.prune_table(table, cutoff).await {
                Ok((dropped, rows)) => {
                    report.partitions_dropped += dropped;
                    report.rows_deleted += rows;
                }
                Err(e) => {
                    error!(table = table.name(), "Retention failed for table: {}", e);
                    report.failures.push((table, e.to_string()));
                }
            }
        }

        report
    }

    async fn prune_table(&self, table: Table, cutoff: DateTime<Utc>) -> Result<(usize, u64), DatabaseError> {
        let granularity = table.granularity();
        let expired: Vec<String> = self
            .db
            .list_partitions(table)
            .await?
            .into_iter()
            .filter(|key| granularity.is_expired(key, cutoff))
            .collect();

        let mut rows = 0;
        for partition in &expired {
            let deleted = self.db.drop_partition(table, partition).await?;
            debug!(table = table.name(), partition = %partition, rows = deleted, "Partition dropped");
            rows += deleted;
        }

        if !expired.is_empty() {
            info!(
                table = table.name(),
                partitions = expired.len(),
                rows = rows,
                "🗑️ Dropped expired partitions"
            );
        }
        Ok((expired.len(), rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::client::test_support::{temp_db, trade};
    use crate::database::models::{LatencyRecord, MetricRecord, Record, TradeFilter};

    #[tokio::test]
    async fn test_retention_keeps_only_the_horizon() {
        let (_dir, db) = temp_db().await;
        // Stored timestamps keep microseconds; align so the day-30 row sits exactly on the cutoff
        let now = DateTime::<Utc>::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap();

        let mut batch = Vec::new();
        for day in 0..35 {
            let ts = now - chrono::Duration::days(day);
            let mut t = trade(&format!("tx-{}", day));
            t.timestamp = ts;
            batch.push(Record::Trade(t));

            let mut latency = LatencyRecord::new("executor", "execute_trade", 5.0, true);
            latency.timestamp = ts;
            batch.push(Record::Latency(latency));

            let mut metric = MetricRecord::new("tick_duration_ms", "monitor", 1.0, true);
            metric.timestamp = ts;
            batch.push(Record::Performance(metric));
        }
        db.write_batch(&batch).await.unwrap();

        let manager = RetentionManager::new(
            db.clone(),
            RetentionSettings {
                horizon_days: 30,
                ..RetentionSettings::default()
            },
        );
        let report = manager.run_once_at(now).await;

        assert!(report.is_clean());
        assert_eq!(report.partitions_dropped, 12);
        assert_eq!(report.rows_deleted, 12);

        let cutoff = manager.cutoff_for(now);
        let trades = db.get_trades(&TradeFilter::new()).await.unwrap();
        assert_eq!(trades.len(), 31);
        assert!(trades.iter().all(|t| t.timestamp >= cutoff));

        assert_eq!(db.count_rows(Table::LatencyMetrics).await.unwrap(), 31);
        assert_eq!(db.count_rows(Table::PerformanceMetrics).await.unwrap(), 31);
    }

    #[tokio::test]
    async fn test_retention_is_a_no_op_inside_horizon() {
        let (_dir, db) = temp_db().await;
        db.write_batch(&[Record::Trade(trade("tx-fresh"))]).await.unwrap();

        let manager = RetentionManager::new(db.clone(), RetentionSettings::default());
        let report = manager.run_once_at(Utc::now()).await;

        assert_eq!(report.partitions_dropped, 0);
        assert_eq!(db.count_rows(Table::Trades).await.unwrap(), 1);
    }
}
