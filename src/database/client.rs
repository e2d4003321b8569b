use std::time::{Duration, Instant};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, instrument};

use crate::config::DatabaseSettings;
use super::migrations::MigrationRunner;
use super::models::{LatencyRecord, MetricRecord, ProtectionRecord, Record, TradeRecord};
use super::partition::Table;
use super::DatabaseError;

/// Pooled client for the partitioned time-series store.
///
/// Writes go through a dedicated writer pool, queries through a separate
/// read-only pool, so analysis never waits on a connection held by a flush.
#[derive(Debug, Clone)]
pub struct TimeSeriesDb {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl TimeSeriesDb {
    /// Open (or create) the store, run migrations and open both pools
    #[instrument(skip(settings), fields(path = %settings.path.display()))]
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, DatabaseError> {
        if let Some(parent) = settings.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    DatabaseError::ConnectionError(format!("Failed to create data directory: {}", e))
                })?;
            }
        }

        let busy_timeout = Duration::from_millis(settings.busy_timeout_ms);

        let writer_options = SqliteConnectOptions::new()
            .filename(&settings.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(busy_timeout)
            .pragma("temp_store", "memory");

        let writer = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(settings.writer_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(writer_options)
            .await
            .map_err(|e| DatabaseError::ConnectionError(format!("Failed to open writer pool: {}", e)))?;

        let status = MigrationRunner::new(&writer).run_migrations().await?;
        debug!("{}", status.summary());

        let reader_options = SqliteConnectOptions::new()
            .filename(&settings.path)
            .read_only(true)
            .busy_timeout(busy_timeout);

        let reader = SqlitePoolOptions::new()
            .max_connections(settings.reader_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect_with(reader_options)
            .await
            .map_err(|e| DatabaseError::ConnectionError(format!("Failed to open reader pool: {}", e)))?;

        info!("✅ Time-series store connected: {}", settings.path.display());
        Ok(Self { writer, reader })
    }

    pub(crate) fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    /// Write every record in one transaction. Returns the number of rows inserted;
    /// trades already present (same `tx_ref`) are skipped.
    pub async fn write_batch(&self, records: &[Record]) -> Result<u64, DatabaseError> {
        if records.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let mut tx = self.writer.begin().await?;
        let mut inserted = 0;

        for record in records {
            let partition = record.table().granularity().key_for(record.timestamp());
            inserted += match record {
                Record::Trade(trade) => insert_trade(&mut tx, trade, &partition).await?,
                Record::Performance(metric) => insert_metric(&mut tx, metric, &partition).await?,
                Record::Protection(protection) => insert_protection(&mut tx, protection, &partition).await?,
                Record::Latency(latency) => insert_latency(&mut tx, latency, &partition).await?,
            };
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to commit batch: {}", e)))?;

        debug!(
            batch_size = records.len(),
            inserted = inserted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch written"
        );
        Ok(inserted)
    }

    pub async fn count_rows(&self, table: Table) -> Result<i64, DatabaseError> {
        let count = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {}", table.name()))
            .fetch_one(&self.reader)
            .await?;
        Ok(count)
    }

    /// Partition keys currently holding data, oldest first
    pub async fn list_partitions(&self, table: Table) -> Result<Vec<String>, DatabaseError> {
        let partitions = sqlx::query_scalar::<_, String>(&format!(
            "SELECT DISTINCT partition_key FROM {} ORDER BY partition_key",
            table.name()
        ))
        .fetch_all(&self.writer)
        .await?;
        Ok(partitions)
    }

    /// Remove a whole partition atomically. Returns the number of rows removed.
    pub async fn drop_partition(&self, table: Table, partition: &str) -> Result<u64, DatabaseError> {
        let mut tx = self.writer.begin().await?;
        let result = sqlx::query(&format!("DELETE FROM {} WHERE partition_key = ?", table.name()))
            .bind(partition)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::QueryError(format!(
                "Failed to drop partition {} of {}: {}",
                partition,
                table.name(),
                e
            )))?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

async fn insert_trade(
    tx: &mut Transaction<'static, Sqlite>,
    trade: &TradeRecord,
    partition: &str,
) -> Result<u64, DatabaseError> {
    let metadata = serde_json::to_string(&trade.metadata)
        .map_err(|e| DatabaseError::SerializationError(format!("Failed to serialize trade metadata: {}", e)))?;

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO trades (
            ts, partition_key, trader_id, mode, side, base_instrument, quote_instrument,
            amount_in, amount_out, executed_price, transaction_fee, priority_fee,
            expected_slippage_bps, actual_slippage_bps, protection_status, tx_ref, metadata
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#,
    )
    // ts is UTC microseconds; sub-microsecond precision does not survive a round trip
    .bind(trade.timestamp.timestamp_micros())
    .bind(partition)
    .bind(&trade.trader_id)
    .bind(trade.mode.as_str())
    .bind(trade.side.as_str())
    .bind(&trade.base_instrument)
    .bind(&trade.quote_instrument)
    .bind(trade.amount_in)
    .bind(trade.amount_out)
    .bind(trade.executed_price)
    .bind(trade.transaction_fee)
    .bind(trade.priority_fee)
    .bind(trade.expected_slippage_bps)
    .bind(trade.actual_slippage_bps)
    .bind(trade.protection_status.as_str())
    .bind(&trade.tx_ref)
    .bind(metadata)
    .execute(&mut **tx)
    .await
    .map_err(|e| DatabaseError::QueryError(format!("Failed to insert trade {}: {}", trade.tx_ref, e)))?;

    Ok(result.rows_affected())
}

async fn insert_metric(
    tx: &mut Transaction<'static, Sqlite>,
    metric: &MetricRecord,
    partition: &str,
) -> Result<u64, DatabaseError> {
    let result = sqlx::query(
        "INSERT INTO performance_metrics (ts, partition_key, metric_type, component, value, success) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(metric.timestamp.timestamp_micros())
    .bind(partition)
    .bind(&metric.metric_type)
    .bind(&metric.component)
    .bind(metric.value)
    .bind(metric.success)
    .execute(&mut **tx)
    .await
    .map_err(|e| DatabaseError::QueryError(format!("Failed to insert performance metric: {}", e)))?;

    Ok(result.rows_affected())
}

async fn insert_protection(
    tx: &mut Transaction<'static, Sqlite>,
    protection: &ProtectionRecord,
    partition: &str,
) -> Result<u64, DatabaseError> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO protection_metrics (
            ts, partition_key, tx_ref, instrument, status, risk_score, estimated_loss, priority_fee
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    "#,
    )
    .bind(protection.timestamp.timestamp_micros())
    .bind(partition)
    .bind(&protection.tx_ref)
    .bind(&protection.instrument)
    .bind(protection.status.as_str())
    .bind(protection.risk_score)
    .bind(protection.estimated_loss)
    .bind(protection.priority_fee)
    .execute(&mut **tx)
    .await
    .map_err(|e| DatabaseError::QueryError(format!("Failed to insert protection metric: {}", e)))?;

    Ok(result.rows_affected())
}

async fn insert_latency(
    tx: &mut Transaction<'static, Sqlite>,
    latency: &LatencyRecord,
    partition: &str,
) -> Result<u64, DatabaseError> {
    let result = sqlx::query(
        "INSERT INTO latency_metrics (ts, partition_key, service, operation, latency_ms, success) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(latency.timestamp.timestamp_micros())
    .bind(partition)
    .bind(&latency.service)
    .bind(&latency.operation)
    .bind(latency.latency_ms)
    .bind(latency.success)
    .execute(&mut **tx)
    .await
    .map_err(|e| DatabaseError::QueryError(format!("Failed to insert latency sample: {}", e)))?;

    Ok(result.rows_affected())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::core::{ProtectionStatus, TradeSide, TradingMode};
    use chrono::Utc;
    use tempfile::TempDir;

    /// Store in a throwaway directory; keep the `TempDir` alive for the test's duration
    pub async fn temp_db() -> (TempDir, TimeSeriesDb) {
        let dir = TempDir::new().unwrap();
        let settings = DatabaseSettings {
            path: dir.path().join("sentinel.db"),
            ..DatabaseSettings::default()
        };
        let db = TimeSeriesDb::connect(&settings).await.unwrap();
        (dir, db)
    }

    pub fn trade(tx_ref: &str) -> TradeRecord {
        TradeRecord {
            timestamp: Utc::now(),
            trader_id: "desk-1".to_string(),
            mode: TradingMode::Paper,
            side: TradeSide::Sell,
            base_instrument: "SOL".to_string(),
            quote_instrument: "USDC".to_string(),
            amount_in: 10.0,
            amount_out: 1130.0,
            executed_price: 113.0,
            transaction_fee: 0.000005,
            priority_fee: 0.0001,
            expected_slippage_bps: 50.0,
            actual_slippage_bps: 12.0,
            protection_status: ProtectionStatus::Succeeded,
            tx_ref: tx_ref.to_string(),
            metadata: serde_json::json!({"trigger_reason": "trailing_stop"}),
        }
    }
}
