/// Read-side operations for analysis consumers. Every query runs on the
/// read-only pool and never blocks the batch writer.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use super::client::TimeSeriesDb;
use super::models::{LatencyPercentiles, PerformanceStats, ProtectionAnalysis, TradeFilter, TradeRecord};
use super::DatabaseError;

fn window_start(window: Duration) -> Result<DateTime<Utc>, DatabaseError> {
    let window = chrono::Duration::from_std(window)
        .map_err(|e| DatabaseError::QueryError(format!("Query window out of range: {}", e)))?;
    Ok(Utc::now() - window)
}

fn trade_from_row(row: &SqliteRow) -> Result<TradeRecord, DatabaseError> {
    let ts: i64 = row.try_get("ts")?;
    let timestamp = DateTime::<Utc>::from_timestamp_micros(ts)
        .ok_or_else(|| DatabaseError::SerializationError(format!("Invalid trade timestamp: {}", ts)))?;
    let metadata: String = row.try_get("metadata")?;

    Ok(TradeRecord {
        timestamp,
        trader_id: row.try_get("trader_id")?,
        mode: row.try_get::<String, _>("mode")?.parse().map_err(DatabaseError::SerializationError)?,
        side: row.try_get::<String, _>("side")?.parse().map_err(DatabaseError::SerializationError)?,
        base_instrument: row.try_get("base_instrument")?,
        quote_instrument: row.try_get("quote_instrument")?,
        amount_in: row.try_get("amount_in")?,
        amount_out: row.try_get("amount_out")?,
        executed_price: row.try_get("executed_price")?,
        transaction_fee: row.try_get("transaction_fee")?,
        priority_fee: row.try_get("priority_fee")?,
        expected_slippage_bps: row.try_get("expected_slippage_bps")?,
        actual_slippage_bps: row.try_get("actual_slippage_bps")?,
        protection_status: row
            .try_get::<String, _>("protection_status")?
            .parse()
            .map_err(DatabaseError::SerializationError)?,
        tx_ref: row.try_get("tx_ref")?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| DatabaseError::SerializationError(format!("Invalid trade metadata: {}", e)))?,
    })
}

impl TimeSeriesDb {
    /// Trades matching `filter`, newest first
    pub async fn get_trades(&self, filter: &TradeFilter) -> Result<Vec<TradeRecord>, DatabaseError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM trades WHERE 1 = 1");

        if let Some(start) = filter.start {
            query.push(" AND ts >= ").push_bind(start.timestamp_micros());
        }
        if let Some(end) = filter.end {
            query.push(" AND ts <= ").push_bind(end.timestamp_micros());
        }
        if let Some(instrument) = &filter.instrument {
            query
                .push(" AND (base_instrument = ")
                .push_bind(instrument.clone())
                .push(" OR quote_instrument = ")
                .push_bind(instrument.clone())
                .push(")");
        }
        if let Some(trader_id) = &filter.trader_id {
            query.push(" AND trader_id = ").push_bind(trader_id.clone());
        }
        query.push(" ORDER BY ts DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = query.build().fetch_all(self.reader()).await?;
        rows.iter().map(trade_from_row).collect()
    }

    /// Distribution of one performance metric over the trailing `window`
    pub async fn get_performance_stats(
        &self,
        metric_type: &str,
        window: Duration,
    ) -> Result<PerformanceStats, DatabaseError> {
        let since = window_start(window)?;
        let samples = sqlx::query_scalar::<_, f64>(
            "SELECT value FROM performance_metrics WHERE metric_type = ? AND ts >= ? ORDER BY value",
        )
        .bind(metric_type)
        .bind(since.timestamp_micros())
        .fetch_all(self.reader())
        .await?;

        debug!(metric_type = metric_type, samples = samples.len(), "Performance stats computed");
        Ok(PerformanceStats::from_sorted(metric_type, &samples))
    }

    /// How often protection engaged and succeeded, and what it cost
    pub async fn get_protection_analysis(&self, window: Duration) -> Result<ProtectionAnalysis, DatabaseError> {
        let since = window_start(window)?;
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_trades,
                COALESCE(SUM(CASE WHEN status != 'none' THEN 1 ELSE 0 END), 0) AS engaged,
                COALESCE(SUM(CASE WHEN status = 'succeeded' THEN 1 ELSE 0 END), 0) AS succeeded,
                AVG(risk_score) AS avg_risk_score,
                TOTAL(estimated_loss) AS total_estimated_loss,
                AVG(priority_fee) AS avg_priority_fee
            FROM protection_metrics
            WHERE ts >= ?
        "#,
        )
        .bind(since.timestamp_micros())
        .fetch_one(self.reader())
        .await?;

        let total_trades: i64 = row.try_get("total_trades")?;
        let engaged: i64 = row.try_get("engaged")?;
        let succeeded: i64 = row.try_get("succeeded")?;
        let rate = |n: i64| if total_trades > 0 { n as f64 / total_trades as f64 } else { 0.0 };

        Ok(ProtectionAnalysis {
            total_trades,
            engaged_rate: rate(engaged),
            success_rate: rate(succeeded),
            avg_risk_score: row.try_get::<Option<f64>, _>("avg_risk_score")?.unwrap_or(0.0),
            total_estimated_loss: row.try_get::<Option<f64>, _>("total_estimated_loss")?.unwrap_or(0.0),
            avg_priority_fee: row.try_get::<Option<f64>, _>("avg_priority_fee")?.unwrap_or(0.0),
        })
    }

    /// Latency percentiles over successful operations only
    pub async fn get_latency_percentiles(
        &self,
        service: &str,
        operation: &str,
        window: Duration,
    ) -> Result<LatencyPercentiles, DatabaseError> {
        let since = window_start(window)?;
        let samples = sqlx::query_scalar::<_, f64>(
            r#"
            SELECT latency_ms FROM latency_metrics
            WHERE service = ? AND operation = ? AND success = 1 AND ts >= ?
            ORDER BY latency_ms
        "#,
        )
        .bind(service)
        .bind(operation)
        .bind(since.timestamp_micros())
        .fetch_all(self.reader())
        .await?;

        Ok(LatencyPercentiles::from_sorted(service, operation, &samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ProtectionStatus;
    use crate::database::client::test_support::{temp_db, trade};
    use crate::database::models::{LatencyRecord, MetricRecord, ProtectionRecord, Record};

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_trade_timestamps_round_trip_at_microsecond_precision() {
        let (_dir, db) = temp_db().await;
        let mut t = trade("tx-precise");
        t.timestamp = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        db.write_batch(&[Record::Trade(t)]).await.unwrap();

        let stored = db.get_trades(&TradeFilter::new()).await.unwrap();
        assert_eq!(
            stored[0].timestamp,
            DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_000).unwrap()
        );
    }

    #[tokio::test]
    async fn test_get_trades_newest_first_with_filters() {
        let (_dir, db) = temp_db().await;
        let now = Utc::now();

        let mut batch = Vec::new();
        for i in 0..5 {
            let mut t = trade(&format!("tx-{}", i));
            t.timestamp = now - chrono::Duration::minutes(10 - i);
            if i == 4 {
                t.base_instrument = "BONK".to_string();
                t.trader_id = "desk-2".to_string();
            }
            batch.push(Record::Trade(t));
        }
        db.write_batch(&batch).await.unwrap();

        let all = db.get_trades(&TradeFilter::new()).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].tx_ref, "tx-4");
        assert!(all.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        let sol = db.get_trades(&TradeFilter::new().instrument("SOL").limit(2)).await.unwrap();
        assert_eq!(sol.iter().map(|t| t.tx_ref.as_str()).collect::<Vec<_>>(), vec!["tx-3", "tx-2"]);

        let desk2 = db.get_trades(&TradeFilter::new().trader("desk-2")).await.unwrap();
        assert_eq!(desk2.len(), 1);
        assert_eq!(desk2[0].protection_status, ProtectionStatus::Succeeded);

        let recent = db
            .get_trades(&TradeFilter::new().since(now - chrono::Duration::minutes(7)).until(now))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_performance_stats_respects_window() {
        let (_dir, db) = temp_db().await;
        let mut batch: Vec<Record> = (1..=100)
            .map(|v| Record::Performance(MetricRecord::new("tick_duration_ms", "monitor", v as f64, true)))
            .collect();
        let mut stale = MetricRecord::new("tick_duration_ms", "monitor", 10_000.0, true);
        stale.timestamp = Utc::now() - chrono::Duration::hours(5);
        batch.push(Record::Performance(stale));
        db.write_batch(&batch).await.unwrap();

        let stats = db.get_performance_stats("tick_duration_ms", HOUR).await.unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert_eq!(stats.p50, 50.0);
        assert_eq!(stats.p95, 95.0);
        assert_eq!(stats.p99, 99.0);
        assert!((stats.mean - 50.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_protection_analysis() {
        let (_dir, db) = temp_db().await;
        let statuses = [
            ProtectionStatus::Succeeded,
            ProtectionStatus::Succeeded,
            ProtectionStatus::Failed,
            ProtectionStatus::None,
        ];
        let batch: Vec<Record> = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                Record::Protection(ProtectionRecord {
                    timestamp: Utc::now(),
                    tx_ref: format!("tx-{}", i),
                    instrument: "SOL".to_string(),
                    status: *status,
                    risk_score: 10.0 * (i as f64 + 1.0),
                    estimated_loss: 0.5,
                    priority_fee: 0.001,
                })
            })
            .collect();
        db.write_batch(&batch).await.unwrap();

        let analysis = db.get_protection_analysis(HOUR).await.unwrap();
        assert_eq!(analysis.total_trades, 4);
        assert!((analysis.engaged_rate - 0.75).abs() < 1e-9);
        assert!((analysis.success_rate - 0.5).abs() < 1e-9);
        assert!((analysis.avg_risk_score - 25.0).abs() < 1e-9);
        assert!((analysis.total_estimated_loss - 2.0).abs() < 1e-9);
        assert!((analysis.avg_priority_fee - 0.001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_protection_analysis_empty_window() {
        let (_dir, db) = temp_db().await;
        let analysis = db.get_protection_analysis(HOUR).await.unwrap();
        assert_eq!(analysis.total_trades, 0);
        assert_eq!(analysis.engaged_rate, 0.0);
        assert_eq!(analysis.avg_risk_score, 0.0);
    }

    #[tokio::test]
    async fn test_latency_percentiles_ignore_failures() {
        let (_dir, db) = temp_db().await;
        let mut batch: Vec<Record> = (1..=1000)
            .map(|v| Record::Latency(LatencyRecord::new("executor", "execute_trade", v as f64, true)))
            .collect();
        batch.push(Record::Latency(LatencyRecord::new("executor", "execute_trade", 99_999.0, false)));
        batch.push(Record::Latency(LatencyRecord::new("price_source", "get_price", 0.1, true)));
        db.write_batch(&batch).await.unwrap();

        let latency = db.get_latency_percentiles("executor", "execute_trade", HOUR).await.unwrap();
        assert_eq!(latency.count, 1000);
        assert_eq!(latency.p50, 500.0);
        assert_eq!(latency.p95, 950.0);
        assert_eq!(latency.p99, 990.0);
        assert_eq!(latency.p999, 999.0);
    }
}
