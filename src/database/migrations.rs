/// Database Migration System
///
/// Schema for the four time-series tables is embedded in the binary and
/// applied in version order. Applied versions are recorded in
/// `schema_migrations`, so running the migrations again is a no-op.

use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use super::partition::Table;
use super::DatabaseError;

/// An embedded migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Migration version (e.g., 001)
    pub version: &'static str,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "001",
        name: "create_time_series_tables",
        statements: &[
            r#"CREATE TABLE IF NOT EXISTS trades (
                ts INTEGER NOT NULL,
                partition_key TEXT NOT NULL,
                trader_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                side TEXT NOT NULL,
                base_instrument TEXT NOT NULL,
                quote_instrument TEXT NOT NULL,
                amount_in REAL NOT NULL,
                amount_out REAL NOT NULL,
                executed_price REAL NOT NULL,
                transaction_fee REAL NOT NULL,
                priority_fee REAL NOT NULL,
                expected_slippage_bps REAL NOT NULL,
                actual_slippage_bps REAL NOT NULL,
                protection_status TEXT NOT NULL,
                tx_ref TEXT NOT NULL UNIQUE,
                metadata TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades (ts)",
            "CREATE INDEX IF NOT EXISTS idx_trades_partition ON trades (partition_key)",
            r#"CREATE TABLE IF NOT EXISTS performance_metrics (
                ts INTEGER NOT NULL,
                partition_key TEXT NOT NULL,
                metric_type TEXT NOT NULL,
                component TEXT NOT NULL,
                value REAL NOT NULL,
                success INTEGER NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_performance_metrics_ts ON performance_metrics (metric_type, ts)",
            "CREATE INDEX IF NOT EXISTS idx_performance_metrics_partition ON performance_metrics (partition_key)",
            r#"CREATE TABLE IF NOT EXISTS protection_metrics (
                ts INTEGER NOT NULL,
                partition_key TEXT NOT NULL,
                tx_ref TEXT NOT NULL,
                instrument TEXT NOT NULL,
                status TEXT NOT NULL,
                risk_score REAL NOT NULL,
                estimated_loss REAL NOT NULL,
                priority_fee REAL NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_protection_metrics_ts ON protection_metrics (ts)",
            "CREATE INDEX IF NOT EXISTS idx_protection_metrics_partition ON protection_metrics (partition_key)",
            r#"CREATE TABLE IF NOT EXISTS latency_metrics (
                ts INTEGER NOT NULL,
                partition_key TEXT NOT NULL,
                service TEXT NOT NULL,
                operation TEXT NOT NULL,
                latency_ms REAL NOT NULL,
                success INTEGER NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_latency_metrics_ts ON latency_metrics (service, operation, ts)",
            "CREATE INDEX IF NOT EXISTS idx_latency_metrics_partition ON latency_metrics (partition_key)",
        ],
    },
    Migration {
        version: "002",
        name: "protection_metrics_tx_ref",
        statements: &[
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_protection_metrics_tx_ref ON protection_metrics (tx_ref)",
        ],
    },
];

/// Migration system for database schema management
pub struct MigrationRunner<'a> {
    pool: &'a SqlitePool,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize migration system and run pending migrations
    pub async fn run_migrations(&self) -> Result<MigrationStatus, DatabaseError> {
        self.create_migrations_table().await?;

        let applied = self.get_applied_migrations().await?;
        let mut applied_count = 0;

        for migration in MIGRATIONS {
            match applied.iter().find(|(version, _)| version == migration.version) {
                Some((_, checksum)) => {
                    if *checksum != calculate_checksum(migration) {
                        warn!(
                            version = migration.version,
                            "Applied migration checksum differs from embedded schema"
                        );
                    }
                }
                None => {
                    info!("🔄 Applying migration: {} - {}", migration.version, migration.name);
                    self.apply_migration(migration).await?;
                    applied_count += 1;
                }
            }
        }

        if applied_count > 0 {
            info!("✅ Applied {} new migrations successfully", applied_count);
        } else {
            debug!("Database schema is up to date");
        }

        self.verify_schema().await?;
        self.get_migration_status().await
    }

    async fn create_migrations_table(&self) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                checksum TEXT NOT NULL
            )
        "#,
        )
        .execute(self.pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create migrations table: {}", e)))?;

        Ok(())
    }

    async fn get_applied_migrations(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let rows = sqlx::query("SELECT version, checksum FROM schema_migrations ORDER BY version")
            .fetch_all(self.pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to read applied migrations: {}", e)))?;

        rows.iter()
            .map(|row| -> Result<(String, String), sqlx::Error> {
                Ok((row.try_get("version")?, row.try_get("checksum")?))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(DatabaseError::from)
    }

    /// Apply one migration and record it, all inside a single transaction
    async fn apply_migration(&self, migration: &Migration) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        for (i, statement) in migration.statements.iter().enumerate() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| DatabaseError::MigrationError(format!(
                    "Failed to execute migration {} statement {}: {}",
                    migration.version,
                    i + 1,
                    e
                )))?;
        }

        sqlx::query("INSERT INTO schema_migrations (version, name, checksum) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(calculate_checksum(migration))
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to record migration: {}", e)))?;

        tx.commit().await?;
        info!("✅ Migration {} applied successfully", migration.version);
        Ok(())
    }

    async fn verify_schema(&self) -> Result<(), DatabaseError> {
        for table in Table::ALL {
            let count = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table.name())
            .fetch_one(self.pool)
            .await?;

            if count == 0 {
                return Err(DatabaseError::MigrationError(format!(
                    "Required table '{}' is missing",
                    table.name()
                )));
            }
        }
        Ok(())
    }

    pub async fn get_migration_status(&self) -> Result<MigrationStatus, DatabaseError> {
        let applied: Vec<String> = self
            .get_applied_migrations()
            .await?
            .into_iter()
            .map(|(version, _)| version)
            .collect();

        let pending_versions: Vec<String> = MIGRATIONS
            .iter()
            .filter(|m| !applied.iter().any(|v| v == m.version))
            .map(|m| m.version.to_string())
            .collect();

        Ok(MigrationStatus {
            applied_count: applied.len(),
            pending_count: pending_versions.len(),
            total_available: MIGRATIONS.len(),
            latest_applied: applied.last().cloned(),
            pending_versions,
        })
    }
}

/// Simple checksum for migration integrity
fn calculate_checksum(migration: &Migration) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    migration.statements.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Migration system status
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub applied_count: usize,
    pub pending_count: usize,
    pub total_available: usize,
    pub latest_applied: Option<String>,
    pub pending_versions: Vec<String>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    pub fn summary(&self) -> String {
        if self.is_up_to_date() {
            format!("✅ Database is up to date ({} migrations applied)", self.applied_count)
        } else {
            format!(
                "🔄 {} pending migrations (applied: {}, total: {})",
                self.pending_count, self.applied_count, self.total_available
            )
        }
    }
}
