//! SQLite address store and the atomic staging-and-swap reconciler.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use aris_core::{ImportRun, ImportStats, NormalizedAddress, StoredAddress};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aris-storage";

pub const ADDRESS_TABLE: &str = "addresses";
pub const STAGING_TABLE: &str = "addresses_staging";
pub const OLD_TABLE: &str = "addresses_old";

const ADDRESS_COLUMNS: &str = "street_name, house_number, postal_code, sector, assigned_to, \
     latitude, longitude, addr_key, created_at, updated_at";

fn address_table_ddl(table: &str, if_not_exists: bool) -> String {
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    format!(
        r#"
        CREATE TABLE {guard}{table} (
            id INTEGER PRIMARY KEY,
            street_name TEXT NOT NULL,
            house_number TEXT NOT NULL,
            postal_code TEXT,
            sector TEXT,
            assigned_to TEXT,
            latitude REAL,
            longitude REAL,
            addr_key TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#
    )
}

const IMPORT_RUNS_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS import_runs (
        run_id TEXT PRIMARY KEY,
        city TEXT NOT NULL,
        source_file TEXT NOT NULL,
        source_sha256 TEXT NOT NULL,
        total_imported INTEGER NOT NULL,
        preserved_assignments INTEGER NOT NULL,
        new_unassigned INTEGER NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL
    )
"#;

/// Step of the reconciliation transaction an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStage {
    Begin,
    ReadAssignments,
    BuildStaging,
    PreSwap,
    Swap,
    AuditLog,
    Commit,
}

impl fmt::Display for SwapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwapStage::Begin => "begin",
            SwapStage::ReadAssignments => "read-assignments",
            SwapStage::BuildStaging => "build-staging",
            SwapStage::PreSwap => "pre-swap",
            SwapStage::Swap => "swap",
            SwapStage::AuditLog => "audit-log",
            SwapStage::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Failure of a reconciliation. The live table is left as it was.
#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("duplicate addr_key `{addr_key}` while building the staging table")]
    DuplicateKey { addr_key: String },
    #[error("reconciliation aborted at {stage}: {reason}")]
    Aborted { stage: SwapStage, reason: String },
    #[error("database error at {stage}: {source}")]
    Database {
        stage: SwapStage,
        #[source]
        source: sqlx::Error,
    },
}

impl ReconciliationError {
    pub fn stage(&self) -> SwapStage {
        match self {
            ReconciliationError::DuplicateKey { .. } => SwapStage::BuildStaging,
            ReconciliationError::Aborted { stage, .. } => *stage,
            ReconciliationError::Database { stage, .. } => *stage,
        }
    }
}

fn db_error(stage: SwapStage) -> impl FnOnce(sqlx::Error) -> ReconciliationError {
    move |source| ReconciliationError::Database { stage, source }
}

/// Runs once the staging table is fully built, just before the rename swap.
/// Returning an error aborts and rolls back the whole reconciliation.
#[async_trait]
pub trait SwapHook: Send + Sync {
    async fn before_swap(&self, staged_rows: usize) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct NoopSwapHook;

#[async_trait]
impl SwapHook for NoopSwapHook {
    async fn before_swap(&self, _staged_rows: usize) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Provenance recorded in `import_runs` in the same transaction as the swap.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub city: String,
    pub source_file: String,
    pub source_sha256: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub addresses: usize,
    pub assigned: usize,
    pub geocoded: usize,
    pub last_run: Option<ImportRun>,
}

pub struct AddressStore {
    pool: SqlitePool,
    hook: Box<dyn SwapHook>,
}

impl fmt::Debug for AddressStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressStore").finish_non_exhaustive()
    }
}

impl AddressStore {
    /// Open (creating if needed) the database at `database_url` and ensure the schema.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database,
        // so it must be a single connection that is never recycled.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;

        let store = Self::from_pool(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            hook: Box::<NoopSwapHook>::default(),
        }
    }

    pub fn with_swap_hook(mut self, hook: Box<dyn SwapHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(&address_table_ddl(ADDRESS_TABLE, true))
            .execute(&self.pool)
            .await
            .context("creating addresses table")?;
        sqlx::query(IMPORT_RUNS_DDL)
            .execute(&self.pool)
            .await
            .context("creating import_runs table")?;
        Ok(())
    }

    /// Replace the whole address table with `records`, carrying assignments over by key.
    pub async fn reconcile(
        &self,
        records: &[NormalizedAddress],
    ) -> Result<ImportStats, ReconciliationError> {
        self.reconcile_inner(records, None).await
    }

    /// Same as [`reconcile`](Self::reconcile), also recording the run in `import_runs`.
    pub async fn reconcile_with_audit(
        &self,
        records: &[NormalizedAddress],
        run: &RunContext,
    ) -> Result<ImportStats, ReconciliationError> {
        self.reconcile_inner(records, Some(run)).await
    }

    async fn reconcile_inner(
        &self,
        records: &[NormalizedAddress],
        run: Option<&RunContext>,
    ) -> Result<ImportStats, ReconciliationError> {
        let span = info_span!("reconcile", records = records.len());
        async move {
            let mut tx = self.pool.begin().await.map_err(db_error(SwapStage::Begin))?;

            match self.stage_and_swap(&mut tx, records, run).await {
                Ok(stats) => {
                    tx.commit().await.map_err(db_error(SwapStage::Commit))?;
                    info!(
                        total = stats.total_imported,
                        preserved = stats.preserved_assignments,
                        unassigned = stats.new_unassigned,
                        "address table swapped"
                    );
                    Ok(stats)
                }
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "explicit rollback failed; dropping transaction");
                    }
                    warn!(error = %err, stage = %err.stage(), "reconciliation rolled back");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn stage_and_swap(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        records: &[NormalizedAddress],
        run: Option<&RunContext>,
    ) -> Result<ImportStats, ReconciliationError> {
        let assignments = fetch_assignments(&mut **tx)
            .await
            .map_err(db_error(SwapStage::ReadAssignments))?;
        debug!(carried = assignments.len(), "loaded existing assignments");

        let preserved = build_staging(&mut **tx, records, &assignments).await?;

        self.hook
            .before_swap(records.len())
            .await
            .map_err(|err| ReconciliationError::Aborted {
                stage: SwapStage::PreSwap,
                reason: format!("{err:#}"),
            })?;

        for statement in [
            format!("DROP TABLE IF EXISTS {OLD_TABLE}"),
            format!("ALTER TABLE {ADDRESS_TABLE} RENAME TO {OLD_TABLE}"),
            format!("ALTER TABLE {STAGING_TABLE} RENAME TO {ADDRESS_TABLE}"),
            format!("DROP TABLE {OLD_TABLE}"),
        ] {
            sqlx::query(&statement)
                .execute(&mut **tx)
                .await
                .map_err(db_error(SwapStage::Swap))?;
        }

        let stats = ImportStats::new(records.len(), preserved);

        if let Some(run) = run {
            sqlx::query(
                r#"
                INSERT INTO import_runs (
                    run_id, city, source_file, source_sha256,
                    total_imported, preserved_assignments, new_unassigned,
                    started_at, finished_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run.run_id.to_string())
            .bind(&run.city)
            .bind(&run.source_file)
            .bind(&run.source_sha256)
            .bind(stats.total_imported as i64)
            .bind(stats.preserved_assignments as i64)
            .bind(stats.new_unassigned as i64)
            .bind(run.started_at)
            .bind(Utc::now())
            .execute(&mut **tx)
            .await
            .map_err(db_error(SwapStage::AuditLog))?;
        }

        Ok(stats)
    }

    /// Current `addr_key -> assigned_to` for rows with a non-empty assignment.
    pub async fn assignment_map(&self) -> anyhow::Result<HashMap<String, String>> {
        let mut conn = self.pool.acquire().await.context("acquiring connection")?;
        fetch_assignments(&mut conn)
            .await
            .context("reading assignments")
    }

    pub async fn list_addresses(&self) -> anyhow::Result<Vec<StoredAddress>> {
        let rows = sqlx::query(&format!(
            "SELECT {ADDRESS_COLUMNS} FROM {ADDRESS_TABLE} ORDER BY addr_key"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing addresses")?;
        rows.iter().map(stored_address_from_row).collect()
    }

    pub async fn count_addresses(&self) -> anyhow::Result<usize> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {ADDRESS_TABLE}"))
            .fetch_one(&self.pool)
            .await
            .context("counting addresses")?;
        Ok(count as usize)
    }

    /// Set or clear the team responsible for one address. Returns whether a row matched.
    pub async fn assign(&self, addr_key: &str, team: Option<&str>) -> anyhow::Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {ADDRESS_TABLE} SET assigned_to = ?, updated_at = ? WHERE addr_key = ?"
        ))
        .bind(team)
        .bind(Utc::now())
        .bind(addr_key)
        .execute(&self.pool)
        .await
        .with_context(|| format!("assigning {addr_key}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_geocode(
        &self,
        addr_key: &str,
        latitude: f64,
        longitude: f64,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {ADDRESS_TABLE} SET latitude = ?, longitude = ?, updated_at = ? WHERE addr_key = ?"
        ))
        .bind(latitude)
        .bind(longitude)
        .bind(Utc::now())
        .bind(addr_key)
        .execute(&self.pool)
        .await
        .with_context(|| format!("geocoding {addr_key}"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn recent_runs(&self, limit: usize) -> anyhow::Result<Vec<ImportRun>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, city, source_file, source_sha256,
                   total_imported, preserved_assignments, new_unassigned,
                   started_at, finished_at
              FROM import_runs
             ORDER BY finished_at DESC
             LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("listing import runs")?;
        rows.iter().map(import_run_from_row).collect()
    }

    pub async fn status(&self) -> anyhow::Result<StoreStatus> {
        let row = sqlx::query(&format!(
            r#"
            SELECT COUNT(*) AS addresses,
                   COUNT(NULLIF(TRIM(assigned_to), '')) AS assigned,
                   COUNT(latitude) AS geocoded
              FROM {ADDRESS_TABLE}
            "#
        ))
        .fetch_one(&self.pool)
        .await
        .context("summarizing addresses")?;
        let last_run = self.recent_runs(1).await?.into_iter().next();
        Ok(StoreStatus {
            addresses: row.try_get::<i64, _>("addresses")? as usize,
            assigned: row.try_get::<i64, _>("assigned")? as usize,
            geocoded: row.try_get::<i64, _>("geocoded")? as usize,
            last_run,
        })
    }

    pub async fn table_exists(&self, table: &str) -> anyhow::Result<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("looking up table {table}"))?;
        Ok(found.is_some())
    }
}

async fn fetch_assignments(
    conn: &mut SqliteConnection,
) -> Result<HashMap<String, String>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT addr_key, assigned_to FROM {ADDRESS_TABLE} \
         WHERE assigned_to IS NOT NULL AND TRIM(assigned_to) <> ''"
    ))
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<(String, String), sqlx::Error> {
            Ok((row.try_get("addr_key")?, row.try_get("assigned_to")?))
        })
        .collect()
}

/// Create and fill the staging table. Returns how many records kept an assignment.
async fn build_staging(
    conn: &mut SqliteConnection,
    records: &[NormalizedAddress],
    assignments: &HashMap<String, String>,
) -> Result<usize, ReconciliationError> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {STAGING_TABLE}"))
        .execute(&mut *conn)
        .await
        .map_err(db_error(SwapStage::BuildStaging))?;
    sqlx::query(&address_table_ddl(STAGING_TABLE, false))
        .execute(&mut *conn)
        .await
        .map_err(db_error(SwapStage::BuildStaging))?;

    let insert = format!(
        "INSERT INTO {STAGING_TABLE} ({ADDRESS_COLUMNS}) VALUES (?, ?, ?, ?, ?, NULL, NULL, ?, ?, ?)"
    );
    let now = Utc::now();
    let mut preserved = 0usize;

    for record in records {
        let assigned_to = assignments.get(&record.addr_key);
        if assigned_to.is_some() {
            preserved += 1;
        }
        let result = sqlx::query(&insert)
            .bind(&record.street_name)
            .bind(&record.house_number)
            .bind(&record.postal_code)
            .bind(&record.sector)
            .bind(assigned_to)
            .bind(&record.addr_key)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(ReconciliationError::DuplicateKey {
                    addr_key: record.addr_key.clone(),
                });
            }
            Err(err) => return Err(db_error(SwapStage::BuildStaging)(err)),
        }
    }

    Ok(preserved)
}

fn stored_address_from_row(row: &SqliteRow) -> anyhow::Result<StoredAddress> {
    Ok(StoredAddress {
        street_name: row.try_get("street_name")?,
        house_number: row.try_get("house_number")?,
        postal_code: row.try_get("postal_code")?,
        sector: row.try_get("sector")?,
        addr_key: row.try_get("addr_key")?,
        assigned_to: row.try_get("assigned_to")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn import_run_from_row(row: &SqliteRow) -> anyhow::Result<ImportRun> {
    let run_id: String = row.try_get("run_id")?;
    let total: i64 = row.try_get("total_imported")?;
    let preserved: i64 = row.try_get("preserved_assignments")?;
    Ok(ImportRun {
        run_id: Uuid::parse_str(&run_id).with_context(|| format!("parsing run id {run_id}"))?,
        city: row.try_get("city")?,
        source_file: row.try_get("source_file")?,
        source_sha256: row.try_get("source_sha256")?,
        stats: ImportStats::new(total as usize, preserved as usize),
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}
