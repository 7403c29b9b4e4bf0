// SQLite persistence layer for clustered player records.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::is_sql_identifier;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The durable per-player record. `metrics` is keyed by persisted field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedPlayerRecord {
    pub player_id: String,
    pub first_name: String,
    pub last_name: String,
    pub metrics: BTreeMap<String, Decimal>,
    pub cluster: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        source: rusqlite::Error,
    },

    #[error("`{0}` is not a valid SQL identifier")]
    InvalidIdentifier(String),

    #[error("record for player {player_id} has no value for field `{field}`")]
    MissingField { player_id: String, field: String },

    #[error("record for player {player_id} has unknown field `{field}`")]
    UnknownField { player_id: String, field: String },

    #[error("{context}: {source}")]
    Sqlite {
        context: &'static str,
        source: rusqlite::Error,
    },
}

fn sql(context: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |source| StoreError::Sqlite { context, source }
}

// ---------------------------------------------------------------------------
// PlayerStore
// ---------------------------------------------------------------------------

/// SQLite-backed store of one record per player, keyed by `player_id` and
/// indexed by `cluster`.
///
/// The table layout is fixed at open time from the configured metric fields:
/// one TEXT column per field holding the 2-place decimal string.
pub struct PlayerStore {
    conn: Mutex<Connection>,
    table: String,
    fields: Vec<String>,
    select_columns: String,
    upsert_sql: String,
}

impl PlayerStore {
    /// Open (or create) the database at `path` and ensure `table` exists with
    /// a column for every entry in `fields`. Pass `":memory:"` for an
    /// ephemeral in-memory database.
    pub fn open(path: &str, table: &str, fields: &[String]) -> Result<Self, StoreError> {
        if !is_sql_identifier(table) {
            return Err(StoreError::InvalidIdentifier(table.to_string()));
        }
        if let Some(bad) = fields.iter().find(|f| !is_sql_identifier(f)) {
            return Err(StoreError::InvalidIdentifier(bad.clone()));
        }

        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_string(),
            source,
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(sql("failed to set database pragmas"))?;

        let metric_columns: String = fields
            .iter()
            .map(|f| format!("{f} TEXT,\n"))
            .collect();
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {table} (
                player_id  TEXT PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name  TEXT NOT NULL,
                {metric_columns}
                cluster    INTEGER NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_cluster ON {table}(cluster);
            "
        ))
        .map_err(sql("failed to create player table"))?;

        Self::add_missing_metric_columns(&conn, table, fields)?;

        let select_columns = std::iter::once("player_id")
            .chain(["first_name", "last_name", "cluster"])
            .chain(fields.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(", ");

        let placeholders = (1..=fields.len() + 4)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = ["first_name", "last_name", "cluster"]
            .into_iter()
            .chain(fields.iter().map(String::as_str))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(",\n                ");
        let upsert_sql = format!(
            "INSERT INTO {table} ({select_columns})
             VALUES ({placeholders})
             ON CONFLICT(player_id) DO UPDATE SET
                {updates},
                updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
            fields: fields.to_vec(),
            select_columns,
            upsert_sql,
        })
    }

    /// Add a TEXT column for every configured field the existing table lacks.
    /// Rows written before the migration read back without that metric.
    fn add_missing_metric_columns(
        conn: &Connection,
        table: &str,
        fields: &[String],
    ) -> Result<(), StoreError> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .map_err(sql("failed to inspect player table"))?;
        let existing: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(sql("failed to inspect player table"))?
            .collect::<Result<_, _>>()
            .map_err(sql("failed to read player table columns"))?;

        for field in fields.iter().filter(|f| !existing.contains(*f)) {
            info!("adding column `{}` to table `{}`", field, table);
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {field} TEXT;"))
                .map_err(sql("failed to add metric column"))?;
        }
        Ok(())
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock).
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Insert a record or overwrite the existing row with the same
    /// `player_id`. The record must carry exactly the configured fields.
    pub fn upsert(&self, record: &PersistedPlayerRecord) -> Result<(), StoreError> {
        if let Some(extra) = record.metrics.keys().find(|k| !self.fields.contains(k)) {
            return Err(StoreError::UnknownField {
                player_id: record.player_id.clone(),
                field: extra.clone(),
            });
        }

        let mut values: Vec<Value> = Vec::with_capacity(self.fields.len() + 4);
        values.push(Value::Text(record.player_id.clone()));
        values.push(Value::Text(record.first_name.clone()));
        values.push(Value::Text(record.last_name.clone()));
        values.push(Value::Integer(record.cluster));
        for field in &self.fields {
            let value = record
                .metrics
                .get(field)
                .ok_or_else(|| StoreError::MissingField {
                    player_id: record.player_id.clone(),
                    field: field.clone(),
                })?;
            values.push(Value::Text(value.to_string()));
        }

        let conn = self.conn();
        conn.execute(&self.upsert_sql, params_from_iter(values))
            .map_err(sql("failed to upsert player"))?;
        debug!("upserted player {} (cluster {})", record.player_id, record.cluster);
        Ok(())
    }

    /// Look up one record by primary key.
    pub fn get(&self, player_id: &str) -> Result<Option<PersistedPlayerRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM {} WHERE player_id = ?1",
                self.select_columns, self.table
            ))
            .map_err(sql("failed to prepare player lookup"))?;
        stmt.query_row(params![player_id], |row| self.map_row(row))
            .optional()
            .map_err(sql("failed to look up player"))
    }

    /// All records in `cluster`, ordered by `player_id`, optionally excluding
    /// one player, capped at `limit`.
    pub fn by_cluster(
        &self,
        cluster: i64,
        exclude: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PersistedPlayerRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM {}
                 WHERE cluster = ?1 AND (?2 IS NULL OR player_id != ?2)
                 ORDER BY player_id
                 LIMIT ?3",
                self.select_columns, self.table
            ))
            .map_err(sql("failed to prepare cluster query"))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map(params![cluster, exclude, limit], |row| self.map_row(row))
            .map_err(sql("failed to query cluster"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql("failed to map cluster rows"))?;
        Ok(records)
    }

    /// Players sharing `player_id`'s cluster, excluding the player itself.
    /// Returns `None` if the player is not in the store.
    pub fn similar_to(
        &self,
        player_id: &str,
        limit: usize,
    ) -> Result<Option<Vec<PersistedPlayerRecord>>, StoreError> {
        let Some(player) = self.get(player_id)? else {
            return Ok(None);
        };
        self.by_cluster(player.cluster, Some(player_id), limit)
            .map(Some)
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| {
                row.get(0)
            })
            .map_err(sql("failed to count players"))?;
        Ok(count as usize)
    }

    /// Record count per cluster, ordered by cluster id.
    pub fn cluster_sizes(&self) -> Result<Vec<(i64, usize)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT cluster, COUNT(*) FROM {} GROUP BY cluster ORDER BY cluster",
                self.table
            ))
            .map_err(sql("failed to prepare cluster size query"))?;
        let sizes = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as usize))
            })
            .map_err(sql("failed to query cluster sizes"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql("failed to map cluster sizes"))?;
        Ok(sizes)
    }

    fn map_row(&self, row: &Row<'_>) -> rusqlite::Result<PersistedPlayerRecord> {
        let mut metrics = BTreeMap::new();
        for (offset, field) in self.fields.iter().enumerate() {
            let idx = offset + 4;
            let Some(text) = row.get::<_, Option<String>>(idx)? else {
                continue;
            };
            let value = Decimal::from_str(&text).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            })?;
            metrics.insert(field.clone(), value);
        }
        Ok(PersistedPlayerRecord {
            player_id: row.get(0)?,
            first_name: row.get(1)?,
            last_name: row.get(2)?,
            cluster: row.get(3)?,
            metrics,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
