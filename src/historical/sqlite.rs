//! SQLite-backed historical store
//!
//! Opens the database read-only and re-checks every statement with the
//! read-only guard before it reaches the driver.

use super::query::ensure_read_only;
use super::{QueryError, QueryExecutor, SchemaResolver};
use crate::models::TabularResult;
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::{debug, info};

const SAMPLE_ROWS: usize = 3;

#[derive(Clone)]
pub struct SqliteHistoricalStore {
    pool: SqlitePool,
}

impl SqliteHistoricalStore {
    /// Lazily connects; the file is opened read-only on first use.
    pub fn connect(url: &str) -> Result<Self, QueryError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| QueryError::Execution(format!("invalid database url: {}", e)))?
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_lazy_with(options);

        info!(url = %url, "Historical store: sqlite (read-only)");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, query: &str) -> Result<TabularResult, QueryError> {
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueryError::Execution(e.to_string()))?;

        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let rows = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TabularResult { columns, rows })
    }
}

fn decode_row(row: &SqliteRow) -> Result<Vec<Value>, QueryError> {
    let decode_err = |e: sqlx::Error| QueryError::Execution(e.to_string());

    (0..row.len())
        .map(|i| {
            let raw = row.try_get_raw(i).map_err(decode_err)?;
            if raw.is_null() {
                return Ok(Value::Null);
            }
            let type_name = raw.type_info().name().to_string();

            // SQLite reports the storage class of the value, not the declared column type.
            let value = match type_name.as_str() {
                "INTEGER" => json!(row.try_get_unchecked::<i64, _>(i).map_err(decode_err)?),
                "REAL" => json!(row.try_get_unchecked::<f64, _>(i).map_err(decode_err)?),
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(i).map_err(decode_err)?;
                    json!(format!("<{} bytes>", bytes.len()))
                }
                _ => json!(row.try_get_unchecked::<String, _>(i).map_err(decode_err)?),
            };
            Ok(value)
        })
        .collect()
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl QueryExecutor for SqliteHistoricalStore {
    async fn execute(&self, query: &str) -> Result<TabularResult, QueryError> {
        ensure_read_only(query)?;
        debug!(query = %query, "Executing historical query");
        self.fetch(query).await
    }
}

#[async_trait]
impl SchemaResolver for SqliteHistoricalStore {
    async fn tables(&self) -> Result<Vec<String>, QueryError> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueryError::Execution(e.to_string()))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("name")
                    .map_err(|e| QueryError::Execution(e.to_string()))
            })
            .collect()
    }

    /// CREATE statements plus a few sample rows per table.
    async fn schema(&self, tables: &[String]) -> Result<String, QueryError> {
        let mut sections = Vec::with_capacity(tables.len());

        for table in tables {
            let ddl: Option<String> = sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| QueryError::Execution(e.to_string()))?;

            let ddl = ddl.ok_or_else(|| QueryError::Execution(format!("no such table: {}", table)))?;

            let sample = self
                .fetch(&format!(
                    "SELECT * FROM {} LIMIT {}",
                    quote_identifier(table),
                    SAMPLE_ROWS
                ))
                .await?;

            sections.push(format!(
                "{}\n\n/*\n{} rows from {} table:\n{}*/",
                ddl.trim(),
                sample.rows.len(),
                table,
                sample.render()
            ));
        }

        Ok(sections.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteHistoricalStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query("CREATE TABLE prices (ticker TEXT NOT NULL, date TEXT NOT NULL, close REAL, volume INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        for (ticker, date, close, volume) in [
            ("MSFT", "2021-06-30", 270.9, 21_000_000_i64),
            ("MSFT", "2022-09-30", 232.9, 35_000_000),
            ("AAPL", "2022-09-30", 138.2, 124_000_000),
        ] {
            sqlx::query("INSERT INTO prices VALUES (?, ?, ?, ?)")
                .bind(ticker)
                .bind(date)
                .bind(close)
                .bind(volume)
                .execute(&pool)
                .await
                .unwrap();
        }

        SqliteHistoricalStore::from_pool(pool)
    }

    #[tokio::test]
    async fn executes_select_and_decodes_storage_classes() {
        let store = store().await;

        let result = store
            .execute("SELECT ticker, close, volume, NULL AS note FROM prices WHERE ticker = 'MSFT' ORDER BY date")
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["ticker", "close", "volume", "note"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0], vec![json!("MSFT"), json!(270.9), json!(21_000_000), Value::Null]);
    }

    #[tokio::test]
    async fn write_statements_never_reach_the_database() {
        let store = store().await;

        let err = store.execute("DELETE FROM prices").await.unwrap_err();
        assert!(matches!(err, QueryError::Rejected(_)));

        let count = store.execute("SELECT COUNT(*) AS n FROM prices").await.unwrap();
        assert_eq!(count.rows[0][0], json!(3));
    }

    #[tokio::test]
    async fn driver_errors_are_execution_errors() {
        let store = store().await;
        let err = store.execute("SELECT closing FROM prices").await.unwrap_err();
        assert!(matches!(err, QueryError::Execution(msg) if msg.contains("closing")));
    }

    #[tokio::test]
    async fn lists_tables_and_describes_schema() {
        let store = store().await;

        assert_eq!(store.tables().await.unwrap(), vec!["prices"]);

        let schema = store.schema(&["prices".to_string()]).await.unwrap();
        assert!(schema.starts_with("CREATE TABLE prices"));
        assert!(schema.contains("3 rows from prices table"));

        let missing = store.schema(&["options".to_string()]).await.unwrap_err();
        assert_eq!(missing, QueryError::Execution("no such table: options".to_string()));
    }
}
