//! Database executor: document-style operations on a named table.
//!
//! Targets Postgres tables following the document convention (a `data`
//! JSONB column). Filters are containment matches (`data @> filter`).
//! A config-supplied connection string gets a transient single-connection
//! pool that is closed on exit; otherwise the worker's default database
//! is reused through a cached pool.

use async_trait::async_trait;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;

use super::{config_mismatch, ExecutionContext, Executor, ExecutorOutcome};
use crate::dag::{DatabaseOperation, DatabaseTaskConfig, NodeConfig};
use crate::error::{CascadeError, Result};

pub struct DatabaseExecutor {
    default_url: Option<String>,
    default_pool: OnceCell<PgPool>,
}

impl DatabaseExecutor {
    pub fn new(default_url: Option<String>) -> Self {
        Self {
            default_url,
            default_pool: OnceCell::new(),
        }
    }

    async fn default_pool(&self) -> Result<&PgPool> {
        let url = self.default_url.as_deref().ok_or_else(|| {
            CascadeError::config_missing(
                "Database task has no connection_string and no default database is configured",
            )
        })?;
        self.default_pool
            .get_or_try_init(|| async {
                PgPoolOptions::new()
                    .max_connections(2)
                    .connect(url)
                    .await
                    .map_err(CascadeError::from)
            })
            .await
    }

    async fn run_operation(pool: &PgPool, config: &DatabaseTaskConfig) -> Result<serde_json::Value> {
        let table = validated_table(&config.table)?;
        let filter = config.filter.clone().unwrap_or_else(|| json!({}));

        match config.operation {
            DatabaseOperation::Insert => {
                let document = config.document.clone().ok_or_else(|| {
                    CascadeError::validation("Database insert requires a document")
                })?;
                let result = sqlx::query(&format!(
                    r#"INSERT INTO "{}" (data) VALUES ($1)"#,
                    table
                ))
                .bind(document)
                .execute(pool)
                .await?;
                Ok(json!({ "inserted": result.rows_affected() }))
            }
            DatabaseOperation::Find => {
                let rows = sqlx::query(&format!(
                    r#"SELECT data FROM "{}" WHERE data @> $1 LIMIT $2"#,
                    table
                ))
                .bind(&filter)
                .bind(config.limit)
                .fetch_all(pool)
                .await?;

                let documents: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| row.try_get::<serde_json::Value, _>("data"))
                    .collect::<std::result::Result<_, _>>()?;
                Ok(json!({ "count": documents.len(), "documents": documents }))
            }
            DatabaseOperation::Update => {
                let document = config.document.clone().ok_or_else(|| {
                    CascadeError::validation("Database update requires a document")
                })?;
                let result = sqlx::query(&format!(
                    r#"UPDATE "{}" SET data = data || $2 WHERE data @> $1"#,
                    table
                ))
                .bind(&filter)
                .bind(document)
                .execute(pool)
                .await?;
                Ok(json!({ "updated": result.rows_affected() }))
            }
            DatabaseOperation::Delete => {
                let result = sqlx::query(&format!(
                    r#"DELETE FROM "{}" WHERE data @> $1"#,
                    table
                ))
                .bind(&filter)
                .execute(pool)
                .await?;
                Ok(json!({ "deleted": result.rows_affected() }))
            }
        }
    }
}

/// Table names are restricted to plain identifiers; they are interpolated
/// into SQL and must never carry quoting or punctuation.
fn validated_table(table: &str) -> Result<&str> {
    let valid = !table.is_empty()
        && table.len() <= 63
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.chars().next().unwrap_or('0').is_ascii_digit();
    if valid {
        Ok(table)
    } else {
        Err(CascadeError::validation(format!(
            "Invalid table name: {:?}",
            table
        )))
    }
}

#[async_trait]
impl Executor for DatabaseExecutor {
    fn kind(&self) -> &'static str {
        "database"
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        _ctx: &ExecutionContext,
    ) -> Result<ExecutorOutcome> {
        let NodeConfig::Database(config) = config else {
            return Err(config_mismatch(self.kind()));
        };

        let result = match &config.connection_string {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect(url)
                    .await
                    .map_err(|e| {
                        CascadeError::executor_failure(format!(
                            "Failed to connect to task database: {}",
                            e
                        ))
                    })?;
                let result = Self::run_operation(&pool, config).await;
                pool.close().await;
                result?
            }
            None => {
                let pool = self.default_pool().await?;
                Self::run_operation(pool, config).await?
            }
        };

        Ok(ExecutorOutcome::Success(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(validated_table("events").is_ok());
        assert!(validated_table("user_logs_2024").is_ok());
        assert!(validated_table("").is_err());
        assert!(validated_table("2fast").is_err());
        assert!(validated_table("users; DROP TABLE users").is_err());
        assert!(validated_table("users\"").is_err());
    }

    #[tokio::test]
    async fn test_missing_default_is_config_error() {
        let executor = DatabaseExecutor::new(None);
        let config = NodeConfig::Database(DatabaseTaskConfig {
            connection_string: None,
            operation: DatabaseOperation::Find,
            table: "events".to_string(),
            document: None,
            filter: None,
            limit: 10,
        });
        let ctx = ExecutionContext::new(uuid::Uuid::new_v4(), "db");
        let err = executor.execute(&config, &ctx).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ConfigMissing);
    }
}
