use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{CountryCode, GraphCategory, StateScope},
    protocol::CountryReport,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub rank: i64,
    pub report: CountryReport,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredGraph {
    pub country_code: CountryCode,
    pub category: GraphCategory,
    pub title: String,
    pub png: Vec<u8>,
    pub rendered_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Inserts or replaces the cached report for a country. Reports are keyed
    /// by country code; re-running the pipeline for the same idea overwrites
    /// the previous document and refreshes `generated_at`.
    pub async fn upsert_report(&self, rank: i64, report: &CountryReport) -> Result<()> {
        let report_json =
            serde_json::to_string(report).context("failed to serialize report document")?;
        sqlx::query(
            "INSERT INTO country_reports (rank, country_code, report_json, generated_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(country_code) DO UPDATE SET
                rank = excluded.rank,
                report_json = excluded.report_json,
                generated_at = CURRENT_TIMESTAMP",
        )
        .bind(rank)
        .bind(report.country_code.as_str())
        .bind(report_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Moves a cached report to a new shortlist position without regenerating it.
    pub async fn update_report_rank(&self, country_code: &CountryCode, rank: i64) -> Result<bool> {
        let updated = sqlx::query("UPDATE country_reports SET rank = ? WHERE country_code = ?")
            .bind(rank)
            .bind(country_code.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    pub async fn report_for_country(
        &self,
        country_code: &CountryCode,
    ) -> Result<Option<StoredReport>> {
        let row = sqlx::query(
            "SELECT rank, country_code, report_json, generated_at
             FROM country_reports
             WHERE country_code = ?",
        )
        .bind(country_code.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(decode_report_row).transpose()
    }

    pub async fn list_reports_by_rank(&self) -> Result<Vec<StoredReport>> {
        let rows = sqlx::query(
            "SELECT rank, country_code, report_json, generated_at
             FROM country_reports
             ORDER BY rank ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(decode_report_row).collect()
    }

    pub async fn delete_all_reports(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM country_reports")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_graph(
        &self,
        country_code: &CountryCode,
        category: GraphCategory,
        title: &str,
        png: &[u8],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO graphs (country_code, category, title, png, rendered_at)
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(country_code, category) DO UPDATE SET
                title = excluded.title,
                png = excluded.png,
                rendered_at = CURRENT_TIMESTAMP",
        )
        .bind(country_code.as_str())
        .bind(category.as_str())
        .bind(title)
        .bind(png)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_graph(
        &self,
        country_code: &CountryCode,
        category: GraphCategory,
    ) -> Result<Option<StoredGraph>> {
        let row = sqlx::query(
            "SELECT title, png, rendered_at FROM graphs WHERE country_code = ? AND category = ?",
        )
        .bind(country_code.as_str())
        .bind(category.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredGraph {
            country_code: country_code.clone(),
            category,
            title: r.get::<String, _>(0),
            png: r.get::<Vec<u8>, _>(1),
            rendered_at: r.get::<DateTime<Utc>, _>(2),
        }))
    }

    pub async fn graph_count_for_country(&self, country_code: &CountryCode) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM graphs WHERE country_code = ?")
            .bind(country_code.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn kv_set(&self, scope: StateScope, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO client_state (scope, key, value, updated_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(scope, key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(scope_label(scope))
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn kv_get(&self, scope: StateScope, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM client_state WHERE scope = ? AND key = ?")
            .bind(scope_label(scope))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn kv_remove(&self, scope: StateScope, key: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM client_state WHERE scope = ? AND key = ?")
            .bind(scope_label(scope))
            .bind(key)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    /// Removes and returns a value in one statement so two concurrent readers
    /// cannot both observe a single-use flag.
    pub async fn kv_take(&self, scope: StateScope, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("DELETE FROM client_state WHERE scope = ? AND key = ? RETURNING value")
            .bind(scope_label(scope))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn kv_clear_scope(&self, scope: StateScope) -> Result<u64> {
        let result = sqlx::query("DELETE FROM client_state WHERE scope = ?")
            .bind(scope_label(scope))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn decode_report_row(row: SqliteRow) -> Result<StoredReport> {
    let country_code = row.get::<String, _>(1);
    let report_json = row.get::<String, _>(2);
    let report = serde_json::from_str(&report_json)
        .with_context(|| format!("invalid cached report document for '{country_code}'"))?;
    Ok(StoredReport {
        rank: row.get::<i64, _>(0),
        report,
        generated_at: row.get::<DateTime<Utc>, _>(3),
    })
}

fn scope_label(scope: StateScope) -> &'static str {
    match scope {
        StateScope::Session => "session",
        StateScope::Persistent => "persistent",
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
