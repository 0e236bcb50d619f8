use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use appointment_scan::{DateRange, StoreError, Subscription, SubscriptionStore};

// How far ahead a user is assumed to search when they never set dates.
const DEFAULT_RANGE_DAYS: i64 = 60;

/// SQLite-backed subscription store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and bootstrap the schema.
    ///
    /// `url` is a sqlx SQLite URL, e.g. `sqlite://bot_data.db?mode=rwc`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(backend)?;

        let store = Self { pool };
        store.init_schema().await?;
        info!("subscription store ready");
        Ok(store)
    }

    /// Access to the underlying pool, for the user-facing layer.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                user_id    INTEGER NOT NULL,
                service_id INTEGER NOT NULL,
                office_id  INTEGER NOT NULL,
                start_date TEXT,
                end_date   TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (user_id, service_id, office_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS appointment_log (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                service_id INTEGER NOT NULL,
                office_id  INTEGER NOT NULL,
                found_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    /// Create or refresh a subscription. Unique per
    /// (user, service, office); re-subscribing updates the date range.
    pub async fn upsert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (user_id, service_id, office_id, start_date, end_date)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (user_id, service_id, office_id)
            DO UPDATE SET start_date = excluded.start_date, end_date = excluded.end_date
            "#,
        )
        .bind(subscription.user_id)
        .bind(subscription.service_id)
        .bind(subscription.office_id)
        .bind(subscription.range.start)
        .bind(subscription.range.end)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    /// Remove one subscription. Returns whether a row existed.
    pub async fn remove_subscription(
        &self,
        user_id: i64,
        service_id: i64,
        office_id: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM subscriptions WHERE user_id = ?1 AND service_id = ?2 AND office_id = ?3",
        )
        .bind(user_id)
        .bind(service_id)
        .bind(office_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove everything a user subscribed to (their `/stop`, or cleanup
    /// after the channel reported them unreachable). Returns rows removed.
    pub async fn remove_user_subscriptions(&self, user_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        Ok(result.rows_affected())
    }

    /// Rows in the appointment log, for status displays.
    pub async fn appointment_log_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM appointment_log")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;

        row.try_get("count").map_err(backend)
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(
            "SELECT user_id, service_id, office_id, start_date, end_date FROM subscriptions",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                Ok(Subscription {
                    user_id: row.try_get("user_id").map_err(backend)?,
                    service_id: row.try_get("service_id").map_err(backend)?,
                    office_id: row.try_get("office_id").map_err(backend)?,
                    range: range_or_default(
                        row.try_get("start_date").map_err(backend)?,
                        row.try_get("end_date").map_err(backend)?,
                    ),
                })
            })
            .collect()
    }

    async fn group_by_service_office(
        &self,
    ) -> Result<HashMap<(i64, i64), Vec<i64>>, StoreError> {
        let rows =
            sqlx::query("SELECT user_id, service_id, office_id FROM subscriptions")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;

        let mut groups: HashMap<(i64, i64), Vec<i64>> = HashMap::new();
        for row in rows {
            let user_id: i64 = row.try_get("user_id").map_err(backend)?;
            let service_id: i64 = row.try_get("service_id").map_err(backend)?;
            let office_id: i64 = row.try_get("office_id").map_err(backend)?;
            groups.entry((service_id, office_id)).or_default().push(user_id);
        }

        Ok(groups)
    }

    async fn user_date_range(&self, user_id: i64) -> Result<DateRange, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT start_date, end_date FROM subscriptions
            WHERE user_id = ?1
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        Ok(match row {
            Some(row) => range_or_default(
                row.try_get("start_date").map_err(backend)?,
                row.try_get("end_date").map_err(backend)?,
            ),
            None => range_or_default(None, None),
        })
    }

    async fn log_appointment(
        &self,
        service_id: i64,
        office_id: i64,
        found_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO appointment_log (service_id, office_id, found_at) VALUES (?1, ?2, ?3)",
        )
        .bind(service_id)
        .bind(office_id)
        .bind(found_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn range_or_default(start: Option<NaiveDate>, end: Option<NaiveDate>) -> DateRange {
    let today = Utc::now().date_naive();
    let start = start.unwrap_or(today);
    let end = end.unwrap_or(today + chrono::Duration::days(DEFAULT_RANGE_DAYS));
    DateRange::new(start, end)
}
