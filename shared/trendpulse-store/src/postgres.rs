//! PostgreSQL-backed stats store

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio_postgres::Row;
use tracing::{debug, info, instrument, warn};

use trendpulse_core::{DailyStat, HourlyStat, HOURS_PER_DAY};

use crate::store::{IsolationLevel, StatsStore, StoreTransaction};
use crate::{PoolConfig, Result, StatsPool, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hourly_stats (
    keyword             TEXT             NOT NULL,
    hour_timestamp      TIMESTAMPTZ      NOT NULL,
    post_count          BIGINT           NOT NULL DEFAULT 0,
    comment_count       BIGINT           NOT NULL DEFAULT 0,
    positive_count      BIGINT           NOT NULL DEFAULT 0,
    neutral_count       BIGINT           NOT NULL DEFAULT 0,
    negative_count      BIGINT           NOT NULL DEFAULT 0,
    avg_sentiment_score DOUBLE PRECISION NOT NULL DEFAULT 0,
    top_keywords        TEXT[]           NOT NULL DEFAULT '{}',
    updated_at          TIMESTAMPTZ      NOT NULL DEFAULT now(),
    PRIMARY KEY (keyword, hour_timestamp)
);
CREATE INDEX IF NOT EXISTS hourly_stats_hour_idx ON hourly_stats (hour_timestamp);

CREATE TABLE IF NOT EXISTS daily_stats (
    keyword             TEXT             NOT NULL,
    stat_date           DATE             NOT NULL,
    total_post_count    BIGINT           NOT NULL DEFAULT 0,
    total_comment_count BIGINT           NOT NULL DEFAULT 0,
    positive_count      BIGINT           NOT NULL DEFAULT 0,
    neutral_count       BIGINT           NOT NULL DEFAULT 0,
    negative_count      BIGINT           NOT NULL DEFAULT 0,
    avg_sentiment_score DOUBLE PRECISION NOT NULL DEFAULT 0,
    top_keywords        TEXT[]           NOT NULL DEFAULT '{}',
    hourly_breakdown    BIGINT[]         NOT NULL,
    updated_at          TIMESTAMPTZ      NOT NULL DEFAULT now(),
    PRIMARY KEY (keyword, stat_date)
);
";

const HOURLY_COLUMNS: &str = "keyword, hour_timestamp, post_count, comment_count, \
     positive_count, neutral_count, negative_count, avg_sentiment_score, top_keywords";

const DAILY_COLUMNS: &str = "keyword, stat_date, total_post_count, total_comment_count, \
     positive_count, neutral_count, negative_count, avg_sentiment_score, top_keywords, \
     hourly_breakdown";

const UPSERT_HOURLY: &str = "
INSERT INTO hourly_stats (keyword, hour_timestamp, post_count, comment_count,
    positive_count, neutral_count, negative_count, avg_sentiment_score, top_keywords, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
ON CONFLICT (keyword, hour_timestamp) DO UPDATE SET
    post_count = EXCLUDED.post_count,
    comment_count = EXCLUDED.comment_count,
    positive_count = EXCLUDED.positive_count,
    neutral_count = EXCLUDED.neutral_count,
    negative_count = EXCLUDED.negative_count,
    avg_sentiment_score = EXCLUDED.avg_sentiment_score,
    top_keywords = EXCLUDED.top_keywords,
    updated_at = now()";

const UPSERT_DAILY: &str = "
INSERT INTO daily_stats (keyword, stat_date, total_post_count, total_comment_count,
    positive_count, neutral_count, negative_count, avg_sentiment_score, top_keywords,
    hourly_breakdown, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
ON CONFLICT (keyword, stat_date) DO UPDATE SET
    total_post_count = EXCLUDED.total_post_count,
    total_comment_count = EXCLUDED.total_comment_count,
    positive_count = EXCLUDED.positive_count,
    neutral_count = EXCLUDED.neutral_count,
    negative_count = EXCLUDED.negative_count,
    avg_sentiment_score = EXCLUDED.avg_sentiment_score,
    top_keywords = EXCLUDED.top_keywords,
    hourly_breakdown = EXCLUDED.hourly_breakdown,
    updated_at = now()";

fn hourly_from_row(row: &Row) -> Result<HourlyStat> {
    Ok(HourlyStat {
        keyword: row.try_get(0).map_err(StoreError::Query)?,
        hour_timestamp: row.try_get(1).map_err(StoreError::Query)?,
        post_count: row.try_get(2).map_err(StoreError::Query)?,
        comment_count: row.try_get(3).map_err(StoreError::Query)?,
        positive_count: row.try_get(4).map_err(StoreError::Query)?,
        neutral_count: row.try_get(5).map_err(StoreError::Query)?,
        negative_count: row.try_get(6).map_err(StoreError::Query)?,
        avg_sentiment_score: row.try_get(7).map_err(StoreError::Query)?,
        top_keywords: row.try_get(8).map_err(StoreError::Query)?,
    })
}

fn daily_from_row(row: &Row) -> Result<DailyStat> {
    let mut hourly_breakdown: Vec<i64> = row.try_get(9).map_err(StoreError::Query)?;
    hourly_breakdown.resize(HOURS_PER_DAY, 0);

    Ok(DailyStat {
        keyword: row.try_get(0).map_err(StoreError::Query)?,
        date: row.try_get(1).map_err(StoreError::Query)?,
        total_post_count: row.try_get(2).map_err(StoreError::Query)?,
        total_comment_count: row.try_get(3).map_err(StoreError::Query)?,
        positive_count: row.try_get(4).map_err(StoreError::Query)?,
        neutral_count: row.try_get(5).map_err(StoreError::Query)?,
        negative_count: row.try_get(6).map_err(StoreError::Query)?,
        avg_sentiment_score: row.try_get(7).map_err(StoreError::Query)?,
        top_keywords: row.try_get(8).map_err(StoreError::Query)?,
        hourly_breakdown,
    })
}

/// Stats store over a PostgreSQL connection pool
#[derive(Clone)]
pub struct PgStatsStore {
    pool: StatsPool,
}

impl PgStatsStore {
    pub fn new(pool: StatsPool) -> Self {
        Self { pool }
    }

    pub fn connect(config: &PoolConfig) -> Result<Self> {
        Ok(Self::new(StatsPool::new(config)?))
    }

    /// Create the aggregate tables if they do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA).await.map_err(StoreError::Query)?;
        info!("Stats schema ready");
        Ok(())
    }
}

#[async_trait]
impl StatsStore for PgStatsStore {
    #[instrument(skip(self))]
    async fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>> {
        let conn = self.pool.get().await?;
        conn.batch_execute(&format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql()))
            .await
            .map_err(StoreError::Query)?;
        debug!(%isolation, "Transaction started");

        Ok(Box::new(PgTransaction {
            conn: Some(conn),
            isolation,
        }))
    }

    async fn get_hourly(&self, keyword: &str, hour: DateTime<Utc>) -> Result<Option<HourlyStat>> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM hourly_stats WHERE keyword = $1 AND hour_timestamp = $2",
            HOURLY_COLUMNS
        );
        let row = conn
            .query_opt(sql.as_str(), &[&keyword, &hour])
            .await
            .map_err(StoreError::Query)?;
        row.as_ref().map(hourly_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn hourly_range(
        &self,
        keyword: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyStat>> {
        let conn = self.pool.get().await?;
        let rows = match keyword {
            Some(keyword) => {
                let sql = format!(
                    "SELECT {} FROM hourly_stats \
                     WHERE keyword = $1 AND hour_timestamp >= $2 AND hour_timestamp < $3 \
                     ORDER BY hour_timestamp ASC",
                    HOURLY_COLUMNS
                );
                conn.query(sql.as_str(), &[&keyword, &start, &end]).await
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM hourly_stats \
                     WHERE hour_timestamp >= $1 AND hour_timestamp < $2 \
                     ORDER BY hour_timestamp ASC, keyword ASC",
                    HOURLY_COLUMNS
                );
                conn.query(sql.as_str(), &[&start, &end]).await
            }
        }
        .map_err(StoreError::Query)?;

        rows.iter().map(hourly_from_row).collect()
    }

    async fn get_daily(&self, keyword: &str, date: NaiveDate) -> Result<Option<DailyStat>> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM daily_stats WHERE keyword = $1 AND stat_date = $2",
            DAILY_COLUMNS
        );
        let row = conn
            .query_opt(sql.as_str(), &[&keyword, &date])
            .await
            .map_err(StoreError::Query)?;
        row.as_ref().map(daily_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn daily_range(
        &self,
        keyword: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStat>> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM daily_stats \
             WHERE keyword = $1 AND stat_date >= $2 AND stat_date <= $3 \
             ORDER BY stat_date ASC",
            DAILY_COLUMNS
        );
        let rows = conn
            .query(sql.as_str(), &[&keyword, &start, &end])
            .await
            .map_err(StoreError::Query)?;

        rows.iter().map(daily_from_row).collect()
    }

    #[instrument(skip(self, stat), fields(keyword = %stat.keyword, date = %stat.date))]
    async fn save_daily(&self, stat: &DailyStat) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            UPSERT_DAILY,
            &[
                &stat.keyword,
                &stat.date,
                &stat.total_post_count,
                &stat.total_comment_count,
                &stat.positive_count,
                &stat.neutral_count,
                &stat.negative_count,
                &stat.avg_sentiment_score,
                &stat.top_keywords,
                &stat.hourly_breakdown,
            ],
        )
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.pool.is_healthy().await
    }
}

/// One open transaction on a checked-out session
struct PgTransaction {
    conn: Option<deadpool_postgres::Object>,
    isolation: IsolationLevel,
}

impl PgTransaction {
    fn conn(&self) -> Result<&deadpool_postgres::Object> {
        self.conn.as_ref().ok_or(StoreError::TransactionClosed)
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        let conn = self.conn.take().ok_or(StoreError::TransactionClosed)?;
        match conn.batch_execute(statement).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The session state is unknown; keep it out of the pool.
                let _ = deadpool_postgres::Object::take(conn);
                Err(StoreError::Query(e))
            }
        }
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn lock_hourly(&mut self, keyword: &str, hour: DateTime<Utc>) -> Result<HourlyStat> {
        let conn = self.conn()?;

        // Create-if-absent first so concurrent writers serialize on the row
        // lock instead of racing to insert.
        conn.execute(
            "INSERT INTO hourly_stats (keyword, hour_timestamp) VALUES ($1, $2) \
             ON CONFLICT (keyword, hour_timestamp) DO NOTHING",
            &[&keyword, &hour],
        )
        .await
        .map_err(StoreError::Query)?;

        let sql = format!(
            "SELECT {} FROM hourly_stats \
             WHERE keyword = $1 AND hour_timestamp = $2 FOR UPDATE",
            HOURLY_COLUMNS
        );
        let row = conn
            .query_one(sql.as_str(), &[&keyword, &hour])
            .await
            .map_err(StoreError::Query)?;
        hourly_from_row(&row)
    }

    async fn save_hourly(&mut self, stat: &HourlyStat) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            UPSERT_HOURLY,
            &[
                &stat.keyword,
                &stat.hour_timestamp,
                &stat.post_count,
                &stat.comment_count,
                &stat.positive_count,
                &stat.neutral_count,
                &stat.negative_count,
                &stat.avg_sentiment_score,
                &stat.top_keywords,
            ],
        )
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        tx.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        tx.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("Transaction dropped without commit or rollback; discarding session");
            let _ = deadpool_postgres::Object::take(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn connect_from_env() -> Option<PgStatsStore> {
        // Requires a running PostgreSQL instance; skipped otherwise
        let url = std::env::var("DATABASE_URL").ok()?;
        let config = PoolConfig {
            url,
            ..PoolConfig::default()
        };
        let store = match PgStatsStore::connect(&config) {
            Ok(store) => store,
            Err(e) => {
                tracing::error!("Cannot build pool: {}", e);
                return None;
            }
        };
        store.ensure_schema().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn test_hourly_roundtrip_through_transaction() {
        let Some(store) = connect_from_env().await else {
            return;
        };

        let keyword = format!("pgtest-{}", std::process::id());
        let hour = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let mut stat = tx.lock_hourly(&keyword, hour).await.unwrap();
        stat.post_count += 3;
        stat.top_keywords = vec!["alpha".into()];
        tx.save_hourly(&stat).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = store.get_hourly(&keyword, hour).await.unwrap().unwrap();
        assert!(loaded.post_count >= 3);
        assert_eq!(loaded.top_keywords, vec!["alpha".to_string()]);
    }
}
