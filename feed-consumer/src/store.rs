use crate::traits::FeedStore;
use crate::types::{FeedEntry, FeedLocation, Location, NeedItem, NewFeedEntry, PipelineError, Result, StoreConfig};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS feed_entry (
        id BIGSERIAL PRIMARY KEY,
        full_text TEXT NOT NULL,
        is_resolved BOOLEAN NOT NULL DEFAULT false,
        channel TEXT NOT NULL DEFAULT '',
        extra_parameters TEXT,
        "timestamp" TIMESTAMPTZ NOT NULL,
        epoch BIGINT NOT NULL DEFAULT 0,
        is_geolocated BOOLEAN NOT NULL DEFAULT false,
        reason TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS feed_location (
        id BIGSERIAL PRIMARY KEY,
        entry_id BIGINT NOT NULL UNIQUE REFERENCES feed_entry (id),
        formatted_address TEXT NOT NULL,
        latitude DOUBLE PRECISION NOT NULL,
        longitude DOUBLE PRECISION NOT NULL,
        northeast_lat DOUBLE PRECISION NOT NULL,
        northeast_lng DOUBLE PRECISION NOT NULL,
        southwest_lat DOUBLE PRECISION NOT NULL,
        southwest_lng DOUBLE PRECISION NOT NULL,
        reason TEXT,
        channel TEXT NOT NULL DEFAULT '',
        epoch BIGINT NOT NULL DEFAULT 0,
        "timestamp" TIMESTAMPTZ NOT NULL,
        needs JSONB NOT NULL DEFAULT '[]'::jsonb,
        is_location_verified BOOLEAN NOT NULL DEFAULT false,
        is_need_verified BOOLEAN NOT NULL DEFAULT false
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS feed_location_viewport_epoch_idx
        ON feed_location (southwest_lat, southwest_lng, northeast_lat, northeast_lng, epoch)
    "#,
];

/// SQLSTATE classes 22 (data exception) and 23 (integrity constraint violation)
/// depend only on the input, so retrying it cannot help.
fn is_data_rejection(sqlstate: &str) -> bool {
    sqlstate.starts_with("22") || sqlstate.starts_with("23")
}

fn classify_database_error(err: PipelineError) -> PipelineError {
    let rejected = match &err {
        PipelineError::Database(sqlx::Error::Database(db)) => db
            .code()
            .filter(|code| is_data_rejection(code))
            .map(|code| (code.into_owned(), db.message().to_string())),
        _ => None,
    };

    match rejected {
        Some((sqlstate, message)) => PipelineError::Rejected { sqlstate, message },
        None => err,
    }
}

/// Postgres-backed [`FeedStore`]. Every operation draws one pooled
/// connection and is bounded by the configured deadline.
pub struct PgFeedStore {
    db: PgPool,
    operation_timeout: Duration,
}

impl PgFeedStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.operation_timeout())
            .connect(&config.database_url)
            .await?;

        Ok(Self::from_pool(db, config.operation_timeout()))
    }

    pub fn from_pool(db: PgPool, operation_timeout: Duration) -> Self {
        Self { db, operation_timeout }
    }

    /// Creates the tables and the viewport index when they are missing.
    /// Intended for development databases and tests.
    pub async fn setup_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.db).await?;
        }
        info!("feed schema ensured");
        Ok(())
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    async fn with_deadline<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(classify_database_error),
            Err(_) => Err(PipelineError::Timeout {
                operation,
                seconds: self.operation_timeout.as_secs(),
            }),
        }
    }

    async fn insert_entry(tx: &mut Transaction<'_, Postgres>, entry: &NewFeedEntry) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO feed_entry (
                full_text, is_resolved, channel,
                extra_parameters, "timestamp", epoch,
                is_geolocated, reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&entry.full_text)
        .bind(entry.is_resolved)
        .bind(&entry.channel)
        .bind(&entry.extra_parameters)
        .bind(entry.timestamp)
        .bind(entry.epoch)
        .bind(false)
        .bind(&entry.reason)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id)
    }

    async fn insert_location(tx: &mut Transaction<'_, Postgres>, location: &FeedLocation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feed_location (
                formatted_address,
                latitude, longitude,
                northeast_lat, northeast_lng,
                southwest_lat, southwest_lng,
                entry_id, "timestamp",
                epoch, reason, channel, needs,
                is_location_verified, is_need_verified
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&location.formatted_address)
        .bind(location.latitude)
        .bind(location.longitude)
        .bind(location.northeast_lat)
        .bind(location.northeast_lng)
        .bind(location.southwest_lat)
        .bind(location.southwest_lng)
        .bind(location.entry_id)
        .bind(location.timestamp)
        .bind(location.epoch)
        .bind(&location.reason)
        .bind(&location.channel)
        .bind(Json(&location.needs))
        .bind(location.is_location_verified)
        .bind(location.is_need_verified)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FeedStore for PgFeedStore {
    async fn create_feed(&self, entry: &NewFeedEntry, location: &Location) -> Result<FeedEntry> {
        self.with_deadline("create_feed", async {
            // Dropping the transaction on any early return rolls it back.
            let mut tx = self.db.begin().await?;

            let entry_id = Self::insert_entry(&mut tx, entry).await?;

            if location.is_geocoded() {
                let row = FeedLocation::from_location(location, entry_id, entry.timestamp);
                Self::insert_location(&mut tx, &row).await?;
            } else {
                debug!(entry_id, "location not geocoded, storing entry only");
            }

            tx.commit().await?;
            Ok(entry.clone().with_id(entry_id))
        })
        .await
    }

    async fn update_intent_and_needs(&self, entry_id: i64, reason: &str, needs: &[NeedItem]) -> Result<()> {
        self.with_deadline("update_intent_and_needs", async {
            let result = sqlx::query("UPDATE feed_location SET reason = $1, needs = $2 WHERE entry_id = $3")
                .bind(reason)
                .bind(Json(needs.to_vec()))
                .bind(entry_id)
                .execute(&self.db)
                .await?;

            if result.rows_affected() == 0 {
                debug!(entry_id, "no location row to enrich");
            }
            Ok(())
        })
        .await
    }

    async fn delete_feed_location(&self, entry_id: i64) -> Result<()> {
        self.with_deadline("delete_feed_location", async {
            let result = sqlx::query("DELETE FROM feed_location WHERE entry_id = $1")
                .bind(entry_id)
                .execute(&self.db)
                .await?;

            debug!(entry_id, deleted = result.rows_affected(), "deleted feed location");
            Ok(())
        })
        .await
    }
}
