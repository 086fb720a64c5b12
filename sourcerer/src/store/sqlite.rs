//! A `sqlx` implementation of the `sourcerer` store traits for the embedded
//! SQLite backend. Compile it with the `sqlite-storage` cargo feature.
//!
//! SQLite serializes all writers at the file level, so a single process-wide
//! `tokio::sync::Mutex` guards the append path here rather than relying on
//! row locking the way the Postgres backend does — this keeps concurrent
//! `append` callers from tripping the database's own `SQLITE_BUSY` retries.
#![allow(clippy::missing_errors_doc)]

use std::{marker::PhantomData, sync::Arc};

use crate::{
    Aggregate, Error, Event, EventStore, Result, StoredEvent,
    notification::{Notification, NotificationStore},
    snapshot::{SnapshotStore, StoredSnapshot},
    upcaster,
};
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::instrument;

/// Maps `sqlx::Error` into this crate's `Error`.
fn to_store_error(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

/// Maps `serde_json::Error` into this crate's `Error`.
fn to_serde_error(e: serde_json::Error) -> Error {
    Error::Store(e.to_string())
}

/// A `sqlx`-backed event store for SQLite.
#[derive(Clone)]
pub struct SqliteEventStore<A: Aggregate> {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> SqliteEventStore<A> {
    /// Creates a new `SqliteEventStore`.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            _phantom: PhantomData,
        }
    }

    /// Ensures the `events` table exists.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS events (
                    notification_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    aggregate_id TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    event_version SMALLINT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (aggregate_id, version)
                );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<A> EventStore<A> for SqliteEventStore<A>
where
    A: Aggregate,
    A::Event: Serialize + DeserializeOwned + Send + Sync,
    A::Id: Clone + Serialize + Send + Sync,
{
    #[instrument(skip(self, events), fields(id = ?id))]
    async fn append(
        &self,
        id: &A::Id,
        expected_version: i64,
        events: Vec<A::Event>,
    ) -> Result<Vec<StoredEvent<A::Event>>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.write_lock.lock().await;
        let aggregate_id = id.to_string();

        let mut tx = self.pool.begin().await.map_err(to_store_error)?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = ?1")
                .bind(&aggregate_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(to_store_error)?;

        if current_version.unwrap_or(0) != expected_version {
            return Err(Error::Conflict);
        }

        let recorded_at = Utc::now();
        let mut stored_events = Vec::with_capacity(events.len());

        for (i, event) in events.into_iter().enumerate() {
            let version = expected_version + 1 + i as i64;
            let event_type = event.event_type().to_owned();
            let event_version = event.event_version();
            let payload =
                serde_json::to_string(&event).map_err(to_serde_error)?;

            sqlx::query(
                r#"
                INSERT INTO events
                    (aggregate_id, version, event_version, event_type, payload, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&aggregate_id)
            .bind(version)
            .bind(event_version as i16)
            .bind(&event_type)
            .bind(&payload)
            .bind(recorded_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(to_store_error)?;

            stored_events.push(StoredEvent::new_at(
                aggregate_id.clone(),
                version,
                event_version,
                event_type,
                recorded_at,
                event,
            ));
        }

        tx.commit().await.map_err(to_store_error)?;

        Ok(stored_events)
    }

    #[instrument(skip(self), fields(id = ?id))]
    async fn load(&self, id: &A::Id) -> Result<Vec<StoredEvent<A::Event>>> {
        self.load_from(id, 0).await
    }

    #[instrument(skip(self), fields(id = ?id, version))]
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<StoredEvent<A::Event>>> {
        let rows: Vec<(i64, i16, String, String, String)> = sqlx::query_as(
            "SELECT version, event_version, event_type, payload, created_at FROM events WHERE aggregate_id = ?1 AND version > ?2 ORDER BY version",
        )
        .bind(id.to_string())
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        rows.into_iter()
            .map(|(version, ev_version, ev_type, payload, created_at)| {
                let event: A::Event =
                    serde_json::from_str(&payload).map_err(to_serde_error)?;
                let recorded_at = parse_timestamp(&created_at)?;
                Ok(StoredEvent::new_at(
                    id.to_string(),
                    version,
                    ev_version as u16,
                    ev_type,
                    recorded_at,
                    event,
                ))
            })
            .collect()
    }

    #[instrument(skip(self), fields(id = ?id, version))]
    async fn load_raw(&self, id: &A::Id, version: i64) -> Result<Vec<upcaster::RawStoredEvent>> {
        let rows: Vec<(i64, i16, String, String, String)> = sqlx::query_as(
            "SELECT version, event_version, event_type, payload, created_at FROM events WHERE aggregate_id = ?1 AND version > ?2 ORDER BY version",
        )
        .bind(id.to_string())
        .bind(version)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        rows.into_iter()
            .map(|(version, ev_version, ev_type, payload, created_at)| {
                let payload: serde_json::Value =
                    serde_json::from_str(&payload).map_err(to_serde_error)?;
                let recorded_at = parse_timestamp(&created_at)?;
                Ok(upcaster::RawStoredEvent {
                    aggregate_id: id.to_string(),
                    version,
                    event_version: ev_version as u16,
                    event_type: ev_type,
                    recorded_at,
                    payload,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(id = ?id, gt, lte, desc, limit))]
    async fn load_raw_range(
        &self,
        id: &A::Id,
        gt: Option<i64>,
        lte: Option<i64>,
        desc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<upcaster::RawStoredEvent>> {
        let order = if desc { "DESC" } else { "ASC" };
        let query = format!(
            "SELECT version, event_version, event_type, payload, created_at FROM events \
             WHERE aggregate_id = ?1 AND version > ?2 AND (?3 IS NULL OR version <= ?3) \
             ORDER BY version {order} LIMIT ?4"
        );
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, |l| l as i64);

        let rows: Vec<(i64, i16, String, String, String)> = sqlx::query_as(&query)
            .bind(id.to_string())
            .bind(gt.unwrap_or(0))
            .bind(lte)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(to_store_error)?;

        rows.into_iter()
            .map(|(version, ev_version, ev_type, payload, created_at)| {
                let payload: serde_json::Value =
                    serde_json::from_str(&payload).map_err(to_serde_error)?;
                let recorded_at = parse_timestamp(&created_at)?;
                Ok(upcaster::RawStoredEvent {
                    aggregate_id: id.to_string(),
                    version,
                    event_version: ev_version as u16,
                    event_type: ev_type,
                    recorded_at,
                    payload,
                })
            })
            .collect()
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Store(e.to_string()))
}

#[async_trait::async_trait]
impl<A> NotificationStore<A::Event> for SqliteEventStore<A>
where
    A: Aggregate,
    A::Event: Serialize + DeserializeOwned + Send + Sync,
    A::Id: Clone + Serialize + Send + Sync,
{
    #[instrument(skip(self), fields(start, limit))]
    async fn select_notifications(
        &self,
        start: i64,
        limit: usize,
        stop: Option<i64>,
    ) -> Result<Vec<Notification<A::Event>>> {
        let rows: Vec<(i64, String, i64, String, String, String)> = sqlx::query_as(
            r#"
            SELECT notification_id, aggregate_id, version, event_type, created_at, payload
            FROM events
            WHERE notification_id >= ?1 AND (?2 IS NULL OR notification_id <= ?2)
            ORDER BY notification_id
            LIMIT ?3
            "#,
        )
        .bind(start)
        .bind(stop)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        rows.into_iter()
            .map(
                |(notification_id, aggregate_id, version, event_type, created_at, payload)| {
                    let recorded_at = parse_timestamp(&created_at)?;
                    Ok(Notification::new(
                        notification_id,
                        aggregate_id,
                        version,
                        event_type,
                        recorded_at,
                        payload.into_bytes(),
                    ))
                },
            )
            .collect()
    }

    #[instrument(skip(self))]
    async fn max_notification_id(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(notification_id) FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(to_store_error)?;
        Ok(max.unwrap_or(0))
    }
}

/// A `sqlx`-backed snapshot store for SQLite.
#[derive(Clone)]
pub struct SqliteSnapshotStore<A: Aggregate> {
    pool: SqlitePool,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> SqliteSnapshotStore<A> {
    /// Creates a new `SqliteSnapshotStore`.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            _phantom: PhantomData,
        }
    }

    /// Ensures the `snapshots` table exists.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS snapshots (
                    aggregate_id TEXT PRIMARY KEY,
                    version BIGINT NOT NULL,
                    payload TEXT NOT NULL
                );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<A> SnapshotStore<A> for SqliteSnapshotStore<A>
where
    A: Aggregate,
    A::Snapshot: Serialize + DeserializeOwned + Send + Sync,
    A::Id: Clone + Serialize + Send + Sync,
{
    #[instrument(skip(self, snapshot), fields(id = ?aggregate_id))]
    async fn save(&self, aggregate_id: &A::Id, version: i64, snapshot: A::Snapshot) -> Result<()> {
        let payload = serde_json::to_string(&snapshot).map_err(to_serde_error)?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, version, payload)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (aggregate_id) DO UPDATE
            SET version = excluded.version,
                payload = excluded.payload;
            "#,
        )
        .bind(aggregate_id.to_string())
        .bind(version)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(id = ?aggregate_id))]
    async fn load(&self, aggregate_id: &A::Id) -> Result<Option<StoredSnapshot<A::Snapshot>>> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT version, payload FROM snapshots WHERE aggregate_id = ?1")
                .bind(aggregate_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(to_store_error)?;

        match row {
            Some((version, payload)) => {
                let snapshot: A::Snapshot =
                    serde_json::from_str(&payload).map_err(to_serde_error)?;
                Ok(Some(StoredSnapshot::new(
                    aggregate_id.to_string(),
                    version,
                    snapshot,
                )))
            }
            None => Ok(None),
        }
    }
}
