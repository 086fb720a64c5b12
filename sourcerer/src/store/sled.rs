//! A persistent `EventStore` and `SnapshotStore` implementation using `sled`.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::Utc;
use serde_json;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use tracing::instrument;

use crate::{
    Aggregate, Error, Event, EventStore, Result, StoredEvent,
    notification::{Notification, NotificationStore},
};

const NOTIFICATIONS_TREE: &str = "__sourcerer_notifications__";

/// Key holding an aggregate's current version, stored alongside its events
/// in the same tree so the optimistic-concurrency check participates in the
/// same transaction (and therefore the same conflict detection) as the
/// event inserts it guards.
const VERSION_KEY: &[u8] = b"__version__";

/// A persistent, thread-safe event store using `sled`.
///
/// This store uses a `sled::Tree` to store events, which is an ordered
/// key-value store. This allows for efficient scanning of event streams.
/// A dedicated `sled::Tree` holds the global notification log, keyed by a
/// zero-padded, strictly increasing id minted from `sled::Db::generate_id`.
#[derive(Clone)]
pub struct SledEventStore<A: Aggregate> {
    db: sled::Db,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> SledEventStore<A> {
    /// Creates a new `SledEventStore`.
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            _phantom: PhantomData,
        }
    }

    fn notifications_tree(&self) -> Result<sled::Tree> {
        self.db
            .open_tree(NOTIFICATIONS_TREE)
            .map_err(|e| Error::Store(e.to_string()))
    }

    fn notification_key(id: i64) -> [u8; 8] {
        (id as u64).to_be_bytes()
    }
}

#[async_trait]
impl<A> EventStore<A> for SledEventStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self, events), fields(id = ?id, expected_version))]
    async fn append(
        &self,
        id: &A::Id,
        expected_version: i64,
        events: Vec<A::Event>,
    ) -> Result<Vec<StoredEvent<A::Event>>> {
        let aggregate_id = id.to_string();
        let tree = self
            .db
            .open_tree(aggregate_id.as_bytes())
            .map_err(|e| Error::Store(e.to_string()))?;
        let notifications_tree = self.notifications_tree()?;
        let new_version = expected_version + events.len() as i64;

        let recorded_at = Utc::now();
        let mut stored_events = Vec::with_capacity(events.len());
        let mut events_to_commit = Vec::new();
        let mut notifications_to_commit = Vec::new();

        for (i, event) in events.into_iter().enumerate() {
            let version = expected_version + 1 + i as i64;
            let event_type = event.event_type().to_string();
            let event_version = event.event_version();

            let state =
                serde_json::to_vec(&event).map_err(|e| Error::Store(e.to_string()))?;
            let stored_event = StoredEvent::new_at(
                aggregate_id.clone(),
                version,
                event_version,
                event_type.clone(),
                recorded_at,
                event,
            );
            let value =
                serde_json::to_vec(&stored_event).map_err(|e| Error::Store(e.to_string()))?;
            let key = format!("{aggregate_id}/{version}");

            let notification_id = self
                .db
                .generate_id()
                .map_err(|e| Error::Store(e.to_string()))? as i64;
            let notification = Notification::new(
                notification_id,
                aggregate_id.clone(),
                version,
                event_type,
                recorded_at,
                state,
            );
            let notification_value =
                serde_json::to_vec(&notification).map_err(|e| Error::Store(e.to_string()))?;

            stored_events.push(stored_event);
            events_to_commit.push((key, value));
            notifications_to_commit
                .push((Self::notification_key(notification_id), notification_value));
        }

        (&tree, &notifications_tree)
            .transaction(|(tx_events, tx_notifications)| {
                let current_version = match tx_events.get(VERSION_KEY)? {
                    Some(bytes) => {
                        let mut buf = [0u8; 8];
                        buf.copy_from_slice(&bytes);
                        i64::from_be_bytes(buf)
                    }
                    None => 0,
                };

                if current_version != expected_version {
                    return Err(ConflictableTransactionError::Abort(Error::Conflict));
                }

                for (key, value) in &events_to_commit {
                    tx_events.insert(key.as_bytes(), value.as_slice())?;
                }
                tx_events.insert(VERSION_KEY, &new_version.to_be_bytes())?;
                for (key, value) in &notifications_to_commit {
                    tx_notifications.insert(key.as_slice(), value.as_slice())?;
                }
                Ok(())
            })
            .map_err(|e: TransactionError<Error>| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(storage_err) => Error::Store(storage_err.to_string()),
            })?;

        Ok(stored_events)
    }

    #[instrument(skip(self), fields(id = ?id))]
    async fn load(&self, id: &A::Id) -> Result<Vec<StoredEvent<A::Event>>> {
        let aggregate_id = id.to_string();
        let tree = self
            .db
            .open_tree(aggregate_id.as_bytes())
            .map_err(|e| Error::Store(e.to_string()))?;
        let prefix = format!("{aggregate_id}/");

        tree.scan_prefix(prefix.as_bytes())
            .map(|res| {
                let (_, v) = res.map_err(|e| Error::Store(e.to_string()))?;
                serde_json::from_slice(&v).map_err(|e| Error::Store(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self), fields(id = ?id, version))]
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<StoredEvent<A::Event>>> {
        let aggregate_id = id.to_string();
        let tree = self
            .db
            .open_tree(aggregate_id.as_bytes())
            .map_err(|e| Error::Store(e.to_string()))?;
        let start_key = format!("{aggregate_id}/{}", version + 1);
        // `/` (0x2F) is the byte immediately below `0` (0x30), so this is
        // the smallest key that sorts after every `"{aggregate_id}/..."`
        // event key without also sweeping up unrelated keys stored in the
        // same tree, such as `VERSION_KEY`.
        let end_key = format!("{aggregate_id}0");

        tree.range(start_key.as_bytes()..end_key.as_bytes())
            .map(|res| {
                let (_, v) = res.map_err(|e| Error::Store(e.to_string()))?;
                serde_json::from_slice(&v).map_err(|e| Error::Store(e.to_string()))
            })
            .collect()
    }

    async fn load_raw(
        &self,
        id: &<A as Aggregate>::Id,
        version: i64,
    ) -> Result<Vec<crate::upcaster::RawStoredEvent>> {
        let aggregate_id = id.to_string();
        let tree = self
            .db
            .open_tree(aggregate_id.as_bytes())
            .map_err(|e| Error::Store(e.to_string()))?;
        let start_key = format!("{aggregate_id}/{}", version + 1);
        let end_key = format!("{aggregate_id}0");

        tree.range(start_key.as_bytes()..end_key.as_bytes())
            .map(|res| {
                let (_, v) = res.map_err(|e| Error::Store(e.to_string()))?;
                let stored: StoredEvent<A::Event> =
                    serde_json::from_slice(&v).map_err(|e| Error::Store(e.to_string()))?;
                let payload = serde_json::to_value(stored.event())
                    .map_err(|e| Error::Store(e.to_string()))?;
                Ok(crate::upcaster::RawStoredEvent {
                    aggregate_id: stored.aggregate_id().to_string(),
                    version: stored.version(),
                    event_version: stored.event_version(),
                    event_type: stored.event_type().to_string(),
                    recorded_at: stored.recorded_at(),
                    payload,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(id = ?id, gt, lte, desc, limit))]
    async fn load_raw_range(
        &self,
        id: &<A as Aggregate>::Id,
        gt: Option<i64>,
        lte: Option<i64>,
        desc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<crate::upcaster::RawStoredEvent>> {
        let aggregate_id = id.to_string();
        let tree = self
            .db
            .open_tree(aggregate_id.as_bytes())
            .map_err(|e| Error::Store(e.to_string()))?;
        let start_key = format!("{aggregate_id}/{}", gt.unwrap_or(0) + 1);
        // `lte` narrows the upper bound, but never past the aggregate's own
        // key space (`VERSION_KEY` and other keys in the same tree).
        let end_key = match lte {
            Some(lte) => format!("{aggregate_id}/{}", lte + 1),
            None => format!("{aggregate_id}0"),
        };

        let mut events: Vec<crate::upcaster::RawStoredEvent> = tree
            .range(start_key.as_bytes()..end_key.as_bytes())
            .map(|res| {
                let (_, v) = res.map_err(|e| Error::Store(e.to_string()))?;
                let stored: StoredEvent<A::Event> =
                    serde_json::from_slice(&v).map_err(|e| Error::Store(e.to_string()))?;
                let payload = serde_json::to_value(stored.event())
                    .map_err(|e| Error::Store(e.to_string()))?;
                Ok(crate::upcaster::RawStoredEvent {
                    aggregate_id: stored.aggregate_id().to_string(),
                    version: stored.version(),
                    event_version: stored.event_version(),
                    event_type: stored.event_type().to_string(),
                    recorded_at: stored.recorded_at(),
                    payload,
                })
            })
            .collect::<Result<_>>()?;

        if desc {
            events.reverse();
        }
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }
}

#[async_trait]
impl<A> NotificationStore<A::Event> for SledEventStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self), fields(start, limit))]
    async fn select_notifications(
        &self,
        start: i64,
        limit: usize,
        stop: Option<i64>,
    ) -> Result<Vec<Notification<A::Event>>> {
        let tree = self.notifications_tree()?;
        let start_key = Self::notification_key(start);

        let mut out = Vec::with_capacity(limit.min(64));
        for res in tree.range(start_key.to_vec()..) {
            if out.len() >= limit {
                break;
            }
            let (key, value) = res.map_err(|e| Error::Store(e.to_string()))?;
            let id = i64::from_be_bytes(key.as_ref().try_into().unwrap_or([0; 8]));
            if let Some(stop) = stop {
                if id > stop {
                    break;
                }
            }
            let notification: Notification<A::Event> =
                serde_json::from_slice(&value).map_err(|e| Error::Store(e.to_string()))?;
            out.push(notification);
        }
        Ok(out)
    }

    async fn max_notification_id(&self) -> Result<i64> {
        let tree = self.notifications_tree()?;
        match tree.last().map_err(|e| Error::Store(e.to_string()))? {
            Some((key, _)) => Ok(i64::from_be_bytes(key.as_ref().try_into().unwrap_or([0; 8]))),
            None => Ok(0),
        }
    }
}
