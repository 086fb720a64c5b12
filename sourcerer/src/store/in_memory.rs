//! An in-memory event store, useful for testing and development.
//!
//! A single write mutex guards both the per-aggregate event streams and the
//! global notification counter, so every committed batch gets a contiguous
//! block of notification ids and ordering is fully deterministic — the
//! behaviour described for the in-memory backend.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json;
use tracing::instrument;

use crate::{
    Aggregate, Event, EventStore, Result,
    notification::{Notification, NotificationStore},
    StoredEvent,
};

type EventStream<E> = Vec<StoredEvent<E>>;

struct Inner<E: Event> {
    streams: HashMap<String, EventStream<E>>,
    notifications: Vec<Notification<E>>,
    next_notification_id: i64,
}

impl<E: Event> Default for Inner<E> {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
            notifications: Vec::new(),
            next_notification_id: 1,
        }
    }
}

/// An in-memory, thread-safe event store.
///
/// This is useful for testing or for applications that do not require a
/// persistent event store.
pub struct InMemoryEventStore<A: Aggregate> {
    inner: Arc<Mutex<Inner<A::Event>>>,
}

impl<A: Aggregate> Default for InMemoryEventStore<A> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

impl<A: Aggregate> Clone for InMemoryEventStore<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl<A> EventStore<A> for InMemoryEventStore<A>
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
        let mut inner = self.inner.lock().expect("in-memory store mutex poisoned");

        let current_version = inner
            .streams
            .get(&aggregate_id)
            .and_then(|s| s.last())
            .map(StoredEvent::version)
            .unwrap_or(0);
        if current_version != expected_version {
            return Err(crate::Error::Conflict);
        }

        let recorded_at = Utc::now();
        let mut stored_events = Vec::with_capacity(events.len());
        let mut notifications = Vec::with_capacity(events.len());
        let mut version = current_version;

        for event in events {
            version += 1;
            let event_version = event.event_version();
            let event_type = event.event_type().to_string();
            let state = serde_json::to_vec(&event).map_err(|e| crate::Error::Store(e.to_string()))?;

            let notification_id = inner.next_notification_id;
            inner.next_notification_id += 1;
            notifications.push(Notification::new(
                notification_id,
                aggregate_id.clone(),
                version,
                event_type.clone(),
                recorded_at,
                state,
            ));

            stored_events.push(StoredEvent::new_at(
                aggregate_id.clone(),
                version,
                event_version,
                event_type,
                recorded_at,
                event,
            ));
        }

        inner
            .streams
            .entry(aggregate_id)
            .or_default()
            .extend(stored_events.iter().cloned());
        inner.notifications.extend(notifications);

        Ok(stored_events)
    }

    #[instrument(skip(self), fields(id = ?id))]
    async fn load(&self, id: &A::Id) -> Result<Vec<StoredEvent<A::Event>>> {
        let aggregate_id = id.to_string();
        let inner = self.inner.lock().expect("in-memory store mutex poisoned");
        Ok(inner.streams.get(&aggregate_id).cloned().unwrap_or_default())
    }

    #[instrument(skip(self), fields(id = ?id, version))]
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<StoredEvent<A::Event>>> {
        let aggregate_id = id.to_string();
        let inner = self.inner.lock().expect("in-memory store mutex poisoned");
        Ok(inner
            .streams
            .get(&aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.version() > version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn load_raw(
        &self,
        id: &A::Id,
        version: i64,
    ) -> Result<Vec<crate::upcaster::RawStoredEvent>> {
        let aggregate_id = id.to_string();
        let inner = self.inner.lock().expect("in-memory store mutex poisoned");

        match inner.streams.get(&aggregate_id) {
            Some(stream) => stream
                .iter()
                .filter(|e| e.version() > version)
                .map(|e| {
                    serde_json::to_value(e.event())
                        .map_err(|se| crate::Error::Store(se.to_string()))
                        .map(|payload| crate::upcaster::RawStoredEvent {
                            aggregate_id: e.aggregate_id().to_string(),
                            version: e.version(),
                            event_version: e.event_version(),
                            event_type: e.event_type().to_string(),
                            recorded_at: e.recorded_at(),
                            payload,
                        })
                })
                .collect::<Result<Vec<_>>>(),
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self), fields(id = ?id, gt, lte, desc, limit))]
    async fn load_raw_range(
        &self,
        id: &A::Id,
        gt: Option<i64>,
        lte: Option<i64>,
        desc: bool,
        limit: Option<usize>,
    ) -> Result<Vec<crate::upcaster::RawStoredEvent>> {
        let aggregate_id = id.to_string();
        let inner = self.inner.lock().expect("in-memory store mutex poisoned");

        let mut events: Vec<crate::upcaster::RawStoredEvent> = match inner.streams.get(&aggregate_id) {
            Some(stream) => stream
                .iter()
                .filter(|e| e.version() > gt.unwrap_or(0) && lte.map_or(true, |lte| e.version() <= lte))
                .map(|e| {
                    serde_json::to_value(e.event())
                        .map_err(|se| crate::Error::Store(se.to_string()))
                        .map(|payload| crate::upcaster::RawStoredEvent {
                            aggregate_id: e.aggregate_id().to_string(),
                            version: e.version(),
                            event_version: e.event_version(),
                            event_type: e.event_type().to_string(),
                            recorded_at: e.recorded_at(),
                            payload,
                        })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

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
impl<A> NotificationStore<A::Event> for InMemoryEventStore<A>
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
        let inner = self.inner.lock().expect("in-memory store mutex poisoned");
        Ok(inner
            .notifications
            .iter()
            .filter(|n| n.id >= start && stop.map(|s| n.id <= s).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn max_notification_id(&self) -> Result<i64> {
        let inner = self.inner.lock().expect("in-memory store mutex poisoned");
        Ok(inner.next_notification_id - 1)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    enum Ev {
        Created,
    }

    impl Event for Ev {
        fn event_type(&self) -> &'static str {
            "Created"
        }
        fn event_version(&self) -> u16 {
            1
        }
        fn event_source(&self) -> &'static str {
            "urn:sourcerer:test"
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Snap;
    impl crate::Snapshot for Snap {}

    #[derive(Default, Debug)]
    struct Agg {
        id: Uuid,
        version: i64,
    }

    #[async_trait]
    impl Aggregate for Agg {
        type Id = Uuid;
        type Event = Ev;
        type Command = ();
        type Snapshot = Snap;
        type Error = std::convert::Infallible;

        fn id(&self) -> &Self::Id {
            &self.id
        }
        fn version(&self) -> i64 {
            self.version
        }
        fn apply(&mut self, _event: &Self::Event) {
            self.version += 1;
        }
        async fn handle(
            &self,
            _command: Self::Command,
        ) -> std::result::Result<Vec<Self::Event>, Self::Error> {
            Ok(Vec::new())
        }
        fn from_snapshot(_snapshot: Self::Snapshot) -> Self {
            Self::default()
        }
        fn snapshot(&self) -> Self::Snapshot {
            Snap
        }
    }

    #[tokio::test]
    async fn notification_ids_are_dense_and_contiguous_across_aggregates() {
        let store = InMemoryEventStore::<Agg>::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.append(&a, 0, vec![Ev::Created]).await.unwrap();
        store.append(&b, 0, vec![Ev::Created, Ev::Created]).await.unwrap();

        let notifications = store.select_notifications(1, 10, None).await.unwrap();
        assert_eq!(
            notifications.iter().map(|n| n.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(store.max_notification_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn conflicting_append_leaves_notification_log_untouched() {
        let store = InMemoryEventStore::<Agg>::default();
        let a = Uuid::new_v4();
        store.append(&a, 0, vec![Ev::Created]).await.unwrap();

        let err = store.append(&a, 0, vec![Ev::Created]).await.unwrap_err();
        assert!(matches!(err, crate::Error::Conflict));
        assert_eq!(store.max_notification_id().await.unwrap(), 1);
    }
}
