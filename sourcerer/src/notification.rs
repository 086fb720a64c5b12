//! The notification log: a single, globally-ordered sequence of every event
//! recorded by a store, readable in stable sections by downstream consumers
//! (projections, replicas, other applications).
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{Event, Result};

/// One entry in the notification log.
///
/// Unlike [`crate::StoredEvent`], a notification's payload is always
/// byte-opaque (`state`) to downstream readers — they are not assumed to
/// share the producer's event types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification<E: Event> {
    /// The globally monotonic id assigned to this notification at commit
    /// time. Dense and strictly increasing across the whole store.
    pub id: i64,
    /// The ID of the aggregate this event belongs to.
    pub aggregate_id: String,
    /// The version of the aggregate after this event was applied.
    pub version: i64,
    /// The type of the event.
    pub event_type: String,
    /// The time at which this event was durably recorded.
    pub recorded_at: DateTime<Utc>,
    /// The opaque, mapped payload of the event.
    pub state: Vec<u8>,
    #[serde(skip)]
    _event: std::marker::PhantomData<E>,
}

impl<E: Event> Notification<E> {
    /// Creates a new notification.
    pub fn new(
        id: i64,
        aggregate_id: String,
        version: i64,
        event_type: String,
        recorded_at: DateTime<Utc>,
        state: Vec<u8>,
    ) -> Self {
        Self {
            id,
            aggregate_id,
            version,
            event_type,
            recorded_at,
            state,
            _event: std::marker::PhantomData,
        }
    }
}

/// A capability for reading the notification log of a store.
///
/// This is the sole read path for downstream consumers: a notification id,
/// once returned, is never returned again with different content.
/// Notifications below the current maximum that are not yet visible
/// represent in-flight or aborted transactions; see [`NotificationLogReader`]
/// for the policy that resolves them.
#[async_trait]
pub trait NotificationStore<E: Event>: Send + Sync {
    /// Returns the next `limit` notifications with `id >= start` (and, if
    /// `stop` is given, `id <= stop`), ordered by id.
    async fn select_notifications(
        &self,
        start: i64,
        limit: usize,
        stop: Option<i64>,
    ) -> Result<Vec<Notification<E>>>;

    /// Returns the greatest notification id currently assigned.
    ///
    /// Depending on backend capability this may include ids assigned to
    /// in-flight (not yet committed) transactions; readers must not assume
    /// every id up to this value is visible yet.
    async fn max_notification_id(&self) -> Result<i64>;
}

/// A half-open `[start, start+limit)` slice of the notification log,
/// addressable by downstream services for HTTP/REST-style pagination.
#[derive(Debug, Clone)]
pub struct Section<E: Event> {
    /// The notifications contained in this section, in id order.
    pub items: Vec<Notification<E>>,
    /// A stable identifier for this section, e.g. `"1,10"`.
    pub section_id: String,
    /// The id to request for the next section, if any items were returned.
    pub next_id: Option<i64>,
    /// The id that would produce the previous section, if this is not the
    /// first section.
    pub previous_id: Option<i64>,
}

/// Pull-based, idempotent, restartable reader over a store's notification
/// log.
///
/// Consumers call [`NotificationLogReader::read`] to stream notifications
/// from a given id forward, or [`NotificationLogReader::section`] to fetch a
/// single named page for REST-style pagination.
///
/// ## Gap handling
///
/// At each page boundary, if the store's current maximum notification id
/// exceeds the last id returned yet the next ids are missing, the reader
/// waits briefly and re-polls — gaps from concurrent in-flight writers
/// typically close within a bounded window. Once `gap_tolerance` elapses
/// with the gap still open, the reader treats it as permanent (an aborted
/// transaction) and advances past it. A consumer that has accepted
/// notification id `N` therefore has an implicit guarantee that no id `< N`
/// will ever appear later.
pub struct NotificationLogReader<S> {
    store: S,
    section_size: usize,
    gap_tolerance: Duration,
    poll_interval: Duration,
}

impl<S> NotificationLogReader<S> {
    /// Creates a reader with the default section size (100) and gap
    /// tolerance (2 seconds).
    pub fn new(store: S) -> Self {
        Self {
            store,
            section_size: 100,
            gap_tolerance: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Overrides the number of notifications fetched per page.
    #[must_use]
    pub fn with_section_size(mut self, section_size: usize) -> Self {
        self.section_size = section_size;
        self
    }

    /// Overrides how long a persistent gap is tolerated before the reader
    /// gives up waiting for it to close and advances past it.
    #[must_use]
    pub fn with_gap_tolerance(mut self, gap_tolerance: Duration) -> Self {
        self.gap_tolerance = gap_tolerance;
        self
    }

    /// Overrides the delay between re-poll attempts while waiting for a gap
    /// to close.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl<S> NotificationLogReader<S> {
    /// Fetches one page of up to `section_size` notifications starting at
    /// `start`, applying the gap-tolerance policy described on the type.
    ///
    /// The returned page is always a contiguous run of ids starting exactly
    /// at `cursor` — a later item in the same `select_notifications` result
    /// never gets surfaced ahead of an unresolved gap, even though the
    /// underlying query only filters on `id >= cursor` and so may legally
    /// return one.
    #[instrument(skip(self), fields(start))]
    pub async fn read_page<E>(&self, start: i64) -> Result<Vec<Notification<E>>>
    where
        S: NotificationStore<E>,
        E: Event,
    {
        let deadline = tokio::time::Instant::now() + self.gap_tolerance;
        let mut cursor = start;

        loop {
            let page = self
                .store
                .select_notifications(cursor, self.section_size, None)
                .await?;

            let contiguous: Vec<_> = page
                .into_iter()
                .enumerate()
                .take_while(|(offset, notification)| notification.id == cursor + *offset as i64)
                .map(|(_, notification)| notification)
                .collect();

            if !contiguous.is_empty() {
                return Ok(contiguous);
            }

            let max_id = self.store.max_notification_id().await?;
            if max_id < cursor {
                // Nothing has been written at or past `cursor` yet.
                return Ok(Vec::new());
            }

            if tokio::time::Instant::now() >= deadline {
                // The gap at `cursor` has persisted beyond tolerance; treat
                // it as an abandoned transaction and advance past it.
                cursor += 1;
                if cursor > max_id {
                    return Ok(Vec::new());
                }
                continue;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Returns an unbounded stream of notifications starting at `start`, in
    /// id order. Pages transparently, applies the gap-tolerance policy, and
    /// keeps polling for newly written notifications once it catches up —
    /// the stream never ends on its own; the consumer drops it to stop.
    ///
    /// Requires `S: Clone` (stores are typically cheap `Arc`-backed handles)
    /// so each page fetch can own its state across `.await` points.
    pub fn read<E>(self, start: i64) -> impl Stream<Item = Result<Notification<E>>>
    where
        S: NotificationStore<E> + Clone + 'static,
        E: Event + 'static,
    {
        struct State<S, E: Event> {
            reader: NotificationLogReader<S>,
            buffer: std::collections::VecDeque<Notification<E>>,
            cursor: i64,
        }

        let initial = State {
            reader: self,
            buffer: std::collections::VecDeque::new(),
            cursor: start,
        };

        stream::unfold(initial, |mut state| async move {
            loop {
                if let Some(item) = state.buffer.pop_front() {
                    state.cursor = item.id + 1;
                    return Some((Ok(item), state));
                }
                match state.reader.read_page(state.cursor).await {
                    Ok(page) if page.is_empty() => {
                        tokio::time::sleep(state.reader.poll_interval).await;
                    }
                    Ok(page) => {
                        state.buffer.extend(page);
                    }
                    Err(e) => return Some((Err(e), state)),
                }
            }
        })
    }

    /// Returns notifications as a named section, e.g. `"1,10"`, together
    /// with cursors to its neighboring sections.
    pub async fn section<E>(&self, start: i64, limit: usize) -> Result<Section<E>>
    where
        S: NotificationStore<E>,
        E: Event,
    {
        let items = self
            .store
            .select_notifications(start, limit, None)
            .await?;

        let next_id = items.last().map(|n| n.id + 1);
        let previous_id = if start > 1 {
            Some((start - limit.max(1) as i64).max(1))
        } else {
            None
        };

        Ok(Section {
            section_id: format!("{start},{}", start + limit as i64 - 1),
            items,
            next_id,
            previous_id,
        })
    }
}
