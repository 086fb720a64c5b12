//! Provides a generic repository for interacting with aggregates.
use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use tracing::instrument;

use crate::{
    Aggregate, Error, EventStore, Result, mapper::Mapper, snapshot::SnapshotStore,
    upcaster::UpcasterChain,
};

/// Defines the standard interface for a repository.
#[async_trait]
pub trait Repository<A: Aggregate>: Send + Sync {
    /// Loads the current state of an aggregate from the store.
    async fn load(&self, id: &A::Id) -> Result<A> {
        self.load_at_version(id, None).await
    }

    /// Loads an aggregate, replaying events only up to `version` (inclusive).
    ///
    /// `None` behaves exactly like [`Repository::load`] — the aggregate's
    /// current state. A snapshot is only used as a starting point if it was
    /// taken at or before the requested version; otherwise replay starts
    /// from scratch.
    async fn load_at_version(&self, id: &A::Id, version: Option<i64>) -> Result<A>;

    /// Saves a new list of events for an aggregate.
    async fn save(&self, aggregate: &A, new_events: Vec<A::Event>) -> Result<()>;
}

/// A generic, high-level repository for loading and saving aggregates.
///
/// This repository simplifies the common load-handle-save cycle by
/// orchestrating the `EventStore` and an optional `SnapshotStore`.
pub struct GenericRepository<A, S, SS>
where
    A: Aggregate,
    S: EventStore<A>,
    SS: SnapshotStore<A>,
{
    store: Arc<S>,
    snapshot_store: Option<Arc<SS>>,
    mapper: Mapper<A::Event>,
    snapshot_frequency: Option<usize>,
    _phantom: PhantomData<A>,
}

impl<A, S, SS> GenericRepository<A, S, SS>
where
    A: Aggregate,
    S: EventStore<A>,
    SS: SnapshotStore<A>,
{
    /// Creates a new `GenericRepository`.
    pub fn new(store: Arc<S>, snapshot_store: Option<Arc<SS>>) -> Self {
        Self {
            store,
            snapshot_store,
            mapper: Mapper::new(),
            snapshot_frequency: None,
            _phantom: PhantomData,
        }
    }

    /// Sets the upcaster chain consulted when materializing older events.
    ///
    /// Shorthand for `with_mapper(Mapper::new().with_upcasters(upcasters))`
    /// when no compression or encryption stage is needed.
    pub fn with_upcasters(mut self, upcasters: UpcasterChain<A::Event>) -> Self {
        self.mapper = Mapper::new().with_upcasters(upcasters);
        self
    }

    /// Sets the full mapper (transcoder, optional compressor/cipher, and
    /// upcaster chain) used to materialize stored events on load.
    pub fn with_mapper(mut self, mapper: Mapper<A::Event>) -> Self {
        self.mapper = mapper;
        self
    }

    /// Sets the frequency at which snapshots should be created.
    ///
    /// For example, a value of `Some(100)` means a snapshot will be created
    /// every 100 events.
    pub fn with_snapshot_frequency(mut self, frequency: Option<usize>) -> Self {
        self.snapshot_frequency = frequency;
        self
    }
}

#[async_trait]
impl<A, S, SS> Repository<A> for GenericRepository<A, S, SS>
where
    A: Aggregate,
    S: EventStore<A> + 'static,
    SS: SnapshotStore<A> + 'static,
{
    #[instrument(skip(self), fields(aggregate.id = ?id, version))]
    async fn load_at_version(&self, id: &A::Id, version: Option<i64>) -> Result<A> {
        // Attempt to hydrate the aggregate from a snapshot first so we can
        // replay only the delta of events that occurred afterwards. A
        // snapshot taken after the requested version would overshoot it, so
        // it is only used when it does not exceed `version`.
        let (mut aggregate, starting_version, has_snapshot) =
            if let Some(snapshot_store) = &self.snapshot_store {
                match snapshot_store.load(id).await? {
                    Some(stored) if version.map_or(true, |v| stored.version() <= v) => {
                        let v = stored.version();
                        let snap = stored.into_snapshot();
                        (A::from_snapshot(snap), v, true)
                    }
                    _ => (A::default(), 0, false),
                }
            } else {
                (A::default(), 0, false)
            };

        // Load all events that occurred after the snapshot (or from scratch)
        // up to the requested version, letting the store apply the range
        // filter natively instead of decoding the whole tail and discarding
        // everything past `version` here.
        let raw_events = self
            .store
            .load_raw_range(id, Some(starting_version), version, false, None)
            .await?;

        // Guard against loading a non-existing aggregate.
        if raw_events.is_empty() && !has_snapshot {
            return Err(Error::NotFound);
        }

        for raw_event in raw_events {
            let event = self.mapper.materialize(raw_event)?;
            aggregate.apply(&event);
        }

        Ok(aggregate)
    }

    #[instrument(skip(self, aggregate, new_events), fields(aggregate.id = ?aggregate.id()))]
    async fn save(&self, aggregate: &A, new_events: Vec<A::Event>) -> Result<()> {
        if new_events.is_empty() {
            return Ok(());
        }

        let version_before_save = aggregate.version() - new_events.len() as i64;
        let num_new_events = new_events.len() as i64;

        self.store
            .append(aggregate.id(), version_before_save, new_events)
            .await?;

        if let (Some(snapshot_store), Some(frequency)) =
            (&self.snapshot_store, self.snapshot_frequency)
        {
            let version_after_save = version_before_save + num_new_events;
            if version_after_save / frequency as i64 > version_before_save / frequency as i64 {
                let snapshot = aggregate.snapshot();
                snapshot_store
                    .save(aggregate.id(), version_after_save, snapshot)
                    .await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl<A, R> Repository<A> for Arc<R>
where
    A: Aggregate,
    R: Repository<A> + Send + Sync,
{
    async fn load_at_version(&self, aggregate_id: &A::Id, version: Option<i64>) -> Result<A> {
        (**self).load_at_version(aggregate_id, version).await
    }

    async fn save(&self, aggregate: &A, events: Vec<A::Event>) -> Result<()> {
        (**self).save(aggregate, events).await
    }
}
