//! End-to-end scenarios exercising the store/mapper/repository/notification
//! stack together, rather than each module in isolation.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sourcerer::{
    Aggregate, Error, Event, EventStore, Result, Snapshot, StoredEvent, async_trait,
    notification::NotificationLogReader,
    repository::{GenericRepository, Repository},
    snapshot::SnapshotStore,
    store::{in_memory::InMemoryEventStore, in_memory_snapshot::InMemorySnapshotStore},
    upcaster::{RawStoredEvent, Upcaster, UpcasterChain},
};

/// An aggregate that just accumulates the journal entries it has been told
/// about, in order. Used by the full-history and partial-replay scenarios.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
enum JournalEvent {
    Entered(String),
}

impl Event for JournalEvent {
    fn event_type(&self) -> &'static str {
        "Entered"
    }
    fn event_version(&self) -> u16 {
        1
    }
    fn event_source(&self) -> &'static str {
        "urn:sourcerer:journal"
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct JournalSnapshot {
    history: Vec<String>,
}
impl Snapshot for JournalSnapshot {}

#[derive(Default, Debug)]
struct Journal {
    id: Uuid,
    version: i64,
    history: Vec<String>,
}

#[async_trait]
impl Aggregate for Journal {
    type Id = Uuid;
    type Event = JournalEvent;
    type Command = ();
    type Snapshot = JournalSnapshot;
    type Error = std::convert::Infallible;

    fn id(&self) -> &Self::Id {
        &self.id
    }
    fn version(&self) -> i64 {
        self.version
    }
    fn apply(&mut self, event: &Self::Event) {
        let JournalEvent::Entered(what) = event;
        self.history.push(what.clone());
        self.version += 1;
    }
    async fn handle(
        &self,
        _command: Self::Command,
    ) -> std::result::Result<Vec<Self::Event>, Self::Error> {
        Ok(Vec::new())
    }
    fn from_snapshot(snapshot: Self::Snapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: snapshot.history.len() as i64,
            history: snapshot.history,
        }
    }
    fn snapshot(&self) -> Self::Snapshot {
        JournalSnapshot {
            history: self.history.clone(),
        }
    }
}

fn journal_repo()
-> GenericRepository<Journal, InMemoryEventStore<Journal>, InMemorySnapshotStore<Journal>> {
    GenericRepository::new(
        Arc::new(InMemoryEventStore::<Journal>::default()),
        Some(Arc::new(InMemorySnapshotStore::<Journal>::default())),
    )
}

// Scenario 1: create, apply three commands, save, reload → full history.
#[tokio::test]
async fn create_apply_save_reload_replays_full_history() {
    let repo = journal_repo();
    let id = Uuid::new_v4();

    let mut agg = Journal {
        id,
        ..Default::default()
    };
    let events = vec![
        JournalEvent::Entered("dinosaurs".to_string()),
        JournalEvent::Entered("trucks".to_string()),
        JournalEvent::Entered("internet".to_string()),
    ];
    for event in &events {
        agg.apply(event);
    }
    repo.save(&agg, events).await.expect("save");

    let reloaded = repo.load(&id).await.expect("reload");
    assert_eq!(reloaded.history, vec!["dinosaurs", "trucks", "internet"]);
    assert_eq!(reloaded.version(), 3);
}

// Scenario 2: save four events, read the notification section [1,10] →
// exactly four notifications, ids 1..4.
#[tokio::test]
async fn notification_section_reports_every_appended_event() {
    let store = Arc::new(InMemoryEventStore::<Journal>::default());
    let id = Uuid::new_v4();

    store
        .append(
            &id,
            0,
            vec![
                JournalEvent::Entered("a".to_string()),
                JournalEvent::Entered("b".to_string()),
                JournalEvent::Entered("c".to_string()),
                JournalEvent::Entered("d".to_string()),
            ],
        )
        .await
        .expect("append");

    let reader = NotificationLogReader::new(store.as_ref().clone());
    let section = reader.section(1, 10).await.expect("section");
    assert_eq!(
        section.items.iter().map(|n| n.id).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
}

// Scenario 3: load at a specific version after four events were written →
// only the events up to (and including) that version are replayed. This is
// the only coverage of `Repository::load_at_version`'s partial-replay path.
#[tokio::test]
async fn load_at_version_replays_only_events_up_to_the_requested_version() {
    let repo = journal_repo();
    let id = Uuid::new_v4();

    let mut agg = Journal {
        id,
        ..Default::default()
    };
    let events = vec![
        JournalEvent::Entered("dinosaurs".to_string()),
        JournalEvent::Entered("trucks".to_string()),
        JournalEvent::Entered("internet".to_string()),
        JournalEvent::Entered("satellites".to_string()),
    ];
    for event in &events {
        agg.apply(event);
    }
    repo.save(&agg, events).await.expect("save");

    let partial = repo
        .load_at_version(&id, Some(2))
        .await
        .expect("load_at_version");
    assert_eq!(partial.history, vec!["dinosaurs", "trucks"]);
    assert_eq!(partial.version(), 2);

    let full = repo
        .load_at_version(&id, None)
        .await
        .expect("load_at_version(None)");
    assert_eq!(full.history.len(), 4);
}

// Snapshot-plus-replay: a snapshot taken mid-stream is used as the starting
// point and only the events recorded after it are replayed on top.
#[tokio::test]
async fn load_at_version_replays_from_a_snapshot_taken_mid_stream() {
    let event_store = Arc::new(InMemoryEventStore::<Journal>::default());
    let snapshot_store = Arc::new(InMemorySnapshotStore::<Journal>::default());
    let repo = GenericRepository::new(event_store.clone(), Some(snapshot_store.clone()));

    let id = Uuid::new_v4();
    event_store
        .append(
            &id,
            0,
            vec![
                JournalEvent::Entered("dinosaurs".to_string()),
                JournalEvent::Entered("trucks".to_string()),
            ],
        )
        .await
        .expect("append first batch");
    snapshot_store
        .save(
            &id,
            2,
            JournalSnapshot {
                history: vec!["dinosaurs".to_string(), "trucks".to_string()],
            },
        )
        .await
        .expect("save snapshot");
    event_store
        .append(&id, 2, vec![JournalEvent::Entered("internet".to_string())])
        .await
        .expect("append second batch");

    let loaded = repo.load(&id).await.expect("load");
    assert_eq!(loaded.history, vec!["dinosaurs", "trucks", "internet"]);
    assert_eq!(loaded.version(), 3);
}

// Scenario 4: two aggregates loaded at the same version each apply a
// command; the first save succeeds, the second raises a conflict, and the
// store retains only the winner's events.
#[tokio::test]
async fn concurrent_writers_at_the_same_version_exactly_one_conflicts() {
    let repo = journal_repo();
    let id = Uuid::new_v4();

    let mut seed = Journal {
        id,
        ..Default::default()
    };
    let seed_event = JournalEvent::Entered("dinosaurs".to_string());
    seed.apply(&seed_event);
    repo.save(&seed, vec![seed_event]).await.expect("seed save");

    // Two independent loads of the same version, racing to append.
    let first = repo.load(&id).await.expect("load for writer 1");
    let second = repo.load(&id).await.expect("load for writer 2");
    assert_eq!(first.version(), 1);
    assert_eq!(second.version(), 1);

    let mut first_next = Journal {
        id,
        version: first.version(),
        history: first.history.clone(),
    };
    let first_event = JournalEvent::Entered("trucks".to_string());
    first_next.apply(&first_event);
    repo.save(&first_next, vec![first_event])
        .await
        .expect("first writer wins");

    let mut second_next = Journal {
        id,
        version: second.version(),
        history: second.history.clone(),
    };
    let second_event = JournalEvent::Entered("internet".to_string());
    second_next.apply(&second_event);
    let err = repo
        .save(&second_next, vec![second_event])
        .await
        .expect_err("second writer must conflict");
    assert!(matches!(err, Error::Conflict));

    let reloaded = repo.load(&id).await.expect("reload after race");
    assert_eq!(reloaded.history, vec!["dinosaurs", "trucks"]);
}

// Scenario 6: an event stored under an old schema version is transparently
// upcast to the current shape before the aggregate ever sees it. Exercised
// through `Repository::load`, not `Mapper` directly, since that is the path
// a real application takes and the one that was previously untested.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct WidgetCreatedV1 {
    what: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct WidgetCreatedV2 {
    what: String,
    when: Option<String>,
}

impl Event for WidgetCreatedV2 {
    fn event_type(&self) -> &'static str {
        "WidgetCreated"
    }
    fn event_version(&self) -> u16 {
        2
    }
    fn event_source(&self) -> &'static str {
        "urn:sourcerer:widgets"
    }
}

struct WidgetCreatedV1ToV2;

impl Upcaster<WidgetCreatedV2> for WidgetCreatedV1ToV2 {
    fn event_type(&self) -> &'static str {
        "WidgetCreated"
    }
    fn source_version(&self) -> u16 {
        1
    }
    fn upcast(&self, mut payload: serde_json::Value) -> Result<serde_json::Value> {
        payload["when"] = serde_json::Value::Null;
        Ok(payload)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WidgetSnapshot;
impl Snapshot for WidgetSnapshot {}

#[derive(Default, Debug)]
struct Widget {
    id: Uuid,
    version: i64,
    what: Option<String>,
    when: Option<String>,
}

#[async_trait]
impl Aggregate for Widget {
    type Id = Uuid;
    type Event = WidgetCreatedV2;
    type Command = ();
    type Snapshot = WidgetSnapshot;
    type Error = std::convert::Infallible;

    fn id(&self) -> &Self::Id {
        &self.id
    }
    fn version(&self) -> i64 {
        self.version
    }
    fn apply(&mut self, event: &Self::Event) {
        self.what = Some(event.what.clone());
        self.when = event.when.clone();
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
        WidgetSnapshot
    }
}

/// An `EventStore` test double that only ever returns a fixed set of raw,
/// pre-upcast events, standing in for a backend that persisted an event
/// written under an older schema version.
struct FixedRawEventStore {
    raw: Vec<(i64, u16, serde_json::Value)>,
}

#[async_trait]
impl EventStore<Widget> for FixedRawEventStore {
    async fn append(
        &self,
        _id: &Uuid,
        _expected_version: i64,
        _events: Vec<WidgetCreatedV2>,
    ) -> Result<Vec<StoredEvent<WidgetCreatedV2>>> {
        unreachable!("this scenario only exercises the read path")
    }

    async fn load(&self, _id: &Uuid) -> Result<Vec<StoredEvent<WidgetCreatedV2>>> {
        Ok(Vec::new())
    }

    async fn load_from(&self, _id: &Uuid, _version: i64) -> Result<Vec<StoredEvent<WidgetCreatedV2>>> {
        Ok(Vec::new())
    }

    async fn load_raw(&self, id: &Uuid, version: i64) -> Result<Vec<RawStoredEvent>> {
        Ok(self
            .raw
            .iter()
            .filter(|(v, _, _)| *v > version)
            .map(|(version, event_version, payload)| RawStoredEvent {
                aggregate_id: id.to_string(),
                version: *version,
                event_version: *event_version,
                event_type: "WidgetCreated".to_string(),
                recorded_at: Utc::now(),
                payload: payload.clone(),
            })
            .collect())
    }
}

#[tokio::test]
async fn upcast_on_read_materializes_an_old_payload_in_the_current_shape() {
    let id = Uuid::new_v4();
    let v1_payload =
        serde_json::to_value(WidgetCreatedV1 {
            what: "trucks".to_string(),
        })
        .expect("serialize v1 payload");

    let store = Arc::new(FixedRawEventStore {
        raw: vec![(1, 1, v1_payload)],
    });
    let repo: GenericRepository<Widget, _, InMemorySnapshotStore<Widget>> =
        GenericRepository::new(store, None)
            .with_upcasters(UpcasterChain::new().with(WidgetCreatedV1ToV2));

    let widget = repo.load(&id).await.expect("load through upcaster chain");
    assert_eq!(widget.what.as_deref(), Some("trucks"));
    assert!(widget.when.is_none());
    assert_eq!(widget.version(), 1);
}

/// The same conflict and partial-replay scenarios, run against the embedded
/// SQL backend rather than the in-memory one, so the concurrency fix and
/// `load_raw_range` are each exercised against a real persistent backend too.
#[cfg(feature = "sqlite-storage")]
mod sqlite_backend {
    use super::*;
    use sourcerer::store::sqlite::{SqliteEventStore, SqliteSnapshotStore};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> sqlx::SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory sqlite pool")
    }

    #[tokio::test]
    async fn concurrent_writers_at_the_same_version_exactly_one_conflicts() {
        let pool = memory_pool().await;
        let store = SqliteEventStore::<Journal>::new(pool);
        store.setup().await.expect("setup");
        let id = Uuid::new_v4();

        store
            .append(&id, 0, vec![JournalEvent::Entered("dinosaurs".to_string())])
            .await
            .expect("seed append");

        store
            .append(&id, 1, vec![JournalEvent::Entered("trucks".to_string())])
            .await
            .expect("first writer wins");
        let err = store
            .append(&id, 1, vec![JournalEvent::Entered("internet".to_string())])
            .await
            .expect_err("second writer must conflict");
        assert!(matches!(err, Error::Conflict));

        let events = store.load(&id).await.expect("load");
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn load_at_version_replays_partial_history_against_a_persistent_backend() {
        let pool = memory_pool().await;
        let event_store = Arc::new(SqliteEventStore::<Journal>::new(pool.clone()));
        event_store.setup().await.expect("setup events");
        let snapshot_store = Arc::new(SqliteSnapshotStore::<Journal>::new(pool));
        snapshot_store.setup().await.expect("setup snapshots");

        let repo = GenericRepository::new(event_store.clone(), Some(snapshot_store));
        let id = Uuid::new_v4();
        event_store
            .append(
                &id,
                0,
                vec![
                    JournalEvent::Entered("dinosaurs".to_string()),
                    JournalEvent::Entered("trucks".to_string()),
                    JournalEvent::Entered("internet".to_string()),
                ],
            )
            .await
            .expect("append");

        let partial = repo
            .load_at_version(&id, Some(2))
            .await
            .expect("load_at_version");
        assert_eq!(partial.history, vec!["dinosaurs", "trucks"]);
    }
}
