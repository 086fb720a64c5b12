//! Injected configuration record for selecting a store backend and its
//! optional mapper stages, replacing process-wide environment lookups with
//! an explicit value passed to a store factory.
use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    Aggregate, Error, EventStore, Result,
    mapper::Mapper,
    pipeline::{Cipher, Compressor},
    snapshot::SnapshotStore,
};

/// Selects which recorder backend a store factory should build.
#[derive(Debug, Clone)]
pub enum Backend {
    /// A single-process, in-memory backend. Deterministic ordering,
    /// primarily for tests.
    InMemory,
    /// An embedded single-file SQL database at the given path.
    Sqlite {
        /// Filesystem path to the database file.
        path: PathBuf,
    },
    /// An embedded `sled` key-value database at the given path.
    Sled {
        /// Filesystem path to the database directory.
        path: PathBuf,
    },
    /// A client-server PostgreSQL database, addressed by connection URL.
    Postgres {
        /// The `postgres://` connection URL.
        url: String,
    },
}

/// Configuration for the optional encryption stage.
#[derive(Debug, Clone)]
pub struct CipherConfig {
    /// The topic identifying which cipher implementation to use.
    pub topic: String,
    /// The symmetric key material, in whatever form the chosen cipher
    /// expects (e.g. 32 raw bytes for AES-256-GCM).
    pub key: Vec<u8>,
}

/// Configuration for the optional compression stage.
#[derive(Debug, Clone)]
pub struct CompressorConfig {
    /// The topic identifying which compressor implementation to use.
    pub topic: String,
}

/// The full set of configuration enumerated for the core: backend
/// selection, optional mapper stages, snapshotting, and backend timeouts.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Which backend to construct.
    pub backend: Backend,
    /// Enables the encryption stage when present.
    pub cipher: Option<CipherConfig>,
    /// Enables the compression stage when present.
    pub compressor: Option<CompressorConfig>,
    /// Whether the snapshot store should be populated and consulted.
    pub snapshotting_enabled: bool,
    /// Timeout for acquiring a backend connection.
    pub connection_timeout: Option<Duration>,
    /// Timeout for acquiring a backend write lock.
    pub lock_timeout: Option<Duration>,
}

impl StoreConfig {
    /// Returns a configuration for the in-memory backend with no optional
    /// mapper stages and snapshotting disabled — the out-of-the-box default.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::InMemory,
            cipher: None,
            compressor: None,
            snapshotting_enabled: false,
            connection_timeout: None,
            lock_timeout: None,
        }
    }

    /// Enables snapshotting.
    #[must_use]
    pub fn with_snapshotting(mut self, enabled: bool) -> Self {
        self.snapshotting_enabled = enabled;
        self
    }

    /// Installs an encryption configuration.
    #[must_use]
    pub fn with_cipher(mut self, cipher: CipherConfig) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Installs a compression configuration.
    #[must_use]
    pub fn with_compressor(mut self, compressor: CompressorConfig) -> Self {
        self.compressor = Some(compressor);
        self
    }
}

/// Builds the `EventStore`/`SnapshotStore`/`Mapper` trio described by a
/// [`StoreConfig`].
///
/// This is the single constructor path applications use instead of wiring
/// up a concrete backend module themselves; which concrete type backs the
/// returned trait objects depends entirely on `config.backend`, and is
/// otherwise opaque to the caller.
pub async fn build_store<A>(
    config: &StoreConfig,
) -> Result<(
    Arc<dyn EventStore<A>>,
    Option<Arc<dyn SnapshotStore<A>>>,
    Mapper<A::Event>,
)>
where
    A: Aggregate,
    A::Event: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
    A::Id: Clone + serde::Serialize + Send + Sync,
    A::Snapshot: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
{
    let (event_store, snapshot_store) = build_backend::<A>(config).await?;

    let mut mapper = Mapper::<A::Event>::new();
    if let Some(compressor_cfg) = &config.compressor {
        mapper = mapper.with_compressor(build_compressor(compressor_cfg)?);
    }
    if let Some(cipher_cfg) = &config.cipher {
        mapper = mapper.with_cipher(build_cipher(cipher_cfg)?);
    }

    Ok((event_store, snapshot_store, mapper))
}

#[allow(unused_variables)]
async fn build_backend<A>(
    config: &StoreConfig,
) -> Result<(Arc<dyn EventStore<A>>, Option<Arc<dyn SnapshotStore<A>>>)>
where
    A: Aggregate,
    A::Event: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
    A::Id: Clone + serde::Serialize + Send + Sync,
    A::Snapshot: serde::Serialize + serde::de::DeserializeOwned + Send + Sync,
{
    match &config.backend {
        Backend::InMemory => {
            #[cfg(feature = "in-memory")]
            {
                let event_store: Arc<dyn EventStore<A>> =
                    Arc::new(crate::store::in_memory::InMemoryEventStore::<A>::default());
                let snapshot_store: Option<Arc<dyn SnapshotStore<A>>> =
                    config.snapshotting_enabled.then(|| {
                        Arc::new(crate::store::in_memory_snapshot::InMemorySnapshotStore::<
                            A,
                        >::default()) as Arc<dyn SnapshotStore<A>>
                    });
                Ok((event_store, snapshot_store))
            }
            #[cfg(not(feature = "in-memory"))]
            Err(Error::Store(
                "in-memory backend requested but the `in-memory` feature is disabled".to_string(),
            ))
        }
        Backend::Sled { path } => {
            #[cfg(feature = "sled-storage")]
            {
                let db = sled::open(path).map_err(|e| Error::PersistenceOperation(e.to_string()))?;
                let event_store: Arc<dyn EventStore<A>> =
                    Arc::new(crate::store::sled::SledEventStore::<A>::new(db.clone()));
                let snapshot_store = if config.snapshotting_enabled {
                    let tree = db
                        .open_tree("__sourcerer_snapshots__")
                        .map_err(|e| Error::Store(e.to_string()))?;
                    Some(Arc::new(crate::store::sled_snapshot::SledSnapshotStore::<A>::new(
                        tree,
                    )) as Arc<dyn SnapshotStore<A>>)
                } else {
                    None
                };
                Ok((event_store, snapshot_store))
            }
            #[cfg(not(feature = "sled-storage"))]
            Err(Error::Store(
                "sled backend requested but the `sled-storage` feature is disabled".to_string(),
            ))
        }
        Backend::Sqlite { path } => {
            #[cfg(feature = "sqlite-storage")]
            {
                let url = format!("sqlite://{}?mode=rwc", path.display());
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(1)
                    .connect(&url)
                    .await
                    .map_err(|e| Error::PersistenceOperation(e.to_string()))?;

                let events = crate::store::sqlite::SqliteEventStore::<A>::new(pool.clone());
                events.setup().await.map_err(|e| Error::Store(e.to_string()))?;
                let event_store: Arc<dyn EventStore<A>> = Arc::new(events);

                let snapshot_store = if config.snapshotting_enabled {
                    let snapshots = crate::store::sqlite::SqliteSnapshotStore::<A>::new(pool);
                    snapshots.setup().await.map_err(|e| Error::Store(e.to_string()))?;
                    Some(Arc::new(snapshots) as Arc<dyn SnapshotStore<A>>)
                } else {
                    None
                };
                Ok((event_store, snapshot_store))
            }
            #[cfg(not(feature = "sqlite-storage"))]
            Err(Error::Store(
                "sqlite backend requested but the `sqlite-storage` feature is disabled"
                    .to_string(),
            ))
        }
        Backend::Postgres { url } => {
            #[cfg(feature = "postgres-storage")]
            {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .connect(url)
                    .await
                    .map_err(|e| Error::PersistenceOperation(e.to_string()))?;

                let events = crate::store::sqlx_postgres::SqlxEventStore::<A>::new(pool.clone());
                events.setup().await.map_err(|e| Error::Store(e.to_string()))?;
                let event_store: Arc<dyn EventStore<A>> = Arc::new(events);

                let snapshot_store = if config.snapshotting_enabled {
                    let snapshots = crate::store::sqlx_postgres::SqlxSnapshotStore::<A>::new(pool);
                    snapshots.setup().await.map_err(|e| Error::Store(e.to_string()))?;
                    Some(Arc::new(snapshots) as Arc<dyn SnapshotStore<A>>)
                } else {
                    None
                };
                Ok((event_store, snapshot_store))
            }
            #[cfg(not(feature = "postgres-storage"))]
            Err(Error::Store(
                "postgres backend requested but the `postgres-storage` feature is disabled"
                    .to_string(),
            ))
        }
    }
}

fn build_compressor(config: &CompressorConfig) -> Result<Arc<dyn Compressor>> {
    match config.topic.as_str() {
        #[cfg(feature = "gzip-compression")]
        "gzip" => Ok(Arc::new(crate::pipeline::GzipCompressor) as Arc<dyn Compressor>),
        other => Err(Error::Store(format!("unknown compressor topic: {other}"))),
    }
}

fn build_cipher(config: &CipherConfig) -> Result<Arc<dyn Cipher>> {
    match config.topic.as_str() {
        #[cfg(feature = "aes-gcm-cipher")]
        "aes-gcm" => {
            let key: [u8; 32] = config.key.clone().try_into().map_err(|_| {
                Error::Cipher("AES-256-GCM key must be exactly 32 bytes".to_string())
            })?;
            Ok(Arc::new(crate::pipeline::AesGcmCipher::new(key)) as Arc<dyn Cipher>)
        }
        other => Err(Error::Store(format!("unknown cipher topic: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_default_has_no_optional_stages() {
        let config = StoreConfig::in_memory();
        assert!(matches!(config.backend, Backend::InMemory));
        assert!(config.cipher.is_none());
        assert!(config.compressor.is_none());
        assert!(!config.snapshotting_enabled);
    }

    #[test]
    fn builder_methods_compose() {
        let config = StoreConfig::in_memory()
            .with_snapshotting(true)
            .with_cipher(CipherConfig {
                topic: "aes-gcm".to_string(),
                key: vec![0u8; 32],
            });
        assert!(config.snapshotting_enabled);
        assert_eq!(config.cipher.unwrap().key.len(), 32);
    }

    #[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
    enum Ev {
        Created,
    }

    impl crate::Event for Ev {
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

    #[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
    struct Snap;
    impl crate::Snapshot for Snap {}

    #[derive(Default, Debug)]
    struct Agg {
        id: uuid::Uuid,
        version: i64,
    }

    #[async_trait::async_trait]
    impl Aggregate for Agg {
        type Id = uuid::Uuid;
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
    async fn build_store_constructs_a_working_in_memory_backend() {
        let (event_store, snapshot_store, _mapper) =
            build_store::<Agg>(&StoreConfig::in_memory())
                .await
                .expect("build_store");
        assert!(snapshot_store.is_none());

        let id = uuid::Uuid::new_v4();
        event_store
            .append(&id, 0, vec![Ev::Created])
            .await
            .expect("append");
        let loaded = event_store.load(&id).await.expect("load");
        assert_eq!(loaded.len(), 1);
    }
}
