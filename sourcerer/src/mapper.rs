//! Packs an event into a byte payload and unpacks it again, composing the
//! transcoder, the optional compressor/cipher stages, and the upcaster
//! chain.
//!
//! The write pipeline is `transcode -> compress? -> encrypt?`; the read
//! pipeline is its exact inverse, followed by upcasting and finally
//! materialization into the resolved event type. A `Mapper` is stateless
//! between calls and holds only `Arc`s, so it is `Clone + Send + Sync` and
//! safe to share across threads.
use std::sync::Arc;

use crate::{
    Error, Event, Result,
    pipeline::{Cipher, Compressor, IdentityCompressor},
    transcoder::Transcoder,
    upcaster::{RawStoredEvent, UpcasterChain},
};

/// Packs and unpacks events through the mapper's byte pipeline.
pub struct Mapper<E: Event> {
    transcoder: Transcoder,
    compressor: Arc<dyn Compressor>,
    cipher: Option<Arc<dyn Cipher>>,
    upcasters: UpcasterChain<E>,
}

impl<E: Event> Default for Mapper<E> {
    fn default() -> Self {
        Self {
            transcoder: Transcoder::new(),
            compressor: Arc::new(IdentityCompressor),
            cipher: None,
            upcasters: UpcasterChain::new(),
        }
    }
}

impl<E: Event> Mapper<E> {
    /// Creates a mapper with no compression, no encryption, and an empty
    /// upcaster chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a compression stage. Absent, the pipeline uses
    /// [`IdentityCompressor`].
    #[must_use]
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Installs an encryption stage. Absent, state is written unencrypted.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Installs the upcaster chain applied to older payloads on read.
    #[must_use]
    pub fn with_upcasters(mut self, upcasters: UpcasterChain<E>) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Returns the canonical topic string for an event: its CloudEvent
    /// `source` joined with its `event_type`. This is the stable on-disk
    /// identifier used by readers to resolve the concrete event class.
    pub fn topic(event: &E) -> String {
        format!("{}#{}", event.event_source(), event.event_type())
    }

    /// Runs the write pipeline, producing the opaque `state` bytes stored
    /// alongside an event's metadata.
    pub fn encode(&self, event: &E) -> Result<Vec<u8>> {
        let value = self.transcoder.encode(event)?;
        let bytes = serde_json::to_vec(&value).map_err(|e| Error::Encoding(e.to_string()))?;
        let bytes = self.compressor.compress(&bytes)?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.encrypt(&bytes)?,
            None => bytes,
        };
        Ok(bytes)
    }

    /// Runs the read pipeline, inverting [`Mapper::encode`] to recover the
    /// canonical JSON payload (pre-upcast, pre-materialization).
    pub fn decode_payload(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        let bytes = match &self.cipher {
            Some(cipher) => cipher.decrypt(bytes)?,
            None => bytes.to_vec(),
        };
        let bytes = self.compressor.decompress(&bytes)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Decoding(e.to_string()))
    }

    /// Upcasts and materializes a raw stored event (whose payload is
    /// already a decoded JSON value) into the concrete event type.
    pub fn materialize(&self, raw: RawStoredEvent) -> Result<E> {
        let upcasted = self.upcasters.upcast(raw)?;
        self.transcoder.decode(upcasted.payload)
    }

    /// Inverts the full byte pipeline and materializes an event from raw
    /// `state` bytes, given the metadata recorded alongside them.
    pub fn materialize_bytes(
        &self,
        aggregate_id: String,
        version: i64,
        event_version: u16,
        event_type: String,
        recorded_at: chrono::DateTime<chrono::Utc>,
        state: &[u8],
    ) -> Result<E> {
        let payload = self.decode_payload(state)?;
        self.materialize(RawStoredEvent {
            aggregate_id,
            version,
            event_version,
            event_type,
            recorded_at,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::upcaster::Upcaster;

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

    #[test]
    fn encode_decode_round_trips_with_identity_pipeline() {
        let mapper: Mapper<WidgetCreatedV2> = Mapper::new();
        let event = WidgetCreatedV2 {
            what: "dinosaurs".to_string(),
            when: Some("now".to_string()),
        };

        let bytes = mapper.encode(&event).expect("encode");
        let raw = RawStoredEvent {
            aggregate_id: "agg-1".to_string(),
            version: 1,
            event_version: 2,
            event_type: "WidgetCreated".to_string(),
            recorded_at: chrono::Utc::now(),
            payload: mapper.decode_payload(&bytes).expect("decode payload"),
        };
        let materialized = mapper.materialize(raw).expect("materialize");
        assert_eq!(materialized, event);
    }

    #[test]
    fn upcasts_v1_payload_before_materializing() {
        let mapper: Mapper<WidgetCreatedV2> =
            Mapper::new().with_upcasters(UpcasterChain::new().with(WidgetCreatedV1ToV2));

        let v1 = WidgetCreatedV1 {
            what: "trucks".to_string(),
        };
        let payload = serde_json::to_value(&v1).expect("serialize v1");

        let raw = RawStoredEvent {
            aggregate_id: "agg-1".to_string(),
            version: 1,
            event_version: 1,
            event_type: "WidgetCreated".to_string(),
            recorded_at: chrono::Utc::now(),
            payload,
        };

        let materialized = mapper.materialize(raw).expect("materialize");
        assert_eq!(materialized.what, "trucks");
        assert!(materialized.when.is_none());
    }

    #[cfg(feature = "aes-gcm-cipher")]
    #[test]
    fn encrypted_state_cannot_be_decoded_with_wrong_key() {
        use crate::pipeline::AesGcmCipher;

        let mapper: Mapper<WidgetCreatedV2> =
            Mapper::new().with_cipher(Arc::new(AesGcmCipher::new([7u8; 32])));
        let other_mapper: Mapper<WidgetCreatedV2> =
            Mapper::new().with_cipher(Arc::new(AesGcmCipher::new([9u8; 32])));

        let event = WidgetCreatedV2 {
            what: "dinosaurs".to_string(),
            when: None,
        };
        let bytes = mapper.encode(&event).expect("encode");

        assert!(!bytes.windows(b"dinosaurs".len()).any(|w| w == b"dinosaurs"));

        let err = other_mapper
            .decode_payload(&bytes)
            .expect_err("wrong key must fail");
        assert!(matches!(err, Error::Cipher(_)));
    }
}
