//! Bidirectional mapping between structured event/snapshot values and the
//! canonical byte payload used by the mapper pipeline.
//!
//! The canonical intermediate form is a self-describing `serde_json::Value`;
//! the wire encoding is its stable UTF-8 textual serialization. This
//! collapses the "registry of named codecs" described by the spec into the
//! ecosystem's own `serde`/`serde_json` round trip rather than hand-rolling a
//! tag dispatch table — every store already leans on `serde_json::to_value`/
//! `from_value` for exactly this purpose.
use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

/// Transcodes values to and from the canonical JSON byte payload.
///
/// Stateless and safe to share across threads; holds no registry because
/// `serde`'s derive machinery already resolves the value <-> JSON mapping at
/// compile time for every registered type.
#[derive(Debug, Default, Clone, Copy)]
pub struct Transcoder;

impl Transcoder {
    /// Creates a new transcoder.
    pub fn new() -> Self {
        Self
    }

    /// Encodes a value into the canonical `serde_json::Value` intermediate
    /// form. The mapper pipeline is responsible for turning this into the
    /// wire's UTF-8 bytes.
    ///
    /// Fails with `Error::Encoding` if the value cannot be represented in
    /// the canonical form (e.g. non-string map keys).
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<serde_json::Value> {
        serde_json::to_value(value).map_err(|e| Error::Encoding(e.to_string()))
    }

    /// Decodes a canonical `Value` back into a concrete value.
    ///
    /// Fails with `Error::Decoding` if the value does not match the
    /// requested type's schema.
    pub fn decode<T: DeserializeOwned>(&self, value: serde_json::Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| Error::Decoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn round_trips_registered_values() {
        let transcoder = Transcoder::new();
        let point = Point { x: 3, y: -7 };

        let value = transcoder.encode(&point).expect("encode");
        let decoded: Point = transcoder.decode(value).expect("decode");

        assert_eq!(point, decoded);
    }

    #[test]
    fn decoding_a_mismatched_value_fails() {
        let transcoder = Transcoder::new();
        let err = transcoder
            .decode::<Point>(serde_json::json!("not a point"))
            .expect_err("should fail to decode");
        assert!(matches!(err, Error::Decoding(_)));
    }
}
