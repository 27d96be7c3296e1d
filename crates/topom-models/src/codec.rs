//! JSON encoding shared by every persisted entity.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Encodes an entity as pretty-printed JSON (two-space indent).
///
/// Entities are plain records, so serialization cannot fail; a failure
/// here means a type with a non-string map key slipped into the model.
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    match serde_json::to_vec_pretty(value) {
        Ok(buf) => buf,
        Err(e) => panic!("entity failed to encode: {e}"),
    }
}

/// Decodes an entity read from `path`. Unknown keys are ignored.
pub fn decode<T: DeserializeOwned>(path: &str, data: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(data).map_err(|source| StoreError::Codec {
        path: path.to_owned(),
        source,
    })
}
