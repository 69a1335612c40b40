//! Control-channel wire codec.
//!
//! Batch submissions travel between instances as XML documents in HTTP
//! bodies. Serialization is driven entirely by the serde shapes on
//! [`BatchSpec`].

use thiserror::Error;

use crate::payload::BatchSpec;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("batch serialization failed: {0}")]
    Serialize(#[source] quick_xml::DeError),

    #[error("batch deserialization failed: {0}")]
    Deserialize(#[source] quick_xml::DeError),
}

/// Serializes a batch for the wire.
pub fn to_xml(batch: &BatchSpec) -> Result<String, CodecError> {
    quick_xml::se::to_string(batch).map_err(CodecError::Serialize)
}

/// Decodes a batch from an incoming submission body.
pub fn from_xml(document: &str) -> Result<BatchSpec, CodecError> {
    quick_xml::de::from_str(document).map_err(CodecError::Deserialize)
}
