use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while encoding or decoding broker payloads.
#[derive(Debug, Error)]
pub enum CodecError {
  #[error("binary codec failed: {0}")]
  Binary(#[from] bincode::Error),

  #[error("structured codec failed: {0}")]
  Structured(#[from] serde_json::Error),
}

/// Wire format for broker payloads.
///
/// `Binary` is compact and carries anything serde can represent, but is
/// only meant to be produced and consumed by the same codebase.
/// `Structured` restricts payloads to JSON-representable primitives,
/// arrays and mappings, and is safe to exchange across trust
/// boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
  #[default]
  Binary,
  Structured,
}

impl Serializer {
  pub fn encode<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, CodecError> {
    match self {
      Serializer::Binary => Ok(bincode::serialize(record)?),
      Serializer::Structured => Ok(serde_json::to_vec(record)?),
    }
  }

  pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
    match self {
      Serializer::Binary => Ok(bincode::deserialize(payload)?),
      Serializer::Structured => Ok(serde_json::from_slice(payload)?),
    }
  }
}
