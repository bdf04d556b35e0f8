use anyhow::{Context, Result};
use bytes::Bytes;
use durable_core::codec::{Decoder, Encoder};
use serde::{Deserialize, Serialize};

/// Stores business payloads as JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Encoder<T> for JsonCodec
where
    T: Serialize,
{
    fn encode(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

impl<T> Decoder<T> for JsonCodec
where
    T: for<'de> Deserialize<'de>,
{
    fn decode(&self, bytes: Bytes) -> Result<T> {
        // Instances created without a payload carry empty data.
        let bytes = if bytes.is_empty() {
            Bytes::from_static(b"null")
        } else {
            bytes
        };
        serde_json::from_slice(&bytes).context("Malformed workflow payload")
    }
}
