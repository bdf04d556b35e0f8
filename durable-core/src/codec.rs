//! Codecs for interpreter business payloads.
//!
//! The runtime treats workflow data as opaque bytes. Interpreters that keep a
//! typed state pick a codec to move between the two.

use anyhow::Result;
use bytes::Bytes;

/// An encoder that can serialize a value into a byte stream.
pub trait Encoder<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Bytes>;
}

/// A decoder that can deserialize a value from a byte stream.
pub trait Decoder<T>: Send + Sync + 'static {
    fn decode(&self, bytes: Bytes) -> Result<T>;
}
