//! Codecs for interpreter business payloads.

mod json;

pub use json::JsonCodec;

/// Re-export the codec traits from `durable-core`.
pub use durable_core::codec::{Decoder, Encoder};
