//! Binary encoding shared by the metadata and consolidated file formats

use std::io::Write;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode with the workspace's bincode settings
pub(crate) fn encode<T: Serialize>(value: &T) -> bincode::Result<Vec<u8>> {
    bincode::DefaultOptions::new().serialize(value)
}

/// Encoded size of `value` in bytes, without encoding it
pub(crate) fn encoded_size<T: Serialize>(value: &T) -> bincode::Result<u64> {
    bincode::DefaultOptions::new().serialized_size(value)
}

/// Encode straight into `writer`
pub(crate) fn encode_into<W: Write, T: Serialize>(writer: W, value: &T) -> bincode::Result<()> {
    bincode::DefaultOptions::new().serialize_into(writer, value)
}

/// Decode with a byte limit so corrupt length prefixes cannot trigger huge
/// allocations
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> bincode::Result<T> {
    bincode::DefaultOptions::new()
        .with_limit(bytes.len() as u64)
        .deserialize(bytes)
}
