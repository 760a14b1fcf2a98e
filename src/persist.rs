//! Shared framing for the per-engine persistence formats.
//!
//! Every engine writes a 4-byte magic, a little-endian `u32` format
//! version, and a bincode payload. PRNG state is never persisted, so
//! structures derived from randomness (the RPT tree) are rebuilt after load
//! rather than round-tripped.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::distance::Metric;
use crate::{IndexError, Result};

/// Current on-stream format version, shared by all engines.
pub(crate) const FORMAT_VERSION: u32 = 1;

pub(crate) fn write_header(writer: &mut dyn Write, magic: &[u8; 4]) -> Result<()> {
    writer.write_all(magic)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
    Ok(())
}

pub(crate) fn read_header(reader: &mut dyn Read, magic: &[u8; 4]) -> Result<()> {
    let mut got = [0u8; 4];
    reader.read_exact(&mut got)?;
    if got != *magic {
        return Err(IndexError::Serialization(format!(
            "bad magic {:?}, expected {:?}",
            got, magic
        )));
    }
    let mut version = [0u8; 4];
    reader.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(IndexError::Serialization(format!(
            "unsupported format version {version}"
        )));
    }
    Ok(())
}

pub(crate) fn encode<T: Serialize>(writer: &mut dyn Write, value: &T) -> Result<()> {
    bincode::serialize_into(writer, value).map_err(|e| IndexError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(reader: &mut dyn Read) -> Result<T> {
    bincode::deserialize_from(reader).map_err(|e| IndexError::Serialization(e.to_string()))
}

pub(crate) fn metric_from_name(name: &str) -> Result<Metric> {
    Metric::from_name(name)
        .ok_or_else(|| IndexError::Serialization(format!("unknown distance metric {name:?}")))
}
