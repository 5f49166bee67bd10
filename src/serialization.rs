//! Binary write/read support for matrices, connections and temporal memories.
//!
//! Every persistent type derives serde's `Serialize`/`Deserialize` and opts into
//! `Serializable`, which encodes with bincode. Decoding is all-or-nothing:
//! - `read` / `from_bytes` build a fresh value and check it with `validate_state`.
//! - `restore` replaces `self` only after a successful decode, so a failed
//!   restore leaves the previous state untouched.

use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{Read, Write};
use tracing::warn;

/// Types that can be written to and read back from an opaque byte message.
pub trait Serializable: Serialize + DeserializeOwned + Sized {
    /// Checks internal consistency after decoding.
    fn validate_state(&self) -> Result<()> {
        Ok(())
    }

    /// Writes the full state to `writer`.
    fn write<W: Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    /// Reads a complete state from `reader`.
    fn read<R: Read>(reader: R) -> Result<Self> {
        let value: Self = bincode::deserialize_from(reader)?;
        value.validate_state()?;
        Ok(value)
    }

    /// Serializes to a byte vector.
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read(bytes)
    }

    /// Replaces `self` with the state encoded in `bytes`, or leaves it unchanged on failure.
    fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        match Self::from_bytes(bytes) {
            Ok(value) => {
                *self = value;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "rejected restore, keeping previous state");
                Err(e)
            }
        }
    }
}
