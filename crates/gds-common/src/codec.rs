//! Wire buffer
//!
//! A growable byte buffer with typed pack/unpack. Values are encoded with
//! bincode one after another; the reader keeps a cursor and reports
//! [`Error::EndOfBuffer`] once everything has been consumed, which callers
//! use as the natural loop terminator.
//!
//! ```text
//! +---------+---------+---------+-----
//! | value 0 | value 1 | value 2 | ...      (bincode, no framing)
//! +---------+---------+---------+-----
//!           ^ read_pos
//! ```

use crate::error::{Error, Result};
use crate::types::{KeyValue, Value};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Opaque growable buffer exchanged between processes
#[derive(Clone, Debug, Default)]
pub struct WireBuffer {
    data: BytesMut,
    read_pos: usize,
}

impl WireBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap received bytes for unpacking
    #[must_use]
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self {
            data: BytesMut::from(bytes.as_ref()),
            read_pos: 0,
        }
    }

    /// Total packed length
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes not yet unpacked
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Append one value
    pub fn pack<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        bincode::serialize_into((&mut self.data).writer(), value)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Read the next value
    pub fn unpack<T: DeserializeOwned>(&mut self) -> Result<T> {
        if self.remaining() == 0 {
            return Err(Error::EndOfBuffer);
        }
        let mut cursor: &[u8] = &self.data[self.read_pos..];
        let before = cursor.len();
        let value = bincode::deserialize_from(&mut cursor)?;
        self.read_pos += before - cursor.len();
        Ok(value)
    }

    /// Append the unread contents of another buffer
    pub fn append(&mut self, other: &Self) {
        self.data.extend_from_slice(other.unread());
    }

    /// Borrow the unread bytes
    #[must_use]
    pub fn unread(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    /// Detach the unread bytes as an immutable payload
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.unread())
    }

    /// Rewind the read cursor to the start
    pub const fn rewind(&mut self) {
        self.read_pos = 0;
    }
}

/// How modex keys are encoded on the wire
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModexKeyFormat {
    /// Keys travel as strings
    #[default]
    Strings,
    /// Keys travel as indices into a key map sent alongside the data
    Compact,
}

/// Pack one modex key/value in the requested key format
///
/// With [`ModexKeyFormat::Compact`] the key is appended to `kmap` on
/// first use.
pub fn pack_modex_kval(
    buf: &mut WireBuffer,
    fmt: ModexKeyFormat,
    kmap: &mut Vec<String>,
    kv: &KeyValue,
) -> Result<()> {
    match fmt {
        ModexKeyFormat::Strings => buf.pack(kv),
        ModexKeyFormat::Compact => {
            let idx = if let Some(pos) = kmap.iter().position(|k| *k == kv.key) {
                pos
            } else {
                kmap.push(kv.key.clone());
                kmap.len() - 1
            };
            let idx = u32::try_from(idx).map_err(|_| Error::bad_param("key map overflow"))?;
            buf.pack(&idx)?;
            buf.pack(&kv.value)
        }
    }
}

/// Unpack one modex key/value in the given key format
pub fn unpack_modex_kval(
    buf: &mut WireBuffer,
    fmt: ModexKeyFormat,
    kmap: &[String],
) -> Result<KeyValue> {
    match fmt {
        ModexKeyFormat::Strings => buf.unpack(),
        ModexKeyFormat::Compact => {
            let idx: u32 = buf.unpack()?;
            let key = kmap
                .get(idx as usize)
                .ok_or_else(|| Error::bad_param(format!("key index {idx} outside key map")))?
                .clone();
            let value: Value = buf.unpack()?;
            Ok(KeyValue { key, value })
        }
    }
}
