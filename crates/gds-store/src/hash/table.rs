//! Rank-indexed hash table
//!
//! Each table maps a rank to the key/value pairs stored for it. Keys are
//! held as dictionary ids. Strings above the compression threshold are
//! kept compressed and expanded again on the way out.

use gds_common::compress::{compress_string, decompress_string};
use gds_common::dictionary::{KeyDictionary, KeyId};
use gds_common::keys;
use gds_common::{DataType, Error, KeyValue, Rank, Result, Value};
use std::collections::BTreeMap;
use tracing::trace;

/// Physical representation of a stored value
#[derive(Clone, Debug, PartialEq)]
pub enum StoredValue {
    Plain(Value),
    Compressed(Vec<u8>),
}

impl StoredValue {
    /// Encode a value, compressing long strings
    pub fn encode(value: &Value, threshold: usize) -> Result<Self> {
        if let Value::String(s) = value
            && let Some(packed) = compress_string(s, threshold)?
        {
            return Ok(Self::Compressed(packed));
        }
        Ok(Self::Plain(value.clone()))
    }

    /// Recover the caller-visible value
    pub fn decode(&self) -> Result<Value> {
        match self {
            Self::Plain(v) => Ok(v.clone()),
            Self::Compressed(data) => Ok(Value::String(decompress_string(data)?)),
        }
    }

    /// Type tag of the stored representation
    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Plain(v) => v.data_type(),
            Self::Compressed(_) => DataType::CompressedString,
        }
    }

    fn same_as(&self, value: &Value) -> bool {
        match self {
            Self::Plain(v) => v == value,
            Self::Compressed(_) => self.decode().is_ok_and(|v| v == *value),
        }
    }
}

#[derive(Debug)]
struct Entry {
    kid: KeyId,
    value: StoredValue,
}

#[derive(Debug, Default)]
struct ProcData {
    entries: Vec<Entry>,
}

impl ProcData {
    fn find(&self, kid: KeyId) -> Option<&Entry> {
        self.entries.iter().find(|e| e.kid == kid)
    }

    fn push_all(&self, dict: &KeyDictionary, skip_reserved: bool, out: &mut Vec<KeyValue>) -> Result<()> {
        for entry in &self.entries {
            let Some(name) = dict.name(entry.kid) else {
                return Err(Error::not_found(format!("key id {}", entry.kid)));
            };
            if skip_reserved && keys::is_reserved(&name) {
                continue;
            }
            out.push(KeyValue {
                key: name,
                value: entry.value.decode()?,
            });
        }
        Ok(())
    }
}

/// Key/value pairs indexed by rank
#[derive(Debug)]
pub struct HashTable {
    label: &'static str,
    procs: BTreeMap<Rank, ProcData>,
}

impl HashTable {
    #[must_use]
    pub const fn new(label: &'static str) -> Self {
        Self {
            label,
            procs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        self.label
    }

    /// Store a value for a rank, replacing any previous value of that key
    ///
    /// Re-storing an equal value is a no-op.
    pub fn store(
        &mut self,
        dict: &KeyDictionary,
        rank: Rank,
        kv: &KeyValue,
        threshold: usize,
    ) -> Result<()> {
        let kid = dict.register(&kv.key);
        let proc_data = self.procs.entry(rank).or_default();
        if let Some(entry) = proc_data.entries.iter_mut().find(|e| e.kid == kid) {
            if entry.value.same_as(&kv.value) {
                trace!("{}: equal value for {} rank {}, ignoring", self.label, kv.key, rank);
                return Ok(());
            }
            entry.value = StoredValue::encode(&kv.value, threshold)?;
            trace!("{}: updated {} for rank {}", self.label, kv.key, rank);
            return Ok(());
        }
        proc_data.entries.push(Entry {
            kid,
            value: StoredValue::encode(&kv.value, threshold)?,
        });
        trace!("{}: added {} for rank {}", self.label, kv.key, rank);
        Ok(())
    }

    /// Fetch one key (or every key when `key` is `None`) for a rank
    ///
    /// With [`Rank::UNDEF`] every process rank is searched: the first
    /// holder of `key` wins, and a null key collects the non-reserved data
    /// of all of them. Marker ranks such as WILDCARD are not scanned.
    pub fn fetch(
        &self,
        dict: &KeyDictionary,
        rank: Rank,
        key: Option<&str>,
        out: &mut Vec<KeyValue>,
    ) -> Result<()> {
        let kid = match key {
            Some(k) => Some(
                dict.lookup(k)
                    .ok_or_else(|| Error::not_found(format!("{k} in {}", self.label)))?,
            ),
            None => None,
        };

        if rank.is_undef() {
            let mut valid = self
                .procs
                .iter()
                .filter(|(r, _)| r.is_valid())
                .map(|(_, p)| p)
                .peekable();
            if valid.peek().is_none() {
                return Err(Error::not_found(format!("no ranks in {}", self.label)));
            }
            for proc_data in valid {
                match (kid, key) {
                    (Some(kid), Some(k)) => {
                        if let Some(entry) = proc_data.find(kid) {
                            out.push(KeyValue::new(k, entry.value.decode()?));
                            return Ok(());
                        }
                    }
                    _ => proc_data.push_all(dict, true, out)?,
                }
            }
            if key.is_some() {
                return Err(Error::not_found(format!("{} in {}", key.unwrap_or_default(), self.label)));
            }
            return Ok(());
        }

        let proc_data = self
            .procs
            .get(&rank)
            .ok_or_else(|| Error::not_found(format!("rank {rank} in {}", self.label)))?;
        match (kid, key) {
            (Some(kid), Some(k)) => {
                let entry = proc_data
                    .find(kid)
                    .ok_or_else(|| Error::not_found(format!("{k} for rank {rank} in {}", self.label)))?;
                out.push(KeyValue::new(k, entry.value.decode()?));
                Ok(())
            }
            _ => proc_data.push_all(dict, false, out),
        }
    }

    /// Remove a key (or all data when `key` is `None`) for a rank
    ///
    /// [`Rank::WILDCARD`] applies the removal to every rank.
    pub fn remove(&mut self, dict: &KeyDictionary, rank: Rank, key: Option<&str>) {
        let kid = key.and_then(|k| dict.lookup(k));
        if key.is_some() && kid.is_none() {
            return;
        }
        let strip = |proc_data: &mut ProcData| {
            if let Some(kid) = kid {
                proc_data.entries.retain(|e| e.kid != kid);
            }
        };
        if rank.is_wildcard() {
            if kid.is_none() {
                self.procs.clear();
            } else {
                self.procs.values_mut().for_each(strip);
            }
            return;
        }
        if kid.is_none() {
            self.procs.remove(&rank);
        } else if let Some(proc_data) = self.procs.get_mut(&rank) {
            strip(proc_data);
        }
    }

    /// Check whether a rank holds a key
    #[must_use]
    pub fn contains(&self, dict: &KeyDictionary, rank: Rank, key: &str) -> bool {
        let Some(kid) = dict.lookup(key) else {
            return false;
        };
        self.procs
            .get(&rank)
            .is_some_and(|p| p.find(kid).is_some())
    }

    /// Type tag of the stored representation of a key
    #[must_use]
    pub fn stored_type(&self, dict: &KeyDictionary, rank: Rank, key: &str) -> Option<DataType> {
        let kid = dict.lookup(key)?;
        self.procs
            .get(&rank)
            .and_then(|p| p.find(kid))
            .map(|e| e.value.data_type())
    }

    /// Ranks that currently hold data
    pub fn ranks(&self) -> impl Iterator<Item = Rank> + '_ {
        self.procs.keys().copied()
    }

    /// Number of ranks holding data
    #[must_use]
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}
