//! Key dictionary
//!
//! Maps attribute names to small integer ids. Reserved keys occupy the
//! front of the id space in a fixed order, so their ids agree across
//! processes; keys seen later are appended above [`INDEX_BOUNDARY`] in
//! first-use order and are only meaningful inside the registering process.

use crate::keys;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Integer id of a registered key
pub type KeyId = u32;

/// First id handed out to keys registered at runtime
pub const INDEX_BOUNDARY: KeyId = 1000;

#[derive(Debug, Default)]
struct Inner {
    by_name: HashMap<String, KeyId>,
    fixed: Vec<String>,
    dynamic: Vec<String>,
}

/// Name ↔ id registry shared by every table of one context
#[derive(Debug)]
pub struct KeyDictionary {
    inner: RwLock<Inner>,
}

impl KeyDictionary {
    /// Create a dictionary with every reserved key pre-registered
    #[must_use]
    pub fn new() -> Self {
        let mut inner = Inner::default();
        for (idx, name) in keys::RESERVED.iter().enumerate() {
            let id = KeyId::try_from(idx).unwrap_or(INDEX_BOUNDARY - 1);
            inner.by_name.insert((*name).to_string(), id);
            inner.fixed.push((*name).to_string());
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Look up a key without registering it
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<KeyId> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Look up a key, registering it on first use
    pub fn register(&self, name: &str) -> KeyId {
        if let Some(id) = self.lookup(name) {
            return id;
        }
        let mut inner = self.inner.write();
        // another caller may have registered it between the two locks
        if let Some(id) = inner.by_name.get(name) {
            return *id;
        }
        let offset = KeyId::try_from(inner.dynamic.len()).unwrap_or(KeyId::MAX - INDEX_BOUNDARY);
        let id = INDEX_BOUNDARY + offset;
        inner.by_name.insert(name.to_string(), id);
        inner.dynamic.push(name.to_string());
        tracing::trace!("registered user key {} as {}", name, id);
        id
    }

    /// Resolve an id back to its name
    #[must_use]
    pub fn name(&self, id: KeyId) -> Option<String> {
        let inner = self.inner.read();
        if id < INDEX_BOUNDARY {
            inner.fixed.get(id as usize).cloned()
        } else {
            inner.dynamic.get((id - INDEX_BOUNDARY) as usize).cloned()
        }
    }

    /// Whether an id means the same key in every process
    #[must_use]
    pub const fn is_fixed(id: KeyId) -> bool {
        id < INDEX_BOUNDARY
    }

    /// Number of registered keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyDictionary {
    fn default() -> Self {
        Self::new()
    }
}
