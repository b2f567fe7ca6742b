//! Qualified hash table inside an arena
//!
//! Procs hash into a fixed bucket array by rank; each proc bucket holds a
//! singly linked list of entries in insertion order. An entry may carry
//! qualifiers, and two entries for the same key coexist when their
//! qualifier sets differ.
//!
//! ```text
//! Hash2Header
//!   buckets[rank % n] --> ProcBucket(rank) --> ProcBucket(rank') --> null
//!                            |
//!                            head --> Entry --> Entry --> null
//!                                      key, quals[], value
//! ```

use super::arena::{Arena, ArenaSafe, ShmBytes, ShmPtr, ShmSlice, ShmStr};
use gds_common::dictionary::{KeyDictionary, KeyId};
use gds_common::keys;
use gds_common::{Error, Info, KeyValue, Rank, Result, Value};
use tracing::trace;

#[repr(C)]
#[derive(Clone, Copy)]
struct Qual {
    name: ShmStr,
    value: ShmBytes,
}

unsafe impl ArenaSafe for Qual {}

#[repr(C)]
#[derive(Clone, Copy)]
struct Entry {
    kid: u32,
    _pad: u32,
    key: ShmStr,
    quals: ShmSlice<Qual>,
    value: ShmBytes,
    next: ShmPtr<Entry>,
}

unsafe impl ArenaSafe for Entry {}

#[repr(C)]
#[derive(Clone, Copy)]
struct ProcBucket {
    rank: u32,
    _pad: u32,
    head: ShmPtr<Entry>,
    next: ShmPtr<ProcBucket>,
}

unsafe impl ArenaSafe for ProcBucket {}

/// Root record of a table
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Hash2Header {
    buckets: ShmSlice<ShmPtr<ProcBucket>>,
}

unsafe impl ArenaSafe for Hash2Header {}

/// Arena bytes taken by one entry beyond its key and encoded value
pub const ENTRY_OVERHEAD: usize = size_of::<Entry>() + size_of::<Qual>() + 4 * 8;

/// Handle to a table living in an arena
#[derive(Clone, Copy, Debug)]
pub struct Hash2 {
    hdr: ShmPtr<Hash2Header>,
}

impl Hash2 {
    /// Allocate an empty table with `nbuckets` rank buckets
    pub fn create(arena: &mut Arena, nbuckets: usize) -> Result<Self> {
        let buckets = arena.alloc_slice(&vec![ShmPtr::<ProcBucket>::NULL; nbuckets.max(1)])?;
        let hdr = arena.alloc(Hash2Header { buckets })?;
        Ok(Self { hdr })
    }

    /// Reopen a table from its header pointer
    #[must_use]
    pub const fn at(hdr: ShmPtr<Hash2Header>) -> Self {
        Self { hdr }
    }

    #[must_use]
    pub const fn header(self) -> ShmPtr<Hash2Header> {
        self.hdr
    }

    fn slot(self, arena: &Arena, rank: Rank) -> Result<ShmPtr<ShmPtr<ProcBucket>>> {
        let buckets = arena.get(self.hdr)?.buckets;
        let idx = rank.as_u32() as usize % buckets.len();
        buckets
            .at(idx)
            .ok_or_else(|| Error::internal("bucket index out of range"))
    }

    fn find_bucket(self, arena: &Arena, rank: Rank) -> Result<Option<ShmPtr<ProcBucket>>> {
        let mut cur = *arena.get(self.slot(arena, rank)?)?;
        while !cur.is_null() {
            let b = arena.get(cur)?;
            if b.rank == rank.as_u32() {
                return Ok(Some(cur));
            }
            cur = b.next;
        }
        Ok(None)
    }

    fn bucket_mut(self, arena: &mut Arena, rank: Rank) -> Result<ShmPtr<ProcBucket>> {
        if let Some(b) = self.find_bucket(arena, rank)? {
            return Ok(b);
        }
        let slot = self.slot(arena, rank)?;
        let next = *arena.get(slot)?;
        let b = arena.alloc(ProcBucket {
            rank: rank.as_u32(),
            _pad: 0,
            head: ShmPtr::NULL,
            next,
        })?;
        arena.write(slot, b)?;
        Ok(b)
    }

    fn buckets(self, arena: &Arena) -> Result<Vec<ProcBucket>> {
        let mut all = Vec::new();
        for slot in arena.slice(arena.get(self.hdr)?.buckets)? {
            let mut cur = *slot;
            while !cur.is_null() {
                let b = *arena.get(cur)?;
                all.push(b);
                cur = b.next;
            }
        }
        all.sort_by_key(|b| b.rank);
        Ok(all)
    }

    fn chain(arena: &Arena, head: ShmPtr<Entry>) -> Result<Vec<(ShmPtr<Entry>, Entry)>> {
        let mut items = Vec::new();
        let mut cur = head;
        while !cur.is_null() {
            let e = *arena.get(cur)?;
            items.push((cur, e));
            cur = e.next;
        }
        Ok(items)
    }

    /// Ranks with at least one bucket, in ascending order
    pub fn ranks(self, arena: &Arena) -> Result<Vec<Rank>> {
        Ok(self
            .buckets(arena)?
            .into_iter()
            .map(|b| Rank::new(b.rank))
            .collect())
    }

    /// Store `kv` for `rank` under the given qualifiers
    ///
    /// An entry with the same key and qualifier set is replaced; an equal
    /// value is left alone.
    pub fn store(
        self,
        arena: &mut Arena,
        dict: &KeyDictionary,
        rank: Rank,
        kv: &KeyValue,
        quals: &[Info],
    ) -> Result<()> {
        let kid = dict.register(&kv.key);
        let bucket = self.bucket_mut(arena, rank)?;
        let wanted: Vec<&Info> = quals.iter().collect();
        let head = arena.get(bucket)?.head;

        let mut last = None;
        for (ptr, e) in Self::chain(arena, head)? {
            if key_matches(arena, &e, kid, &kv.key)? && quals_match(arena, &e, &wanted)? {
                if arena.value(e.value)? == kv.value {
                    trace!("hash2 {} {} unchanged", rank, kv.key);
                    return Ok(());
                }
                let value = arena.alloc_value(&kv.value)?;
                return arena.write(ptr, Entry { value, ..e });
            }
            last = Some((ptr, e));
        }

        let mut qv = Vec::with_capacity(quals.len());
        for q in quals {
            qv.push(Qual {
                name: arena.alloc_str(&q.key)?,
                value: arena.alloc_value(&q.value)?,
            });
        }
        let entry = Entry {
            kid,
            _pad: 0,
            key: arena.alloc_str(&kv.key)?,
            quals: arena.alloc_slice(&qv)?,
            value: arena.alloc_value(&kv.value)?,
            next: ShmPtr::NULL,
        };
        let ptr = arena.alloc(entry)?;
        match last {
            Some((prev, e)) => arena.write(prev, Entry { next: ptr, ..e }),
            None => {
                let b = *arena.get(bucket)?;
                arena.write(bucket, ProcBucket { head: ptr, ..b })
            }
        }
    }

    /// Fetch `key` (everything when `None`) for `rank`
    ///
    /// UNDEF scans every process rank and returns the first hit for a key.
    /// Only the qualifier-flagged items of `qualifiers` take part in
    /// matching, and an unqualified lookup never returns a qualified entry.
    /// Without a key, qualified entries come back as `QUALIFIED_VALUE`
    /// arrays holding the primary pair followed by its qualifiers.
    pub fn fetch(
        self,
        arena: &Arena,
        dict: &KeyDictionary,
        rank: Rank,
        key: Option<&str>,
        qualifiers: &[Info],
        out: &mut Vec<KeyValue>,
    ) -> Result<()> {
        let buckets: Vec<ProcBucket> = if rank.is_undef() {
            self.buckets(arena)?
                .into_iter()
                .filter(|b| Rank::new(b.rank).is_valid())
                .collect()
        } else {
            match self.find_bucket(arena, rank)? {
                Some(b) => vec![*arena.get(b)?],
                None => Vec::new(),
            }
        };
        let wanted: Vec<&Info> = qualifiers.iter().filter(|q| q.is_qualifier()).collect();
        let kid = key.and_then(|k| dict.lookup(k));
        let before = out.len();

        for b in buckets {
            for (_, e) in Self::chain(arena, b.head)? {
                match key {
                    Some(k) => {
                        if key_matches_opt(arena, &e, kid, k)? && quals_match(arena, &e, &wanted)? {
                            out.push(KeyValue::new(k, arena.value(e.value)?));
                            return Ok(());
                        }
                    }
                    None => out.push(entry_to_kv(arena, &e)?),
                }
            }
        }
        if out.len() == before {
            return Err(Error::not_found(format!(
                "{} for rank {rank}",
                key.unwrap_or("data")
            )));
        }
        Ok(())
    }

    /// Unlink `key` (every key when `None`) from `rank`; WILDCARD clears
    /// all ranks. Returns the number of entries dropped.
    pub fn remove(self, arena: &mut Arena, rank: Rank, key: Option<&str>) -> Result<usize> {
        let targets: Vec<ShmPtr<ProcBucket>> = if rank.is_wildcard() {
            let mut all = Vec::new();
            for slot in arena.slice(arena.get(self.hdr)?.buckets)?.to_vec() {
                let mut cur = slot;
                while !cur.is_null() {
                    all.push(cur);
                    cur = arena.get(cur)?.next;
                }
            }
            all
        } else {
            self.find_bucket(arena, rank)?.into_iter().collect()
        };

        let mut dropped = 0;
        for bp in targets {
            let b = *arena.get(bp)?;
            let mut keep = Vec::new();
            for (ptr, e) in Self::chain(arena, b.head)? {
                let hit = match key {
                    Some(k) => arena.str(e.key)? == k,
                    None => true,
                };
                if hit {
                    dropped += 1;
                } else {
                    keep.push((ptr, e));
                }
            }
            // relink the survivors in order
            let mut next = ShmPtr::NULL;
            for (ptr, e) in keep.into_iter().rev() {
                arena.write(ptr, Entry { next, ..e })?;
                next = ptr;
            }
            arena.write(bp, ProcBucket { head: next, ..b })?;
        }
        Ok(dropped)
    }
}

fn key_matches(arena: &Arena, e: &Entry, kid: KeyId, key: &str) -> Result<bool> {
    key_matches_opt(arena, e, Some(kid), key)
}

fn key_matches_opt(arena: &Arena, e: &Entry, kid: Option<KeyId>, key: &str) -> Result<bool> {
    if let Some(kid) = kid
        && KeyDictionary::is_fixed(kid)
        && KeyDictionary::is_fixed(e.kid)
    {
        return Ok(kid == e.kid);
    }
    Ok(arena.str(e.key)? == key)
}

fn quals_match(arena: &Arena, e: &Entry, wanted: &[&Info]) -> Result<bool> {
    let have = arena.slice(e.quals)?;
    if have.len() != wanted.len() {
        return Ok(false);
    }
    for w in wanted {
        let mut found = false;
        for q in have {
            if arena.str(q.name)? == w.key && arena.value(q.value)? == w.value {
                found = true;
                break;
            }
        }
        if !found {
            return Ok(false);
        }
    }
    Ok(true)
}

fn entry_to_kv(arena: &Arena, e: &Entry) -> Result<KeyValue> {
    let key = arena.str(e.key)?;
    let value = arena.value(e.value)?;
    let quals = arena.slice(e.quals)?;
    if quals.is_empty() {
        return Ok(KeyValue::new(key, value));
    }
    let mut items = vec![Info::new(key, value)];
    for q in quals {
        items.push(Info::qualifier(arena.str(q.name)?, arena.value(q.value)?));
    }
    Ok(KeyValue::new(keys::QUALIFIED_VALUE, Value::InfoArray(items)))
}
