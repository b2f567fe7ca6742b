//! Job, session and modex segment layouts
//!
//! Each segment's root record points at the rest of its contents:
//!
//! ```text
//! job      JobRoot { nspace, nprocs, session, table -> hash2, nodes[], apps[] }
//! session  SessionRoot { id, info }
//! modex    ModexRoot { nspace, table -> hash2 }
//! ```
//!
//! Node, app and session records are kept as encoded info arrays; per-proc
//! and job-level key/values live in the job's hash2 table under their rank
//! (WILDCARD for the job itself).

use super::arena::{Arena, ArenaSafe, ShmBytes, ShmPtr, ShmSlice, ShmStr};
use super::hash2::{ENTRY_OVERHEAD, Hash2, Hash2Header};
use super::segment::{SegmentKind, backing_path, page_round};
use super::vmhole;
use crate::env::GdsEnv;
use crate::hash::tracker::{AppTracker, NodeInfo, Session, node_from_items};
use gds_common::keys;
use gds_common::{Error, Info, KeyValue, Nspace, Rank, Result, ShmemConfig, Value};
use tracing::{debug, error};

/// Smallest segment ever created
pub const MIN_SEGMENT: usize = 1 << 20;

const NO_SESSION: u32 = u32::MAX;
const MAX_BUCKETS: usize = 1024;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct JobRoot {
    nspace: ShmStr,
    nprocs: u32,
    session: u32,
    table: ShmPtr<Hash2Header>,
    nodes: ShmSlice<ShmBytes>,
    apps: ShmSlice<ShmBytes>,
}

unsafe impl ArenaSafe for JobRoot {}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SessionRoot {
    id: u32,
    _pad: u32,
    info: ShmBytes,
}

unsafe impl ArenaSafe for SessionRoot {}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ModexRoot {
    nspace: ShmStr,
    table: ShmPtr<Hash2Header>,
}

unsafe impl ArenaSafe for ModexRoot {}

/// Final segment size for a measured footprint
///
/// The estimate is scaled by the fluff factor and the operator multiplier,
/// page-rounded and never below [`MIN_SEGMENT`].
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn segment_size(estimate: usize, cfg: &ShmemConfig) -> usize {
    let scaled = (estimate as f64 * cfg.fluff_factor * cfg.segment_size_multiplier).ceil();
    page_round((scaled as usize).max(MIN_SEGMENT))
}

fn count_items(value: &Value) -> usize {
    match value {
        Value::InfoArray(items) => 1 + items.iter().map(|i| count_items(&i.value)).sum::<usize>(),
        _ => 1,
    }
}

/// Arena bytes needed to hold `kvs`
pub fn estimate_footprint(kvs: &[KeyValue]) -> Result<usize> {
    let packed = usize::try_from(bincode::serialized_size(kvs)?)
        .map_err(|_| Error::bad_param("job data too large"))?;
    let entries: usize = kvs.iter().map(|kv| count_items(&kv.value)).sum();
    Ok(packed + entries * ENTRY_OVERHEAD + MAX_BUCKETS * 8)
}

/// Create a segment for `nsid` sized for `estimate` bytes
pub fn create_arena(env: &GdsEnv, nsid: &str, kind: SegmentKind, estimate: usize) -> Result<Arena> {
    let cfg = &env.config.shmem;
    let size = segment_size(estimate, cfg);
    let at = match cfg.vmhole_kind {
        gds_common::VmHoleKind::None => None,
        hole => vmhole::find_hole(hole, &vmhole::read_maps()?, size)?,
    };
    let path = backing_path(
        &cfg.resolved_tmpdir(),
        &cfg.file_prefix,
        &env.hostname,
        nsid,
        kind,
        std::process::id(),
    );
    let arena = Arena::create(&path, size, at, nsid, kind)?;
    arena.segment().chown(cfg.owner_uid, cfg.owner_gid)?;
    arena.segment().set_mode(cfg.mode)?;
    Ok(arena)
}

/// Job data sorted into the pieces of a job segment
#[derive(Debug, Default)]
pub struct JobParts {
    pub nprocs: u32,
    pub wildcard: Vec<KeyValue>,
    pub procs: Vec<(Rank, Vec<KeyValue>)>,
    pub nodes: Vec<Value>,
    pub apps: Vec<Value>,
    pub session: Option<(u32, Value)>,
}

impl JobParts {
    /// Sort a job snapshot
    ///
    /// PROC_DATA arrays must lead with a RANK item carrying a rank value,
    /// SESSION_INFO_ARRAYs with SESSION_ID. Job info arrays cannot be
    /// placed in a segment.
    pub fn split(snapshot: &[KeyValue]) -> Result<Self> {
        let mut parts = Self::default();
        for kv in snapshot {
            match kv.key.as_str() {
                keys::NODE_INFO_ARRAY => parts.nodes.push(kv.value.clone()),
                keys::APP_INFO_ARRAY => parts.apps.push(kv.value.clone()),
                keys::PROC_DATA => {
                    let items = kv.value.as_info_array()?;
                    let Some(first) = items.first() else {
                        return Err(Error::bad_param("empty proc data array"));
                    };
                    let rank = match &first.value {
                        Value::Rank(r) if first.check_key(keys::RANK) => *r,
                        other => {
                            error!("proc data must start with a rank, got {:?}", other.data_type());
                            return Err(Error::type_mismatch("proc data must start with a rank"));
                        }
                    };
                    let data = items[1..].iter().cloned().map(KeyValue::from).collect();
                    parts.procs.push((rank, data));
                }
                keys::SESSION_INFO_ARRAY => {
                    let items = kv.value.as_info_array()?;
                    let id = match items.first() {
                        Some(first) if first.check_key(keys::SESSION_ID) => first.value.as_u32()?,
                        _ => return Err(Error::bad_param("session array must start with its id")),
                    };
                    parts.session = Some((id, kv.value.clone()));
                }
                keys::JOB_INFO_ARRAY => {
                    return Err(Error::not_supported("job info arrays in shared memory"));
                }
                _ => {
                    if kv.check_key(keys::JOB_SIZE) {
                        parts.nprocs = kv.value.as_u32()?;
                    }
                    parts.wildcard.push(kv.clone());
                }
            }
        }
        Ok(parts)
    }
}

/// Write a job segment and publish it
pub fn build_job_segment(
    env: &GdsEnv,
    nspace: &Nspace,
    parts: &JobParts,
    snapshot: &[KeyValue],
) -> Result<Arena> {
    let mut arena = create_arena(env, nspace.as_str(), SegmentKind::Job, estimate_footprint(snapshot)?)?;
    let nbuckets = (parts.procs.len() + 1).min(MAX_BUCKETS);
    let table = Hash2::create(&mut arena, nbuckets)?;

    for kv in &parts.wildcard {
        table.store(&mut arena, &env.keys, Rank::WILDCARD, kv, &[])?;
    }
    for (rank, data) in &parts.procs {
        for kv in data {
            table.store(&mut arena, &env.keys, *rank, kv, &[])?;
        }
    }
    let mut nodes = Vec::with_capacity(parts.nodes.len());
    for v in &parts.nodes {
        nodes.push(arena.alloc_value(v)?);
    }
    let mut apps = Vec::with_capacity(parts.apps.len());
    for v in &parts.apps {
        apps.push(arena.alloc_value(v)?);
    }
    let root = JobRoot {
        nspace: arena.alloc_str(nspace.as_str())?,
        nprocs: parts.nprocs,
        session: parts.session.as_ref().map_or(NO_SESSION, |(id, _)| *id),
        table: table.header(),
        nodes: arena.alloc_slice(&nodes)?,
        apps: arena.alloc_slice(&apps)?,
    };
    let root = arena.alloc(root)?;
    arena.set_root(root)?;
    arena.mark_ready()?;
    debug!(
        "published job segment for {} ({} procs, {} nodes, {} apps)",
        nspace,
        parts.procs.len(),
        parts.nodes.len(),
        parts.apps.len()
    );
    Ok(arena)
}

/// Write a session segment and publish it
pub fn build_session_segment(env: &GdsEnv, id: u32, info: &Value) -> Result<Arena> {
    let estimate = usize::try_from(bincode::serialized_size(info)?)
        .map_err(|_| Error::bad_param("session data too large"))?;
    let mut arena = create_arena(env, &id.to_string(), SegmentKind::Session, estimate)?;
    let info = arena.alloc_value(info)?;
    let root = arena.alloc(SessionRoot { id, _pad: 0, info })?;
    arena.set_root(root)?;
    arena.mark_ready()?;
    debug!("published session segment {}", id);
    Ok(arena)
}

/// One modex item bound for a modex table
#[derive(Debug)]
pub struct ModexItem {
    pub rank: Rank,
    pub kv: KeyValue,
    pub quals: Vec<Info>,
}

/// Write one modex round into a fresh segment and publish it
///
/// Each round gets its own segment, named by `round`, so a segment
/// clients may have attached is never written again. On failure the
/// half-built segment is dropped along with its backing file.
pub fn build_modex_segment(
    env: &GdsEnv,
    nspace: &Nspace,
    round: usize,
    items: &[ModexItem],
    estimate: usize,
) -> Result<Arena> {
    let nsid = format!("{nspace}.{round}");
    let mut arena = create_arena(env, &nsid, SegmentKind::Modex, estimate)?;
    let table = Hash2::create(&mut arena, 64)?;
    for item in items {
        table.store(&mut arena, &env.keys, item.rank, &item.kv, &item.quals)?;
    }
    let root = ModexRoot {
        nspace: arena.alloc_str(nspace.as_str())?,
        table: table.header(),
    };
    let root = arena.alloc(root)?;
    arena.set_root(root)?;
    arena.mark_ready()?;
    debug!("published modex round {} of {} ({} items)", round, nspace, items.len());
    Ok(arena)
}

fn root<T: ArenaSafe>(arena: &Arena) -> Result<&T> {
    let ptr: ShmPtr<T> = arena.root();
    if ptr.is_null() {
        return Err(Error::segment("segment has no root"));
    }
    arena.get(ptr)
}

/// Read side of a job segment
pub struct JobView<'a> {
    arena: &'a Arena,
    root: JobRoot,
}

impl<'a> JobView<'a> {
    pub fn new(arena: &'a Arena) -> Result<Self> {
        Ok(Self {
            arena,
            root: *root::<JobRoot>(arena)?,
        })
    }

    pub fn nspace(&self) -> Result<&'a str> {
        self.arena.str(self.root.nspace)
    }

    #[must_use]
    pub const fn nprocs(&self) -> u32 {
        self.root.nprocs
    }

    #[must_use]
    pub const fn session(&self) -> Option<u32> {
        if self.root.session == NO_SESSION {
            None
        } else {
            Some(self.root.session)
        }
    }

    #[must_use]
    pub const fn table(&self) -> Hash2 {
        Hash2::at(self.root.table)
    }

    pub fn nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut nodes = Vec::new();
        for bytes in self.arena.slice(self.root.nodes)? {
            nodes.push(node_from_items(self.arena.value(*bytes)?.as_info_array()?)?);
        }
        Ok(nodes)
    }

    pub fn apps(&self) -> Result<Vec<AppTracker>> {
        let mut apps = Vec::new();
        for bytes in self.arena.slice(self.root.apps)? {
            apps.push(app_from_items(self.arena.value(*bytes)?.as_info_array()?)?);
        }
        Ok(apps)
    }
}

/// Decode a session segment
pub fn read_session(arena: &Arena) -> Result<Session> {
    let root = root::<SessionRoot>(arena)?;
    let value = arena.value(root.info)?;
    let mut session = Session::default();
    session.id = root.id;
    for item in value.as_info_array()? {
        match item.key.as_str() {
            keys::SESSION_ID => {}
            keys::NODE_INFO_ARRAY => session.nodes.push(node_from_items(item.value.as_info_array()?)?),
            _ => session.info.push(KeyValue::from(item.clone())),
        }
    }
    Ok(session)
}

/// Id stored in a session segment
pub fn session_id(arena: &Arena) -> Result<u32> {
    Ok(root::<SessionRoot>(arena)?.id)
}

/// Table of a modex segment
pub fn modex_table(arena: &Arena) -> Result<Hash2> {
    Ok(Hash2::at(root::<ModexRoot>(arena)?.table))
}

fn app_from_items(items: &[Info]) -> Result<AppTracker> {
    let mut app = AppTracker::default();
    for item in items {
        match item.key.as_str() {
            keys::APPNUM => app.appnum = item.value.as_u32()?,
            keys::NODE_INFO_ARRAY => app.nodes.push(node_from_items(item.value.as_info_array()?)?),
            _ => app.info.push(KeyValue::from(item.clone())),
        }
    }
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::super::tests::shm_env;
    use super::*;

    fn proc_data(rank: u32, items: Vec<Info>) -> KeyValue {
        let mut arr = vec![Info::new(keys::RANK, Rank::new(rank))];
        arr.extend(items);
        KeyValue::new(keys::PROC_DATA, arr)
    }

    #[test]
    fn test_segment_size() {
        let cfg = ShmemConfig::default();
        assert_eq!(segment_size(10, &cfg), page_round(MIN_SEGMENT));
        let big = 3 * MIN_SEGMENT;
        assert_eq!(segment_size(big, &cfg), page_round(6 * MIN_SEGMENT));
        let cfg = ShmemConfig {
            segment_size_multiplier: 2.0,
            ..ShmemConfig::default()
        };
        assert_eq!(segment_size(big, &cfg), page_round(12 * MIN_SEGMENT));
    }

    #[test]
    fn test_split_rejects_bad_shapes() {
        let bad = KeyValue::new(keys::PROC_DATA, vec![Info::new(keys::HOSTNAME, "n0")]);
        assert!(matches!(JobParts::split(&[bad]), Err(Error::TypeMismatch(_))));

        let bad = KeyValue::new(keys::SESSION_INFO_ARRAY, vec![Info::new("user.x", "y")]);
        assert!(matches!(JobParts::split(&[bad]), Err(Error::BadParam(_))));

        let arr = KeyValue::new(keys::JOB_INFO_ARRAY, Vec::<Info>::new());
        assert!(JobParts::split(&[arr]).unwrap_err().is_not_supported());
    }

    #[test]
    fn test_job_segment_contents() {
        let dir = tempfile::tempdir().unwrap();
        let env = shm_env(dir.path());
        let snapshot = vec![
            KeyValue::new(keys::JOB_SIZE, 2u32),
            KeyValue::new(
                keys::NODE_INFO_ARRAY,
                vec![Info::new(keys::HOSTNAME, "n0"), Info::new(keys::NODEID, 0u32), Info::new(keys::LOCAL_SIZE, 2u32)],
            ),
            KeyValue::new(
                keys::APP_INFO_ARRAY,
                vec![Info::new(keys::APPNUM, 0u32), Info::new(keys::APP_SIZE, 2u32)],
            ),
            KeyValue::new(
                keys::SESSION_INFO_ARRAY,
                vec![Info::new(keys::SESSION_ID, 7u32), Info::new("user.alloc", "a1")],
            ),
            proc_data(0, vec![Info::new(keys::LOCAL_RANK, 0u32)]),
            proc_data(1, vec![Info::new(keys::LOCAL_RANK, 1u32)]),
        ];
        let parts = JobParts::split(&snapshot).unwrap();
        assert_eq!(parts.nprocs, 2);
        let arena = build_job_segment(&env, &Nspace::from("ns1"), &parts, &snapshot).unwrap();
        assert!(arena.is_ready());

        let view = JobView::new(&arena).unwrap();
        assert_eq!(view.nspace().unwrap(), "ns1");
        assert_eq!(view.nprocs(), 2);
        assert_eq!(view.session(), Some(7));
        assert_eq!(view.nodes().unwrap()[0].hostname.as_deref(), Some("n0"));
        assert_eq!(view.apps().unwrap()[0].appnum, 0);

        let mut out = Vec::new();
        view.table()
            .fetch(&arena, &env.keys, Rank::new(1), Some(keys::LOCAL_RANK), &[], &mut out)
            .unwrap();
        assert_eq!(out[0].value, Value::Uint32(1));

        let (id, info) = parts.session.unwrap();
        let sarena = build_session_segment(&env, id, &info).unwrap();
        let session = read_session(&sarena).unwrap();
        assert_eq!(session.id, 7);
        assert_eq!(session.info, vec![KeyValue::new("user.alloc", "a1")]);
    }

    #[test]
    fn test_modex_segment_filled_before_ready() {
        let dir = tempfile::tempdir().unwrap();
        let env = shm_env(dir.path());
        let items = vec![
            ModexItem { rank: Rank::new(0), kv: KeyValue::new("user.k", "v0"), quals: Vec::new() },
            ModexItem { rank: Rank::new(1), kv: KeyValue::new("user.k", "v1"), quals: Vec::new() },
        ];
        let mut arena = build_modex_segment(&env, &Nspace::from("ns1"), 0, &items, 4096).unwrap();
        assert!(arena.is_ready());

        let table = modex_table(&arena).unwrap();
        let mut out = Vec::new();
        table.fetch(&arena, &env.keys, Rank::new(1), Some("user.k"), &[], &mut out).unwrap();
        assert_eq!(out, vec![KeyValue::new("user.k", "v1")]);

        // a published round cannot grow
        let used = arena.stats().used;
        let late = KeyValue::new("user.late", "x");
        assert!(table.store(&mut arena, &env.keys, Rank::new(0), &late, &[]).is_err());
        assert_eq!(arena.stats().used, used);
    }

    #[test]
    fn test_modex_rounds_use_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let env = shm_env(dir.path());
        let ns = Nspace::from("ns1");
        let first = build_modex_segment(&env, &ns, 0, &[], 0).unwrap();
        let second = build_modex_segment(&env, &ns, 1, &[], 0).unwrap();
        assert_ne!(first.segment().path(), second.segment().path());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
