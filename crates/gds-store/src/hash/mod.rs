//! Hash backend
//!
//! Every namespace gets a [`JobTracker`] with three rank-indexed tables:
//!
//! ```text
//!  internal   job-level data, map facts, copies of our own puts
//!  local      data published for processes on this node
//!  remote     data published for processes on other nodes
//! ```
//!
//! GLOBAL puts land in both local and remote. Node, app and session
//! records hang off the tracker next to the tables.

mod arrays;
pub(crate) mod fetch;
mod jobinfo;
pub mod map;
pub mod table;
pub mod tracker;

pub use map::{MapParser, NativeMapParser};
pub use tracker::{JobTracker, NodeInfo, Sessions};

use crate::env::GdsEnv;
use crate::module::{GdsModule, ModexCtx, ModuleCapabilities, PeerInfo, directive_priority};
use arrays::{process_app_array, process_node_array, process_session_array, store_proc_data};
use gds_common::keys;
use gds_common::{
    Error, Info, KeyValue, Nspace, ProcId, Rank, Result, Scope, Value, WireBuffer,
};
use std::collections::{BTreeMap, HashMap};
use table::HashTable;
use tracing::{debug, error, info};

/// Per-process hash table backend
pub struct HashStore {
    jobs: HashMap<Nspace, JobTracker>,
    sessions: Sessions,
    map_parser: Box<dyn MapParser>,
}

impl HashStore {
    pub const NAME: &'static str = "hash";
    pub const DEFAULT_PRIORITY: u32 = 10;

    #[must_use]
    pub fn new() -> Self {
        Self::with_map_parser(Box::new(NativeMapParser))
    }

    /// Use a different decoder for node and proc maps
    #[must_use]
    pub fn with_map_parser(map_parser: Box<dyn MapParser>) -> Self {
        Self {
            jobs: HashMap::new(),
            sessions: Sessions::default(),
            map_parser,
        }
    }

    /// Look up the tracker of a namespace
    #[must_use]
    pub fn job(&self, nspace: &Nspace) -> Option<&JobTracker> {
        self.jobs.get(nspace)
    }

    #[must_use]
    pub const fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    /// Remove a key (or all data when `key` is `None`) for a proc from
    /// every table of its namespace
    pub fn remove(&mut self, env: &GdsEnv, proc: &ProcId, key: Option<&str>) -> Result<()> {
        let trk = self
            .jobs
            .get_mut(&proc.nspace)
            .ok_or_else(|| Error::InvalidNamespace(proc.nspace.to_string()))?;
        for table in [&mut trk.internal, &mut trk.local, &mut trk.remote] {
            table.remove(&env.keys, proc.rank, key);
        }
        Ok(())
    }
}

impl Default for HashStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracker of a namespace, created on first reference
fn tracker<'a>(jobs: &'a mut HashMap<Nspace, JobTracker>, nspace: &Nspace) -> &'a mut JobTracker {
    jobs.entry(nspace.clone()).or_insert_with(|| {
        debug!("creating job tracker for {}", nspace);
        JobTracker::new(nspace.clone())
    })
}

/// Learn the process count from a JOB_SIZE value
fn update_nprocs(trk: &mut JobTracker, value: &Value) -> Result<()> {
    let n = value.as_u32()?;
    if trk.nprocs == 0 {
        trk.nprocs = n;
    } else if trk.nprocs != n {
        error!(
            "job {} size {} conflicts with known size {}",
            trk.nspace, n, trk.nprocs
        );
        return Err(Error::bad_param(format!(
            "job size {n} conflicts with {}",
            trk.nprocs
        )));
    }
    Ok(())
}

/// Store into one table, unpacking PROC_DATA arrays
fn store_into(env: &GdsEnv, table: &mut HashTable, rank: Rank, kv: &KeyValue) -> Result<()> {
    if kv.check_key(keys::PROC_DATA) {
        store_proc_data(&env.keys, table, &kv.value, env.threshold()).map(|_| ())
    } else {
        table.store(&env.keys, rank, kv, env.threshold())
    }
}

impl GdsModule for HashStore {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities {
            zero_copy: false,
            caches_job_info: true,
            direct_store: true,
        }
    }

    fn init(&mut self, env: &GdsEnv) -> Result<()> {
        debug!("hash module initialized for {}", env.myid);
        Ok(())
    }

    fn finalize(&mut self, _env: &GdsEnv) {
        info!(
            "hash module finalizing with {} jobs and {} sessions",
            self.jobs.len(),
            self.sessions.len()
        );
        self.jobs.clear();
        self.sessions = Sessions::default();
    }

    fn assign_module(&self, _env: &GdsEnv, directives: &[Info]) -> Option<u32> {
        directive_priority(directives, Self::NAME, Self::DEFAULT_PRIORITY)
    }

    fn cache_job_info(&mut self, env: &GdsEnv, nspace: &Nspace, info: &[Info]) -> Result<()> {
        self.cache_job(env, nspace, info)
    }

    fn store(&mut self, env: &GdsEnv, proc: &ProcId, scope: Scope, kv: &KeyValue) -> Result<()> {
        debug!("hash store {} scope {} key {}", proc, scope, kv.key);
        let trk = tracker(&mut self.jobs, &proc.nspace);

        match kv.key.as_str() {
            keys::NODE_INFO_ARRAY => return process_node_array(&kv.value, &mut trk.nodes),
            keys::APP_INFO_ARRAY => return process_app_array(&kv.value, trk),
            keys::SESSION_INFO_ARRAY => {
                return process_session_array(&kv.value, trk, &mut self.sessions);
            }
            keys::JOB_INFO_ARRAY => {
                return Err(Error::not_supported("job info arrays in direct stores"));
            }
            keys::JOB_SIZE => update_nprocs(trk, &kv.value)?,
            _ => {}
        }

        // our own puts are always visible to ourselves
        if env.is_me(proc) && scope != Scope::Internal {
            store_into(env, &mut trk.internal, proc.rank, kv)?;
        }

        match scope {
            Scope::Internal => store_into(env, &mut trk.internal, proc.rank, kv),
            Scope::Local => store_into(env, &mut trk.local, proc.rank, kv),
            Scope::Remote => store_into(env, &mut trk.remote, proc.rank, kv),
            Scope::Global => {
                store_into(env, &mut trk.remote, proc.rank, kv)?;
                store_into(env, &mut trk.local, proc.rank, kv)
            }
            Scope::Undef => Err(Error::bad_param("store requires a scope")),
        }
    }

    fn fetch(
        &self,
        env: &GdsEnv,
        proc: &ProcId,
        scope: Scope,
        key: Option<&str>,
        qualifiers: &[Info],
        out: &mut Vec<KeyValue>,
    ) -> Result<()> {
        self.fetch_data(env, proc, scope, key, qualifiers, out)
    }

    fn store_job_info(
        &mut self,
        env: &GdsEnv,
        nspace: &Nspace,
        buf: &mut WireBuffer,
    ) -> Result<()> {
        self.unpack_job(env, nspace, buf)
    }

    fn register_job_info(
        &mut self,
        env: &GdsEnv,
        peer: &PeerInfo,
        out: &mut WireBuffer,
    ) -> Result<()> {
        self.pack_job(env, peer, out)
    }

    fn store_modex(
        &mut self,
        env: &GdsEnv,
        nspace: &Nspace,
        buf: &mut WireBuffer,
        ctx: &mut ModexCtx,
    ) -> Result<()> {
        self.ingest_modex(env, nspace, buf, ctx)
    }

    fn setup_fork(
        &mut self,
        _env: &GdsEnv,
        proc: &ProcId,
        child_env: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        debug!("hash setup_fork for {}", proc);
        child_env.insert(keys::GDS_MODULE_ENV.to_string(), Self::NAME.to_string());
        Ok(())
    }

    fn del_nspace(&mut self, _env: &GdsEnv, nspace: &Nspace) -> Result<()> {
        if let Some(trk) = self.jobs.remove(nspace) {
            if let Some(id) = trk.session {
                self.sessions.release(id);
            }
            debug!("hash deleted namespace {}", nspace);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Role;
    use gds_common::{DataType, GdsConfig};
    use rand::Rng;
    use rand::distributions::Alphanumeric;

    pub(super) fn server_env() -> GdsEnv {
        GdsEnv::with_hostname(
            GdsConfig::default(),
            ProcId::new("srv", Rank::new(0)),
            Role::Server,
            "n0",
        )
    }

    fn fetch_one(
        hs: &HashStore,
        env: &GdsEnv,
        proc: &ProcId,
        scope: Scope,
        key: &str,
    ) -> Result<Value> {
        let mut out = Vec::new();
        hs.fetch(env, proc, scope, Some(key), &[], &mut out)?;
        Ok(out.remove(0).value)
    }

    #[test]
    fn test_scoped_round_trip() {
        let env = server_env();
        let mut hs = HashStore::new();
        let p = ProcId::new("ns1", Rank::new(1));
        hs.store(&env, &p, Scope::Local, &KeyValue::new("user.l", 1u32)).unwrap();
        hs.store(&env, &p, Scope::Remote, &KeyValue::new("user.r", 2u32)).unwrap();
        hs.store(&env, &p, Scope::Internal, &KeyValue::new("user.i", 3u32)).unwrap();

        assert_eq!(fetch_one(&hs, &env, &p, Scope::Local, "user.l").unwrap(), Value::Uint32(1));
        assert_eq!(fetch_one(&hs, &env, &p, Scope::Remote, "user.r").unwrap(), Value::Uint32(2));
        assert_eq!(fetch_one(&hs, &env, &p, Scope::Internal, "user.i").unwrap(), Value::Uint32(3));
        // undefined scope cascades through every table
        assert_eq!(fetch_one(&hs, &env, &p, Scope::Undef, "user.r").unwrap(), Value::Uint32(2));
    }

    #[test]
    fn test_global_visible_locally_and_remotely() {
        let env = server_env();
        let mut hs = HashStore::new();
        let p = ProcId::new("ns1", Rank::new(0));
        hs.store(&env, &p, Scope::Global, &KeyValue::new("user.g", "v")).unwrap();
        for scope in [Scope::Local, Scope::Remote, Scope::Global] {
            assert_eq!(fetch_one(&hs, &env, &p, scope, "user.g").unwrap(), Value::from("v"));
        }
    }

    #[test]
    fn test_exists_outside_scope() {
        let env = server_env();
        let mut hs = HashStore::new();
        let p = ProcId::new("ns1", Rank::new(0));
        hs.store(&env, &p, Scope::Remote, &KeyValue::new("user.r", 1u32)).unwrap();
        let err = fetch_one(&hs, &env, &p, Scope::Local, "user.r").unwrap_err();
        assert!(matches!(err, Error::ExistsOutsideScope { .. }));
        let err = fetch_one(&hs, &env, &p, Scope::Local, "user.none").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_exists_outside_scope_without_key() {
        let env = server_env();
        let mut hs = HashStore::new();
        let p0 = ProcId::new("ns1", Rank::new(0));
        let p1 = ProcId::new("ns1", Rank::new(1));
        hs.store(&env, &p0, Scope::Local, &KeyValue::new("user.l", 1u32)).unwrap();
        hs.store(&env, &p1, Scope::Local, &KeyValue::new("user.l", 2u32)).unwrap();
        hs.store(&env, &p1, Scope::Remote, &KeyValue::new("user.r", 3u32)).unwrap();

        let mut out = Vec::new();
        let err = hs.fetch(&env, &p0, Scope::Remote, None, &[], &mut out).unwrap_err();
        assert!(matches!(err, Error::ExistsOutsideScope { .. }));
        assert!(out.is_empty());

        hs.fetch(&env, &p1, Scope::Remote, None, &[], &mut out).unwrap();
        assert_eq!(out, vec![KeyValue::new("user.r", 3u32)]);

        let p2 = ProcId::new("ns1", Rank::new(2));
        let err = hs.fetch(&env, &p2, Scope::Remote, None, &[], &mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_unknown_namespace() {
        let env = server_env();
        let hs = HashStore::new();
        let err = fetch_one(&hs, &env, &ProcId::new("nsX", Rank::new(0)), Scope::Global, "k")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidNamespace(_)));
    }

    #[test]
    fn test_own_puts_copied_to_internal() {
        let mut env = server_env();
        env.myid = ProcId::new("ns1", Rank::new(4));
        let me = env.myid.clone();
        let mut hs = HashStore::new();
        hs.store(&env, &me, Scope::Remote, &KeyValue::new("user.mine", 9u32)).unwrap();
        assert!(hs.job(&me.nspace).unwrap().internal.contains(&env.keys, me.rank, "user.mine"));
    }

    #[test]
    fn test_store_requires_scope() {
        let env = server_env();
        let mut hs = HashStore::new();
        let p = ProcId::new("ns1", Rank::new(0));
        let err = hs.store(&env, &p, Scope::Undef, &KeyValue::new("k", 1u32)).unwrap_err();
        assert!(matches!(err, Error::BadParam(_)));
        let err = hs
            .store(&env, &p, Scope::Internal, &KeyValue::new(keys::JOB_INFO_ARRAY, Vec::<Info>::new()))
            .unwrap_err();
        assert!(err.is_not_supported());
    }

    #[test]
    fn test_job_size_conflict() {
        let env = server_env();
        let mut hs = HashStore::new();
        let p = ProcId::new("ns1", Rank::WILDCARD);
        hs.store(&env, &p, Scope::Internal, &KeyValue::new(keys::JOB_SIZE, 2u32)).unwrap();
        hs.store(&env, &p, Scope::Internal, &KeyValue::new(keys::JOB_SIZE, 2u32)).unwrap();
        assert_eq!(hs.job(&p.nspace).unwrap().nprocs, 2);
        assert!(hs
            .store(&env, &p, Scope::Internal, &KeyValue::new(keys::JOB_SIZE, 3u32))
            .is_err());
        assert_eq!(hs.job(&p.nspace).unwrap().nprocs, 2);
    }

    #[test]
    fn test_compression_is_transparent() {
        let mut env = server_env();
        env.config.hash.compression_threshold = 256;
        let mut hs = HashStore::new();
        let p = ProcId::new("ns1", Rank::WILDCARD);
        let nodes: Vec<String> = (0..200).map(|i| format!("node{i:04}")).collect();
        let list = nodes.join(",");
        hs.store(&env, &p, Scope::Internal, &KeyValue::new(keys::NODE_LIST, list.as_str()))
            .unwrap();
        let trk = hs.job(&p.nspace).unwrap();
        assert_eq!(
            trk.internal.stored_type(&env.keys, Rank::WILDCARD, keys::NODE_LIST),
            Some(DataType::CompressedString)
        );
        let got = fetch_one(&hs, &env, &p, Scope::Internal, keys::NODE_LIST).unwrap();
        assert_eq!(got, Value::String(list));
        assert_eq!(got.data_type(), DataType::String);
    }

    #[test]
    fn test_random_values_round_trip() {
        let env = server_env();
        let mut hs = HashStore::new();
        let mut rng = rand::thread_rng();
        let mut expected = Vec::new();
        for i in 0..50u32 {
            let rank = Rank::new(rng.gen_range(0..8));
            let key = format!("user.key{i}");
            let val: String = (&mut rng).sample_iter(&Alphanumeric).take(24).map(char::from).collect();
            let p = ProcId::new("ns1", rank);
            hs.store(&env, &p, Scope::Global, &KeyValue::new(key.as_str(), val.as_str()))
                .unwrap();
            expected.push((p, key, val));
        }
        for (p, key, val) in expected {
            assert_eq!(fetch_one(&hs, &env, &p, Scope::Remote, &key).unwrap(), Value::String(val));
        }
    }

    #[test]
    fn test_remove_and_del_nspace() {
        let env = server_env();
        let mut hs = HashStore::new();
        let p = ProcId::new("ns1", Rank::new(0));
        hs.store(&env, &p, Scope::Global, &KeyValue::new("user.a", 1u32)).unwrap();
        hs.remove(&env, &p, Some("user.a")).unwrap();
        assert!(fetch_one(&hs, &env, &p, Scope::Global, "user.a").unwrap_err().is_not_found());

        let sess = KeyValue::new(keys::SESSION_INFO_ARRAY, vec![Info::new(keys::SESSION_ID, 1u32)]);
        hs.store(&env, &p, Scope::Internal, &sess).unwrap();
        assert_eq!(hs.sessions().refs(1), 1);
        hs.del_nspace(&env, &p.nspace).unwrap();
        assert!(hs.job(&p.nspace).is_none());
        assert!(hs.sessions().is_empty());
    }

    #[test]
    fn test_setup_fork_and_priority() {
        let env = server_env();
        let mut hs = HashStore::new();
        let mut child = BTreeMap::new();
        hs.setup_fork(&env, &env.myid.clone(), &mut child).unwrap();
        assert_eq!(child.get(keys::GDS_MODULE_ENV).map(String::as_str), Some("hash"));
        assert_eq!(hs.assign_module(&env, &[]), Some(HashStore::DEFAULT_PRIORITY));
    }
}
