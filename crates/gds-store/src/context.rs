//! Process context
//!
//! Owns the environment, every initialized module and the module chosen
//! for each connected peer. All entry points forward to the chosen module;
//! when it answers `NotSupported` the hash module takes over, so the hash
//! module is always initialized.
//!
//! ```text
//!  peer ──> assign (priority) ──> shmem ──NotSupported──> hash
//!                              └─> hash
//! ```

use crate::env::GdsEnv;
use crate::factory::{ModuleFactory, ModuleKind};
use crate::hash::HashStore;
use crate::module::{GdsModule, ModexCtx, PeerId, PeerInfo};
use crate::shmem::ShmemStore;
use gds_common::keys;
use gds_common::{Error, Info, KeyValue, Nspace, ProcId, Rank, Result, Scope, WireBuffer};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Directive list naming the configured default modules
fn default_directives(env: &GdsEnv) -> Vec<Info> {
    if !env.config.modules.is_empty() {
        return vec![Info::new(keys::GDS_MODULE, env.config.modules.join(","))];
    }
    // a forked child inherits the module its parent chose
    std::env::var(keys::GDS_MODULE_ENV)
        .ok()
        .filter(|m| !m.is_empty())
        .map(|m| vec![Info::new(keys::GDS_MODULE, m)])
        .unwrap_or_default()
}

/// A zero-length response is how the transport reports a lost server
fn check_response(buf: &WireBuffer, what: &str) -> Result<()> {
    if buf.is_empty() {
        warn!("empty {} response: connection lost", what);
        return Err(Error::Unreachable(format!("connection lost before {what}")));
    }
    Ok(())
}

/// Storage state of one process
pub struct GdsContext {
    env: GdsEnv,
    hash: HashStore,
    shmem: Option<ShmemStore>,
    own: ModuleKind,
    peers: HashMap<PeerId, (PeerInfo, ModuleKind)>,
}

impl GdsContext {
    /// Initialize every available module and select our own
    pub fn new(env: GdsEnv) -> Result<Self> {
        let mut hash = HashStore::new();
        hash.init(&env)?;

        let available = ModuleFactory::available_modules(&env.config);
        let shmem = if available.contains(&ModuleKind::Shmem) {
            let mut store = ShmemStore::new();
            match store.init(&env) {
                Ok(()) => Some(store),
                Err(e) => {
                    warn!("shmem module unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut ctx = Self {
            env,
            hash,
            shmem,
            own: ModuleKind::Hash,
            peers: HashMap::new(),
        };
        let directives = default_directives(&ctx.env);
        ctx.own = ctx.select(&directives)?;
        info!("gds context for {} ({}) uses {}", ctx.env.myid, ctx.env.role, ctx.own);
        Ok(ctx)
    }

    #[must_use]
    pub const fn env(&self) -> &GdsEnv {
        &self.env
    }

    /// Module this process uses for its own data
    #[must_use]
    pub const fn own_module(&self) -> ModuleKind {
        self.own
    }

    #[must_use]
    pub const fn hash(&self) -> &HashStore {
        &self.hash
    }

    #[must_use]
    pub const fn shmem(&self) -> Option<&ShmemStore> {
        self.shmem.as_ref()
    }

    fn select(&self, directives: &[Info]) -> Result<ModuleKind> {
        let mut modules: Vec<(ModuleKind, &dyn GdsModule)> = vec![(ModuleKind::Hash, &self.hash)];
        if let Some(shmem) = &self.shmem {
            modules.push((ModuleKind::Shmem, shmem));
        }
        Ok(ModuleFactory::select(&self.env, modules, directives)?.kind)
    }

    /// Register a peer and fix its module for the life of the connection
    pub fn add_peer(&mut self, peer: PeerInfo, directives: &[Info]) -> Result<ModuleKind> {
        if let Some((_, kind)) = self.peers.get(&peer.id) {
            return Ok(*kind);
        }
        let kind = self.select(directives)?;
        debug!("peer {} ({}) assigned {}", peer.id, peer.proc, kind);
        self.peers.insert(peer.id, (peer, kind));
        Ok(kind)
    }

    pub fn remove_peer(&mut self, id: PeerId) -> Option<PeerInfo> {
        self.peers.remove(&id).map(|(peer, _)| peer)
    }

    #[must_use]
    pub fn peer_module(&self, id: PeerId) -> Option<ModuleKind> {
        self.peers.get(&id).map(|(_, kind)| *kind)
    }

    /// Module serving `nspace`: the one its first peer uses, else our own
    fn module_for(&self, nspace: &Nspace) -> ModuleKind {
        self.peers
            .values()
            .filter(|(peer, _)| peer.proc.nspace == *nspace)
            .min_by_key(|(peer, _)| peer.id)
            .map_or(self.own, |(_, kind)| *kind)
    }

    /// Run `op` on `kind`, handing over to the hash module on `NotSupported`
    fn dispatch<T>(
        &mut self,
        kind: ModuleKind,
        mut op: impl FnMut(&mut dyn GdsModule, &GdsEnv) -> Result<T>,
    ) -> Result<T> {
        let env = &self.env;
        let primary = match kind {
            ModuleKind::Hash => None,
            ModuleKind::Shmem => self.shmem.as_mut(),
        };
        if let Some(module) = primary {
            let module: &mut dyn GdsModule = module;
            match op(module, env) {
                Err(e) if e.is_not_supported() => {
                    debug!("{} declined: {}; using hash", kind, e);
                }
                res => return res,
            }
        }
        op(&mut self.hash, env)
    }

    /// Server-side registration of a namespace
    pub fn cache_job_info(&mut self, nspace: &Nspace, info: &[Info]) -> Result<()> {
        let kind = self.module_for(nspace);
        self.dispatch(kind, |m, env| m.cache_job_info(env, nspace, info))
    }

    pub fn store(&mut self, proc: &ProcId, scope: Scope, kv: &KeyValue) -> Result<()> {
        let kind = self.own;
        self.dispatch(kind, |m, env| m.store(env, proc, scope, kv))
    }

    /// Fetch `key` (everything when `None`) for `proc`
    ///
    /// Misses in shared memory are retried in the hash module, which holds
    /// whatever shared memory refused.
    pub fn fetch(
        &self,
        proc: &ProcId,
        scope: Scope,
        key: Option<&str>,
        qualifiers: &[Info],
    ) -> Result<Vec<KeyValue>> {
        let mut out = Vec::new();
        if self.own == ModuleKind::Shmem
            && let Some(shmem) = &self.shmem
        {
            match shmem.fetch(&self.env, proc, scope, key, qualifiers, &mut out) {
                Ok(()) => return Ok(out),
                Err(e) if e.is_not_found() || e.is_not_supported() => out.clear(),
                Err(e) => return Err(e),
            }
        }
        self.hash
            .fetch(&self.env, proc, scope, key, qualifiers, &mut out)?;
        Ok(out)
    }

    /// Client-side ingest of the job payload from the server
    pub fn store_job_info(&mut self, nspace: &Nspace, buf: &mut WireBuffer) -> Result<()> {
        check_response(buf, "job info")?;
        let kind = self.own;
        let orig = buf.clone();
        self.dispatch(kind, |m, env| {
            *buf = orig.clone();
            m.store_job_info(env, nspace, buf)
        })
    }

    /// Pack the job payload for a registered peer
    ///
    /// Shared-memory peers get segment records; the job segment is
    /// published from the hash module's data on first use.
    pub fn register_job_info(&mut self, id: PeerId) -> Result<WireBuffer> {
        let Some((peer, kind)) = self.peers.get(&id).cloned() else {
            return Err(Error::bad_param(format!("unknown peer {id}")));
        };
        if kind == ModuleKind::Shmem {
            self.publish_job(&peer.proc.nspace);
        }
        let mut out = WireBuffer::new();
        self.dispatch(kind, |m, env| {
            out = WireBuffer::new();
            m.register_job_info(env, &peer, &mut out)
        })?;
        Ok(out)
    }

    fn publish_job(&mut self, nspace: &Nspace) {
        let Some(shmem) = &mut self.shmem else {
            return;
        };
        if shmem.is_published(nspace) {
            return;
        }
        let snapshot = match job_snapshot(&self.hash, &self.env, nspace) {
            Ok(s) => s,
            Err(e) => {
                warn!("no job data to publish for {}: {}", nspace, e);
                return;
            }
        };
        match shmem.publish_job(&self.env, nspace, &snapshot) {
            Ok(()) => debug!("{} served from shared memory", nspace),
            Err(e) => info!("{} stays with the hash module ({})", nspace, e),
        }
    }

    /// Ingest a modex result; on the server `ctx.reply` collects what the
    /// local clients need
    pub fn store_modex(
        &mut self,
        nspace: &Nspace,
        buf: &mut WireBuffer,
        ctx: &mut ModexCtx,
    ) -> Result<()> {
        let kind = if self.env.is_server() {
            self.module_for(nspace)
        } else {
            check_response(buf, "modex")?;
            self.own
        };
        let orig = buf.clone();
        self.dispatch(kind, |m, env| {
            *buf = orig.clone();
            ctx.reply = WireBuffer::new();
            m.store_modex(env, nspace, buf, ctx)
        })
    }

    /// Ingest a direct-modex response
    pub fn accept_kvs_resp(&mut self, buf: &mut WireBuffer) -> Result<()> {
        check_response(buf, "direct modex")?;
        self.hash.accept_kvs_resp(&self.env, buf)
    }

    /// Environment for a child about to be forked for `proc`
    pub fn setup_fork(&mut self, proc: &ProcId) -> Result<BTreeMap<String, String>> {
        let mut child = BTreeMap::new();
        let kind = self.own;
        self.dispatch(kind, |m, env| m.setup_fork(env, proc, &mut child))?;
        Ok(child)
    }

    /// Drop a namespace from every module
    pub fn del_nspace(&mut self, nspace: &Nspace) -> Result<()> {
        if let Some(shmem) = &mut self.shmem {
            shmem.del_nspace(&self.env, nspace)?;
        }
        self.hash.del_nspace(&self.env, nspace)?;
        self.peers.retain(|_, (peer, _)| peer.proc.nspace != *nspace);
        Ok(())
    }

    /// Release every module
    pub fn finalize(&mut self) {
        if let Some(shmem) = &mut self.shmem {
            shmem.finalize(&self.env);
        }
        self.hash.finalize(&self.env);
        self.peers.clear();
        debug!("gds context for {} finalized", self.env.myid);
    }
}

impl Drop for GdsContext {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Everything the hash module holds for a job, session array included
fn job_snapshot(hash: &HashStore, env: &GdsEnv, nspace: &Nspace) -> Result<Vec<KeyValue>> {
    let mut snapshot = Vec::new();
    let all = ProcId::new(nspace.clone(), Rank::WILDCARD);
    hash.fetch(env, &all, Scope::Undef, None, &[], &mut snapshot)?;

    let undef = ProcId::new(nspace.clone(), Rank::UNDEF);
    let q = [Info::new(keys::SESSION_INFO, true)];
    match hash.fetch(env, &undef, Scope::Undef, None, &q, &mut snapshot) {
        Err(e) if !e.is_not_found() => return Err(e),
        _ => {}
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Role;
    use crate::module::pack_modex_blob;
    use crate::shmem::{ConnectionInfo, vmhole};
    use gds_common::{GdsConfig, ModexKeyFormat, Value, VmHoleKind};
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};

    fn env(dir: &std::path::Path, role: Role, myid: ProcId) -> GdsEnv {
        let mut config = GdsConfig::default();
        config.shmem.tmpdir = Some(dir.to_path_buf());
        config.shmem.vmhole_kind = VmHoleKind::None;
        GdsEnv::with_hostname(config, myid, role, "n0")
    }

    fn server(dir: &std::path::Path) -> GdsContext {
        GdsContext::new(env(dir, Role::Server, ProcId::new("srv", Rank::new(0)))).unwrap()
    }

    fn client(dir: &std::path::Path, rank: u32, modules: &[&str]) -> GdsContext {
        let mut e = env(dir, Role::Client, ProcId::new("ns1", Rank::new(rank)));
        e.config.modules = modules.iter().map(ToString::to_string).collect();
        GdsContext::new(e).unwrap()
    }

    fn job_info() -> Vec<Info> {
        vec![
            Info::new(keys::JOB_SIZE, 2u32),
            Info::new(keys::SESSION_ID, 7u32),
            Info::new("user.flag", "on"),
            Info::new(
                keys::NODE_INFO_ARRAY,
                vec![
                    Info::new(keys::HOSTNAME, "n0"),
                    Info::new(keys::NODEID, 0u32),
                    Info::new(keys::LOCAL_SIZE, 2u32),
                ],
            ),
            Info::new(
                keys::PROC_DATA,
                vec![
                    Info::new(keys::RANK, Rank::new(0)),
                    Info::new(keys::LOCAL_RANK, 0u32),
                ],
            ),
            Info::new(
                keys::PROC_DATA,
                vec![
                    Info::new(keys::RANK, Rank::new(1)),
                    Info::new(keys::LOCAL_RANK, 1u32),
                ],
            ),
        ]
    }

    fn modex(ctx: &mut ModexCtx) -> WireBuffer {
        let mut buf = WireBuffer::new();
        for r in 0..2 {
            let proc = ProcId::new("ns1", Rank::new(r));
            let kv = KeyValue::new("user.ep", format!("tcp://10.0.0.{r}"));
            pack_modex_blob(&mut buf, &proc, &[kv], ctx).unwrap();
        }
        buf
    }

    /// Re-point segment records at hard links so this process can map
    /// them again once the server context is gone
    fn relink(dir: &std::path::Path, buf: &WireBuffer) -> WireBuffer {
        let mut src = buf.clone();
        let mut out = WireBuffer::new();
        let ns: String = src.unpack().unwrap();
        out.pack(&ns).unwrap();
        let mut n = 0;
        while let Ok(kv) = src.unpack::<KeyValue>() {
            let mut info = ConnectionInfo::from_value(&kv.value).unwrap();
            let link = dir.join(format!("ctx-link-{n}"));
            std::fs::hard_link(&info.path, &link).unwrap();
            info.path = link;
            out.pack(&KeyValue::new(keys::SHMEM_CONNECTION_INFO, info.to_value().unwrap()))
                .unwrap();
            n += 1;
        }
        out
    }

    #[test]
    fn test_hash_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let ns = Nspace::from("ns1");
        let mut srv = server(dir.path());
        srv.cache_job_info(&ns, &job_info()).unwrap();

        let peer = PeerInfo::new(1, ProcId::new("ns1", Rank::new(1)));
        let d = [Info::new(keys::GDS_MODULE, "hash")];
        assert_eq!(srv.add_peer(peer, &d).unwrap(), ModuleKind::Hash);
        // the first choice sticks
        let again = PeerInfo::new(1, ProcId::new("ns1", Rank::new(1)));
        assert_eq!(srv.add_peer(again, &[]).unwrap(), ModuleKind::Hash);
        let mut payload = srv.register_job_info(1).unwrap();

        let mut mctx = ModexCtx::new(ModexKeyFormat::Compact);
        let mut data = modex(&mut mctx);
        srv.store_modex(&ns, &mut data, &mut mctx).unwrap();
        let mut reply = mctx.reply.clone();

        let mut cli = client(dir.path(), 1, &["hash"]);
        assert_eq!(cli.own_module(), ModuleKind::Hash);
        cli.store_job_info(&ns, &mut payload).unwrap();
        let mut cctx = ModexCtx::new(ModexKeyFormat::Compact);
        cctx.kmap = mctx.kmap.clone();
        cli.store_modex(&ns, &mut reply, &mut cctx).unwrap();

        let me = ProcId::new("ns1", Rank::new(1));
        let got = cli.fetch(&me, Scope::Undef, Some(keys::LOCAL_RANK), &[]).unwrap();
        assert_eq!(got, vec![KeyValue::new(keys::LOCAL_RANK, 1u32)]);
        let peer0 = ProcId::new("ns1", Rank::new(0));
        let got = cli.fetch(&peer0, Scope::Remote, Some("user.ep"), &[]).unwrap();
        assert_eq!(got[0].value, Value::from("tcp://10.0.0.0"));
        let wild = ProcId::new("ns1", Rank::WILDCARD);
        let got = cli.fetch(&wild, Scope::Undef, Some(keys::JOB_SIZE), &[]).unwrap();
        assert_eq!(got[0].value, Value::Uint32(2));
    }

    #[test]
    fn test_shmem_end_to_end() {
        if !vmhole::available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let ns = Nspace::from("ns1");
        let mut srv = server(dir.path());
        assert_eq!(srv.own_module(), ModuleKind::Shmem);
        srv.cache_job_info(&ns, &job_info()).unwrap();

        let peer = PeerInfo::new(1, ProcId::new("ns1", Rank::new(1)));
        assert_eq!(srv.add_peer(peer, &[]).unwrap(), ModuleKind::Shmem);
        let payload = srv.register_job_info(1).unwrap();
        assert!(srv.shmem().unwrap().is_published(&ns));
        let mut linked = relink(dir.path(), &payload);

        // server data stays reachable through the context
        let wild = ProcId::new("ns1", Rank::WILDCARD);
        let got = srv.fetch(&wild, Scope::Undef, Some("user.flag"), &[]).unwrap();
        assert_eq!(got, vec![KeyValue::new("user.flag", "on")]);
        drop(srv);

        let mut cli = client(dir.path(), 1, &[]);
        assert_eq!(cli.own_module(), ModuleKind::Shmem);
        cli.store_job_info(&ns, &mut linked).unwrap();

        let me = ProcId::new("ns1", Rank::new(1));
        let got = cli.fetch(&me, Scope::Undef, Some(keys::LOCAL_RANK), &[]).unwrap();
        assert_eq!(got, vec![KeyValue::new(keys::LOCAL_RANK, 1u32)]);
        let q = [Info::new(keys::SESSION_INFO, true)];
        let got = cli.fetch(&wild, Scope::Undef, None, &q).unwrap();
        let items = got[0].value.as_info_array().unwrap();
        assert_eq!(items[0], Info::new(keys::SESSION_ID, 7u32));

        // puts the segment cannot take land in the hash module
        cli.store(&me, Scope::Global, &KeyValue::new("user.k", "v")).unwrap();
        let got = cli.fetch(&me, Scope::Undef, Some("user.k"), &[]).unwrap();
        assert_eq!(got, vec![KeyValue::new("user.k", "v")]);
    }

    /// Segment records named in a job payload and a modex reply
    fn segment_records(payload: &WireBuffer, reply: &WireBuffer) -> Vec<ConnectionInfo> {
        let mut records = Vec::new();
        let mut p = payload.clone();
        p.unpack::<String>().unwrap();
        while let Ok(kv) = p.unpack::<KeyValue>() {
            records.push(ConnectionInfo::from_value(&kv.value).unwrap());
        }
        let mut r = reply.clone();
        while let Ok(tag) = r.unpack::<String>() {
            assert_eq!(tag, keys::SHMEM_CONNECTION_INFO);
            records.push(ConnectionInfo::from_value(&r.unpack::<Value>().unwrap()).unwrap());
        }
        records
    }

    /// Client half of the cross-process test, run in the forked child
    fn read_in_child(
        dir: &std::path::Path,
        records: &[ConnectionInfo],
        mut payload: WireBuffer,
        mut reply: WireBuffer,
        mut mctx: ModexCtx,
    ) -> bool {
        let ns = Nspace::from("ns1");
        let mut cli = client(dir, 1, &[]);
        // drop the copies inherited from the server so the client maps
        // the files itself, at the server's addresses
        for info in records {
            unsafe {
                libc::munmap(info.base as *mut libc::c_void, info.size);
            }
        }
        cli.store_job_info(&ns, &mut payload).unwrap();
        cli.store_modex(&ns, &mut reply, &mut mctx).unwrap();

        let me = ProcId::new("ns1", Rank::new(1));
        let local = cli.fetch(&me, Scope::Undef, Some(keys::LOCAL_RANK), &[]).unwrap();
        let peer0 = ProcId::new("ns1", Rank::new(0));
        let ep = cli.fetch(&peer0, Scope::Remote, Some("user.ep"), &[]).unwrap();
        let attached = cli.shmem().unwrap().stats(&ns).len();

        local == vec![KeyValue::new(keys::LOCAL_RANK, 1u32)]
            && ep == vec![KeyValue::new("user.ep", "tcp://10.0.0.0")]
            && attached == records.len()
    }

    #[test]
    fn test_shmem_read_by_another_process() {
        if !vmhole::available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let ns = Nspace::from("ns1");
        let mut srv = server(dir.path());
        srv.cache_job_info(&ns, &job_info()).unwrap();
        srv.add_peer(PeerInfo::new(1, ProcId::new("ns1", Rank::new(1))), &[]).unwrap();
        let payload = srv.register_job_info(1).unwrap();

        let mut mctx = ModexCtx::new(ModexKeyFormat::Compact);
        let mut data = modex(&mut mctx);
        srv.store_modex(&ns, &mut data, &mut mctx).unwrap();
        let reply = mctx.reply.clone();
        let records = segment_records(&payload, &reply);
        assert_eq!(records.len(), 3);
        let mut cctx = ModexCtx::new(ModexKeyFormat::Compact);
        cctx.kmap = mctx.kmap.clone();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let ok = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    read_in_child(dir.path(), &records, payload, reply, cctx)
                }))
                .unwrap_or(false);
                // skip destructors: the server state here is a copy
                unsafe { libc::_exit(i32::from(!ok)) }
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));

                // the owner kept its segments throughout
                assert!(srv.shmem().unwrap().is_published(&ns));
                assert!(records.iter().all(|r| r.path.exists()));
                let wild = ProcId::new("ns1", Rank::WILDCARD);
                let got = srv.fetch(&wild, Scope::Undef, Some("user.flag"), &[]).unwrap();
                assert_eq!(got, vec![KeyValue::new("user.flag", "on")]);
            }
        }
    }

    #[test]
    fn test_failed_publish_serves_hash_payload() {
        if !vmhole::available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let ns = Nspace::from("ns1");
        let missing = dir.path().join("missing");
        let mut srv = GdsContext::new(env(&missing, Role::Server, ProcId::new("srv", Rank::new(0)))).unwrap();
        srv.cache_job_info(&ns, &job_info()).unwrap();
        let peer = PeerInfo::new(1, ProcId::new("ns1", Rank::new(1)));
        assert_eq!(srv.add_peer(peer, &[]).unwrap(), ModuleKind::Shmem);

        let mut payload = srv.register_job_info(1).unwrap();
        assert!(!srv.shmem().unwrap().is_published(&ns));

        let mut cli = client(dir.path(), 1, &["hash"]);
        cli.store_job_info(&ns, &mut payload).unwrap();
        let me = ProcId::new("ns1", Rank::new(1));
        let got = cli.fetch(&me, Scope::Undef, Some(keys::LOCAL_RANK), &[]).unwrap();
        assert_eq!(got, vec![KeyValue::new(keys::LOCAL_RANK, 1u32)]);
    }

    #[test]
    fn test_two_rank_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = env(dir.path(), Role::Server, ProcId::new("srv", Rank::new(0)));
        e.config.modules = vec!["hash".into()];
        let mut ctx = GdsContext::new(e).unwrap();

        let wild = ProcId::new("ns1", Rank::WILDCARD);
        ctx.store(&wild, Scope::Internal, &KeyValue::new(keys::JOB_SIZE, 2u32)).unwrap();
        for r in 0..2 {
            let proc = ProcId::new("ns1", Rank::new(r));
            ctx.store(&proc, Scope::Internal, &KeyValue::new(keys::APPNUM, r)).unwrap();
        }
        let node = vec![Info::new(keys::HOSTNAME, "node01"), Info::new(keys::NODEID, 0u32)];
        ctx.store(&wild, Scope::Internal, &KeyValue::new(keys::NODE_INFO_ARRAY, node)).unwrap();

        let all = ctx.fetch(&wild, Scope::Undef, None, &[]).unwrap();
        let procs: Vec<_> = all.iter().filter(|kv| kv.check_key(keys::PROC_DATA)).collect();
        assert_eq!(procs.len(), 2);
        for (r, kv) in (0u32..).zip(&procs) {
            let items = kv.value.as_info_array().unwrap();
            assert_eq!(items[0].value, Value::Rank(Rank::new(r)));
            assert!(items.contains(&Info::new(keys::APPNUM, r)));
        }
        let nodes: Vec<_> = all.iter().filter(|kv| kv.check_key(keys::NODE_INFO_ARRAY)).collect();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].value.as_info_array().unwrap()[0], Info::new(keys::HOSTNAME, "node01"));
    }

    #[test]
    fn test_fallback_to_hash_payload() {
        let dir = tempfile::tempdir().unwrap();
        let ns = Nspace::from("ns1");
        let mut srv = server(dir.path());
        srv.cache_job_info(&ns, &job_info()).unwrap();
        let d = [Info::new(keys::GDS_MODULE, "hash")];
        srv.add_peer(PeerInfo::new(1, ProcId::new("ns1", Rank::new(1))), &d).unwrap();
        let mut payload = srv.register_job_info(1).unwrap();

        // a shmem client handed a hash payload still ingests it
        let mut cli = client(dir.path(), 1, &[]);
        cli.store_job_info(&ns, &mut payload).unwrap();
        let me = ProcId::new("ns1", Rank::new(1));
        let got = cli.fetch(&me, Scope::Undef, Some(keys::LOCAL_RANK), &[]).unwrap();
        assert_eq!(got, vec![KeyValue::new(keys::LOCAL_RANK, 1u32)]);
    }

    #[test]
    fn test_unknown_peer_and_del_nspace() {
        let dir = tempfile::tempdir().unwrap();
        let ns = Nspace::from("ns1");
        let mut srv = server(dir.path());
        assert!(matches!(srv.register_job_info(9), Err(Error::BadParam(_))));

        srv.cache_job_info(&ns, &job_info()).unwrap();
        srv.add_peer(PeerInfo::new(1, ProcId::new("ns1", Rank::new(1))), &[]).unwrap();
        srv.register_job_info(1).unwrap();
        srv.del_nspace(&ns).unwrap();
        assert!(srv.peer_module(1).is_none());
        let err = srv
            .fetch(&ProcId::new("ns1", Rank::new(0)), Scope::Undef, Some("user.flag"), &[])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidNamespace(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_response_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = client(dir.path(), 0, &[]);
        let ns = Nspace::from("ns1");
        let err = cli.store_job_info(&ns, &mut WireBuffer::new()).unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
        let mut mctx = ModexCtx::default();
        let err = cli.store_modex(&ns, &mut WireBuffer::new(), &mut mctx).unwrap_err();
        assert_eq!(err.status_str(), "UNREACHABLE");
        assert!(cli.accept_kvs_resp(&mut WireBuffer::new()).is_err());
    }

    #[test]
    fn test_setup_fork_exports_module() {
        let dir = tempfile::tempdir().unwrap();
        let mut cli = client(dir.path(), 0, &["hash"]);
        let child = cli.setup_fork(&ProcId::new("ns1", Rank::new(0))).unwrap();
        assert_eq!(child[keys::GDS_MODULE_ENV], "hash");
    }
}
