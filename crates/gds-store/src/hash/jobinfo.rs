//! Job registration, job payload exchange and modex ingest
//!
//! The server registers a namespace from an info list ([`HashStore::cache_job`]),
//! then packs one payload per connecting peer:
//!
//! ```text
//! nspace | kv ... | NODE_INFO_ARRAY ... | APP_INFO_ARRAY ... | MAP_BLOB | PROC_BLOB x nprocs
//! ```
//!
//! The payload is built once and served from cache while more local peers
//! are still expected. Clients unpack it with [`HashStore::unpack_job`].

use super::arrays::{
    attach_session, process_app_array, process_node_array, process_session_array,
    store_proc_data,
};
use super::map::{MapFlags, MapParser, parse_ranks, store_map};
use super::tracker::{
    AppTracker, JobTracker, Sessions, merge_node, node_by_name_mut, node_from_items, set_kv,
};
use super::{HashStore, tracker, update_nprocs};
use crate::env::GdsEnv;
use crate::module::{GdsModule, ModexCtx, PeerInfo};
use gds_common::codec::unpack_modex_kval;
use gds_common::keys;
use gds_common::{Error, Info, KeyValue, Nspace, ProcId, Rank, Result, Scope, Value, WireBuffer};
use tracing::{debug, error, warn};

/// Accumulates a namespace registration
struct JobIngest<'a> {
    env: &'a GdsEnv,
    sessions: &'a mut Sessions,
    parser: &'a dyn MapParser,
    nodes: Option<Vec<String>>,
    procs: Option<Vec<String>>,
    flags: MapFlags,
}

impl JobIngest<'_> {
    fn item(&mut self, trk: &mut JobTracker, info: &Info, nested: bool) -> Result<()> {
        let env = self.env;
        let dict = &env.keys;
        let threshold = env.threshold();
        match info.key.as_str() {
            keys::SESSION_ID => attach_session(trk, self.sessions, info.value.as_u32()?),
            keys::SESSION_INFO_ARRAY => process_session_array(&info.value, trk, self.sessions)?,
            keys::JOB_INFO_ARRAY => {
                if nested {
                    return Err(Error::bad_param("nested job info array"));
                }
                for inner in info.value.as_info_array()? {
                    self.item(trk, inner, true)?;
                }
            }
            keys::APP_INFO_ARRAY => process_app_array(&info.value, trk)?,
            keys::NODE_INFO_ARRAY => process_node_array(&info.value, &mut trk.nodes)?,
            keys::NODE_MAP => {
                if self.nodes.is_some() {
                    error!("node map given twice for {}", trk.nspace);
                    return Err(Error::bad_param("duplicate node map"));
                }
                self.nodes = Some(self.parser.parse_nodes(&info.value)?);
            }
            keys::PROC_MAP => {
                if self.procs.is_some() {
                    error!("proc map given twice for {}", trk.nspace);
                    return Err(Error::bad_param("duplicate proc map"));
                }
                self.procs = Some(self.parser.parse_procs(&info.value)?);
            }
            keys::PROC_DATA => {
                let rank = store_proc_data(dict, &mut trk.internal, &info.value, threshold)?;
                if !trk.internal.contains(dict, rank, keys::APPNUM) {
                    trk.internal
                        .store(dict, rank, &KeyValue::new(keys::APPNUM, 0u32), threshold)?;
                }
            }
            k if keys::is_node_level(k) => {
                if k == keys::LOCAL_SIZE {
                    trk.nlocalprocs = info.value.as_u32()?;
                }
                node_by_name_mut(&mut trk.nodes, &env.hostname)
                    .set(KeyValue::from(info.clone()));
            }
            k if keys::is_app_level(k) => {
                if trk.app(0).is_none() {
                    trk.apps.push(AppTracker::new(0));
                }
                if let Some(app) = trk.app_mut(0) {
                    set_kv(&mut app.info, KeyValue::from(info.clone()));
                }
            }
            k => {
                match k {
                    keys::JOB_SIZE => {
                        update_nprocs(trk, &info.value)?;
                        self.flags.job_size = true;
                    }
                    keys::NUM_NODES => self.flags.num_nodes = true,
                    keys::MAX_PROCS => self.flags.max_procs = true,
                    _ => {}
                }
                trk.internal.store(
                    dict,
                    Rank::WILDCARD,
                    &KeyValue::from(info.clone()),
                    threshold,
                )?;
            }
        }
        Ok(())
    }
}

/// Pack the node/rank layout as a MAP_BLOB byte object
fn pack_map_blob(trk: &JobTracker) -> Result<Option<Vec<u8>>> {
    let entries: Vec<KeyValue> = trk
        .nodes
        .iter()
        .filter_map(|n| {
            let host = n.hostname.as_ref()?;
            let peers = n.get(keys::LOCAL_PEERS)?;
            Some(KeyValue::new(host.as_str(), peers.value.clone()))
        })
        .collect();
    if entries.is_empty() {
        return Ok(None);
    }
    let mut blob = WireBuffer::new();
    blob.pack(&u32::try_from(entries.len()).map_err(|_| Error::bad_param("too many nodes"))?)?;
    for kv in &entries {
        blob.pack(kv)?;
    }
    Ok(Some(blob.unread().to_vec()))
}

impl HashStore {
    pub(super) fn cache_job(&mut self, env: &GdsEnv, nspace: &Nspace, info: &[Info]) -> Result<()> {
        debug!("hash caching job info for {} ({} items)", nspace, info.len());
        let trk = tracker(&mut self.jobs, nspace);
        let mut ingest = JobIngest {
            env,
            sessions: &mut self.sessions,
            parser: self.map_parser.as_ref(),
            nodes: None,
            procs: None,
            flags: MapFlags::default(),
        };
        for item in info {
            ingest.item(trk, item, false)?;
        }
        match (ingest.nodes.take(), ingest.procs.take()) {
            (Some(nodes), Some(procs)) => store_map(env, trk, &nodes, &procs, ingest.flags)?,
            (None, None) => {}
            _ => warn!("{}: node and proc maps must be given together", nspace),
        }
        trk.gdata_added = true;
        Ok(())
    }

    /// Build the payload for one peer
    fn build_job_payload(
        &self,
        env: &GdsEnv,
        trk: &JobTracker,
        peer: &PeerInfo,
    ) -> Result<WireBuffer> {
        let mut buf = WireBuffer::new();
        buf.pack(trk.nspace.as_str())?;

        let mut kvs = Vec::new();
        match trk.internal.fetch(&env.keys, Rank::WILDCARD, None, &mut kvs) {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        for kv in &kvs {
            buf.pack(kv)?;
        }

        for node in &trk.nodes {
            if peer.version.understands_node_arrays() {
                buf.pack(&KeyValue::new(keys::NODE_INFO_ARRAY, node.to_info_array()))?;
            } else if let Some(host) = &node.hostname {
                buf.pack(&KeyValue::new(host.as_str(), node.to_info_array()))?;
            }
        }
        for app in &trk.apps {
            buf.pack(&KeyValue::new(keys::APP_INFO_ARRAY, app.to_info_array()))?;
        }
        if let Some(session) = trk.session.and_then(|id| self.sessions.get(id)) {
            buf.pack(&KeyValue::new(keys::SESSION_INFO_ARRAY, session.to_info_array()))?;
        }
        if let Some(blob) = pack_map_blob(trk)? {
            buf.pack(&KeyValue::new(keys::MAP_BLOB, Value::Bytes(blob)))?;
        }

        for r in 0..trk.nprocs {
            let rank = Rank::new(r);
            let mut data = Vec::new();
            match trk.internal.fetch(&env.keys, rank, None, &mut data) {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
            let mut blob = WireBuffer::new();
            blob.pack(&rank)?;
            for kv in &data {
                blob.pack(kv)?;
            }
            buf.pack(&KeyValue::new(keys::PROC_BLOB, Value::Bytes(blob.unread().to_vec())))?;
        }
        Ok(buf)
    }

    pub(super) fn pack_job(
        &mut self,
        env: &GdsEnv,
        peer: &PeerInfo,
        out: &mut WireBuffer,
    ) -> Result<()> {
        if !env.is_server() {
            return Err(Error::not_supported("job registration outside the server"));
        }
        let nspace = &peer.proc.nspace;
        let Some(trk) = self.jobs.get(nspace) else {
            error!("register_job_info for unknown namespace {}", nspace);
            return Err(Error::InvalidNamespace(nspace.to_string()));
        };

        let modern = peer.version.understands_node_arrays();
        if modern && let Some(bkt) = &trk.jobbkt {
            out.append(&WireBuffer::from_bytes(bkt));
            let Some(trk) = self.jobs.get_mut(nspace) else {
                return Err(Error::internal("job tracker vanished"));
            };
            trk.ndelivered += 1;
            if trk.ndelivered >= trk.nlocalprocs {
                debug!("all local peers of {} served, releasing job payload", nspace);
                trk.jobbkt = None;
                trk.ndelivered = 0;
            }
            return Ok(());
        }

        let buf = self.build_job_payload(env, trk, peer)?;
        out.append(&buf);
        debug!(
            "packed {} bytes of job data for {} (peer {})",
            buf.len(),
            nspace,
            peer.id
        );
        if modern && let Some(trk) = self.jobs.get_mut(nspace)
            && trk.nlocalprocs > 1
        {
            trk.jobbkt = Some(buf.to_bytes());
            trk.ndelivered = 1;
        }
        Ok(())
    }

    pub(super) fn unpack_job(
        &mut self,
        env: &GdsEnv,
        nspace: &Nspace,
        buf: &mut WireBuffer,
    ) -> Result<()> {
        let ns: String = match buf.unpack() {
            Ok(ns) => ns,
            Err(Error::EndOfBuffer) => return Err(Error::bad_param("empty job info buffer")),
            Err(e) => return Err(e),
        };
        if ns != nspace.as_str() {
            error!("job payload for {} delivered as {}", ns, nspace);
            return Err(Error::bad_param(format!("payload namespace {ns} != {nspace}")));
        }
        let dict = &env.keys;
        let threshold = env.threshold();
        let trk = tracker(&mut self.jobs, nspace);

        loop {
            let kv: KeyValue = match buf.unpack() {
                Ok(kv) => kv,
                Err(Error::EndOfBuffer) => break,
                Err(e) => return Err(e),
            };
            match kv.key.as_str() {
                keys::PROC_BLOB => {
                    let bytes = kv
                        .value
                        .as_bytes()
                        .ok_or_else(|| Error::type_mismatch("proc blob must be bytes"))?;
                    let mut blob = WireBuffer::from_bytes(bytes);
                    let rank: Rank = blob.unpack()?;
                    loop {
                        match blob.unpack::<KeyValue>() {
                            Ok(item) => trk.internal.store(dict, rank, &item, threshold)?,
                            Err(Error::EndOfBuffer) => break,
                            Err(e) => return Err(e),
                        }
                    }
                }
                keys::MAP_BLOB => {
                    let bytes = kv
                        .value
                        .as_bytes()
                        .ok_or_else(|| Error::type_mismatch("map blob must be bytes"))?;
                    let mut blob = WireBuffer::from_bytes(bytes);
                    let nnodes: u32 = blob.unpack()?;
                    let mut names = Vec::new();
                    for _ in 0..nnodes {
                        let entry: KeyValue = blob.unpack()?;
                        let peers = entry
                            .value
                            .as_str()
                            .ok_or_else(|| Error::type_mismatch("local peers must be a string"))?;
                        for r in parse_ranks(peers)? {
                            trk.internal.store(
                                dict,
                                Rank::new(r),
                                &KeyValue::new(keys::HOSTNAME, entry.key.as_str()),
                                threshold,
                            )?;
                        }
                        node_by_name_mut(&mut trk.nodes, &entry.key)
                            .set(KeyValue::new(keys::LOCAL_PEERS, peers));
                        names.push(entry.key);
                    }
                    trk.internal.store(
                        dict,
                        Rank::WILDCARD,
                        &KeyValue::new(keys::NODE_LIST, names.join(",")),
                        threshold,
                    )?;
                }
                keys::NODE_INFO_ARRAY => process_node_array(&kv.value, &mut trk.nodes)?,
                keys::APP_INFO_ARRAY => process_app_array(&kv.value, trk)?,
                keys::SESSION_INFO_ARRAY => {
                    process_session_array(&kv.value, trk, &mut self.sessions)?;
                }
                // peers before 3.1 key node info by hostname
                k if !keys::is_reserved(k) && matches!(kv.value, Value::InfoArray(_)) => {
                    let mut node = node_from_items(kv.value.as_info_array()?)?;
                    if node.hostname.is_none() {
                        node.hostname = Some(k.to_string());
                    }
                    merge_node(&mut trk.nodes, node);
                }
                _ => {
                    if kv.check_key(keys::JOB_SIZE) {
                        update_nprocs(trk, &kv.value)?;
                    }
                    trk.internal.store(dict, Rank::WILDCARD, &kv, threshold)?;
                }
            }
        }
        trk.gdata_added = true;
        debug!("stored job info for {}", nspace);
        Ok(())
    }

    pub(super) fn ingest_modex(
        &mut self,
        env: &GdsEnv,
        nspace: &Nspace,
        buf: &mut WireBuffer,
        ctx: &mut ModexCtx,
    ) -> Result<()> {
        let relay = buf.clone();
        let mut nprocs = 0usize;
        loop {
            let proc: ProcId = match buf.unpack() {
                Ok(p) => p,
                Err(Error::EndOfBuffer) => break,
                Err(e) => return Err(e),
            };
            let bytes: Vec<u8> = buf.unpack()?;
            if proc.nspace != *nspace {
                debug!("modex for {} carries data of {}", nspace, proc.nspace);
            }
            // data without a rank is attributed to rank 0
            let rank = if proc.rank.is_undef() { Rank::new(0) } else { proc.rank };
            let trk = tracker(&mut self.jobs, &proc.nspace);
            let mut blob = WireBuffer::from_bytes(bytes);
            loop {
                match unpack_modex_kval(&mut blob, ctx.key_format, &ctx.kmap) {
                    Ok(kv) => trk.remote.store(&env.keys, rank, &kv, env.threshold())?,
                    Err(Error::EndOfBuffer) => break,
                    Err(e) => return Err(e),
                }
            }
            nprocs += 1;
        }
        debug!("hash stored modex for {} procs of {}", nprocs, nspace);
        if env.is_server() {
            ctx.reply.append(&relay);
        }
        Ok(())
    }

    /// Ingest a direct-modex response
    ///
    /// The buffer holds byte objects, each a proc id followed by its
    /// key/values. An UNDEF rank means this process.
    pub fn accept_kvs_resp(&mut self, env: &GdsEnv, buf: &mut WireBuffer) -> Result<()> {
        loop {
            let bytes: Vec<u8> = match buf.unpack() {
                Ok(b) => b,
                Err(Error::EndOfBuffer) => break,
                Err(e) => return Err(e),
            };
            let mut blob = WireBuffer::from_bytes(bytes);
            let mut proc: ProcId = blob.unpack()?;
            if proc.rank.is_undef() {
                proc.rank = env.myid.rank;
            }
            loop {
                match blob.unpack::<KeyValue>() {
                    Ok(kv) => self.store(env, &proc, Scope::Internal, &kv)?,
                    Err(Error::EndOfBuffer) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::server_env;
    use super::*;
    use crate::env::Role;
    use crate::module::pack_modex_blob;
    use gds_common::{ModexKeyFormat, PeerVersion};

    fn client_env(rank: u32) -> GdsEnv {
        let mut env = server_env();
        env.role = Role::Client;
        env.myid = ProcId::new("ns1", Rank::new(rank));
        env
    }

    fn registered(env: &GdsEnv) -> HashStore {
        let mut hs = HashStore::new();
        hs.cache_job_info(
            env,
            &Nspace::new("ns1"),
            &[
                Info::new(keys::SESSION_ID, 9u32),
                Info::new(keys::JOB_SIZE, 2u32),
                Info::new(keys::NODE_MAP, "n0"),
                Info::new(keys::PROC_MAP, "0,1"),
                Info::new(keys::LOCAL_SIZE, 2u32),
                Info::new(keys::WDIR, "/work"),
                Info::new(
                    keys::PROC_DATA,
                    vec![Info::new(keys::RANK, Rank::new(1)), Info::new("user.p1", "x")],
                ),
                Info::new(
                    keys::JOB_INFO_ARRAY,
                    vec![Info::new("user.nested", 1u32)],
                ),
            ],
        )
        .unwrap();
        hs
    }

    #[test]
    fn test_cache_job_info() {
        let env = server_env();
        let hs = registered(&env);
        let trk = hs.job(&Nspace::new("ns1")).unwrap();
        assert_eq!(trk.nprocs, 2);
        assert_eq!(trk.nlocalprocs, 2);
        assert_eq!(trk.session, Some(9));
        assert!(trk.gdata_added);
        assert!(trk.internal.contains(&env.keys, Rank::WILDCARD, "user.nested"));
        assert!(trk.internal.contains(&env.keys, Rank::new(1), keys::APPNUM));
        assert!(trk.app(0).unwrap().info.iter().any(|kv| kv.check_key(keys::WDIR)));
        // LOCAL_SIZE lands on this host's node, which the map also names
        assert_eq!(trk.nodes.len(), 1);
        assert!(trk.internal.contains(&env.keys, Rank::WILDCARD, keys::MAX_PROCS));
    }

    #[test]
    fn test_cache_job_info_rejects_duplicate_maps() {
        let env = server_env();
        let mut hs = HashStore::new();
        let err = hs
            .cache_job_info(
                &env,
                &Nspace::new("ns1"),
                &[Info::new(keys::NODE_MAP, "n0"), Info::new(keys::NODE_MAP, "n1")],
            )
            .unwrap_err();
        assert!(matches!(err, Error::BadParam(_)));
    }

    #[test]
    fn test_job_payload_end_to_end() {
        let env = server_env();
        let mut server = registered(&env);
        let peer = PeerInfo::new(1, ProcId::new("ns1", Rank::new(0)));
        let mut wire = WireBuffer::new();
        server.register_job_info(&env, &peer, &mut wire).unwrap();

        let cenv = client_env(0);
        let mut client = HashStore::new();
        let mut rx = WireBuffer::from_bytes(wire.unread());
        client.store_job_info(&cenv, &Nspace::new("ns1"), &mut rx).unwrap();

        let trk = client.job(&Nspace::new("ns1")).unwrap();
        assert_eq!(trk.nprocs, 2);
        assert_eq!(client.sessions().refs(9), 1);
        let mut out = Vec::new();
        client
            .fetch(&cenv, &ProcId::new("ns1", Rank::new(1)), Scope::Undef, Some(keys::HOSTNAME), &[], &mut out)
            .unwrap();
        assert_eq!(out[0].value, Value::from("n0"));
        out.clear();
        client
            .fetch(&cenv, &ProcId::new("ns1", Rank::new(1)), Scope::Undef, Some("user.p1"), &[], &mut out)
            .unwrap();
        assert_eq!(out[0].value, Value::from("x"));
        out.clear();
        client
            .fetch(&cenv, &ProcId::new("ns1", Rank::WILDCARD), Scope::Undef, Some(keys::LOCAL_SIZE), &[], &mut out)
            .unwrap();
        assert_eq!(out[0].value, Value::Uint32(2));
    }

    #[test]
    fn test_job_payload_cached_for_local_peers() {
        let env = server_env();
        let mut server = registered(&env);
        let ns = Nspace::new("ns1");
        for r in 0..2 {
            let peer = PeerInfo::new(r, ProcId::new("ns1", Rank::new(r)));
            let mut wire = WireBuffer::new();
            server.register_job_info(&env, &peer, &mut wire).unwrap();
            assert!(!wire.is_empty());
            if r == 0 {
                assert!(server.job(&ns).unwrap().jobbkt.is_some());
            }
        }
        // both local peers served, the cached payload is gone
        assert!(server.job(&ns).unwrap().jobbkt.is_none());
    }

    #[test]
    fn test_old_peer_gets_hostname_keys() {
        let env = server_env();
        let mut server = registered(&env);
        let mut peer = PeerInfo::new(1, ProcId::new("ns1", Rank::new(0)));
        peer.version = PeerVersion::new(3, 0, 0);
        let mut wire = WireBuffer::new();
        server.register_job_info(&env, &peer, &mut wire).unwrap();

        let _ns: String = wire.unpack().unwrap();
        let mut saw_host_key = false;
        while let Ok(kv) = wire.unpack::<KeyValue>() {
            assert!(!kv.check_key(keys::NODE_INFO_ARRAY));
            saw_host_key |= kv.check_key("n0");
        }
        assert!(saw_host_key);

        wire.rewind();
        let mut client = HashStore::new();
        client.store_job_info(&client_env(0), &Nspace::new("ns1"), &mut wire).unwrap();
        assert_eq!(client.job(&Nspace::new("ns1")).unwrap().nodes.len(), 1);
    }

    #[test]
    fn test_store_job_info_errors() {
        let env = client_env(0);
        let mut hs = HashStore::new();
        let err = hs
            .store_job_info(&env, &Nspace::new("ns1"), &mut WireBuffer::new())
            .unwrap_err();
        assert!(matches!(err, Error::BadParam(_)));

        let mut buf = WireBuffer::new();
        buf.pack("other").unwrap();
        assert!(hs.store_job_info(&env, &Nspace::new("ns1"), &mut buf).is_err());
        assert!(hs
            .register_job_info(&env, &PeerInfo::new(0, env.myid.clone()), &mut WireBuffer::new())
            .unwrap_err()
            .is_not_supported());
    }

    #[test]
    fn test_modex_ingest() {
        let env = server_env();
        let mut hs = HashStore::new();
        let mut ctx = ModexCtx::new(ModexKeyFormat::Compact);
        let mut buf = WireBuffer::new();
        for r in 0..2u32 {
            pack_modex_blob(
                &mut buf,
                &ProcId::new("ns1", Rank::new(r)),
                &[KeyValue::new("user.ep", format!("tcp://10.0.0.{r}"))],
                &mut ctx,
            )
            .unwrap();
        }
        hs.store_modex(&env, &Nspace::new("ns1"), &mut buf, &mut ctx).unwrap();
        assert!(!ctx.reply.is_empty());

        let mut out = Vec::new();
        hs.fetch(&env, &ProcId::new("ns1", Rank::new(1)), Scope::Remote, Some("user.ep"), &[], &mut out)
            .unwrap();
        assert_eq!(out[0].value, Value::from("tcp://10.0.0.1"));
    }

    #[test]
    fn test_accept_kvs_resp() {
        let env = client_env(3);
        let mut hs = HashStore::new();
        let mut blob = WireBuffer::new();
        blob.pack(&ProcId::new("ns1", Rank::UNDEF)).unwrap();
        blob.pack(&KeyValue::new("user.dm", 7u32)).unwrap();
        let mut buf = WireBuffer::new();
        buf.pack(&blob.unread().to_vec()).unwrap();
        hs.accept_kvs_resp(&env, &mut buf).unwrap();

        let mut out = Vec::new();
        hs.fetch(&env, &ProcId::new("ns1", Rank::new(3)), Scope::Internal, Some("user.dm"), &[], &mut out)
            .unwrap();
        assert_eq!(out[0].value, Value::Uint32(7));
    }
}
