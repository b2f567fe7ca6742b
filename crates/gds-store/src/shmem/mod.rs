//! Shared-memory backend
//!
//! The server writes each job's data once into a segment that every local
//! client maps read-only at the same address, so gets never leave the
//! process. Per namespace there are up to three segments:
//!
//! ```text
//!  job       job-level data, nodes, apps, per-proc data   (one per job)
//!  session   session info, shared by jobs of one session  (refcounted)
//!  modex     data exchanged by the procs after startup    (one per round)
//! ```
//!
//! Anything this backend cannot hold is refused with `NotSupported` and
//! the context hands it to the hash backend instead.

mod arena;
mod exchange;
mod fetch;
pub mod hash2;
mod job;
pub mod segment;
pub mod vmhole;

pub use arena::{Arena, ArenaSafe, ShmBytes, ShmPtr, ShmSlice, ShmStr, TmaStats};
pub use job::{MIN_SEGMENT, segment_size};
pub use segment::{ConnectionInfo, Segment, SegmentKind};

use crate::env::GdsEnv;
use crate::module::{GdsModule, ModexCtx, ModuleCapabilities, PeerInfo, directive_priority};
use gds_common::keys;
use gds_common::{Error, Info, KeyValue, Nspace, ProcId, Result, Scope, WireBuffer};
use job::{JobParts, build_job_segment, build_session_segment};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Segments held for one namespace
#[derive(Debug, Default)]
struct ShmemJob {
    job: Option<Arena>,
    /// Published modex rounds, oldest first
    modex: Vec<Arena>,
    session: Option<u32>,
}

impl ShmemJob {
    fn arenas(&self) -> impl Iterator<Item = &Arena> {
        self.job.iter().chain(self.modex.iter())
    }
}

#[derive(Debug)]
struct SharedSession {
    arena: Arena,
    refs: usize,
}

/// Zero-copy backend over shared segments
#[derive(Debug, Default)]
pub struct ShmemStore {
    jobs: HashMap<Nspace, ShmemJob>,
    sessions: HashMap<u32, SharedSession>,
}

impl ShmemStore {
    pub const NAME: &'static str = "shmem";
    pub const DEFAULT_PRIORITY: u32 = 20;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a job segment exists for `nspace`
    #[must_use]
    pub fn is_published(&self, nspace: &Nspace) -> bool {
        self.jobs.get(nspace).is_some_and(|j| j.job.is_some())
    }

    /// Usage of every segment held for `nspace`
    #[must_use]
    pub fn stats(&self, nspace: &Nspace) -> Vec<(SegmentKind, TmaStats)> {
        let Some(job) = self.jobs.get(nspace) else {
            return Vec::new();
        };
        let session = job
            .session
            .and_then(|id| self.sessions.get(&id))
            .map(|s| &s.arena);
        job.arenas()
            .chain(session)
            .map(|a| (a.segment().kind(), a.stats()))
            .collect()
    }

    /// Take a reference on a session segment, creating or attaching it
    fn retain_session(&mut self, id: u32, open: impl FnOnce() -> Result<Arena>) -> Result<()> {
        if let Some(s) = self.sessions.get_mut(&id) {
            s.refs += 1;
            return Ok(());
        }
        let arena = open()?;
        self.sessions.insert(id, SharedSession { arena, refs: 1 });
        Ok(())
    }

    fn release_session(&mut self, id: u32) {
        let Some(s) = self.sessions.get_mut(&id) else {
            return;
        };
        s.refs = s.refs.saturating_sub(1);
        if s.refs == 0
            && let Some(s) = self.sessions.remove(&id)
        {
            s.arena.log_stats();
            debug!("released session segment {}", id);
        }
    }

    /// Write the job segment for `nspace` from a snapshot of its data
    fn publish(&mut self, env: &GdsEnv, nspace: &Nspace, snapshot: &[KeyValue]) -> Result<()> {
        if !env.is_server() {
            return Err(Error::not_supported("publishing outside the server"));
        }
        if self.is_published(nspace) {
            debug!("job segment for {} already published", nspace);
            return Ok(());
        }
        let parts = JobParts::split(snapshot)?;
        let arena = build_job_segment(env, nspace, &parts, snapshot)?;
        let session = match &parts.session {
            Some((id, info)) => {
                self.retain_session(*id, || build_session_segment(env, *id, info))?;
                Some(*id)
            }
            None => None,
        };
        let job = self.jobs.entry(nspace.clone()).or_default();
        job.job = Some(arena);
        job.session = session;
        info!("published {} in shared memory", nspace);
        Ok(())
    }
}

impl GdsModule for ShmemStore {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn capabilities(&self) -> ModuleCapabilities {
        ModuleCapabilities {
            zero_copy: true,
            caches_job_info: false,
            direct_store: false,
        }
    }

    fn init(&mut self, env: &GdsEnv) -> Result<()> {
        if !vmhole::available() {
            return Err(Error::not_supported("no memory map table on this platform"));
        }
        debug!(
            "shmem module initialized for {} (segments under {})",
            env.myid,
            env.config.shmem.resolved_tmpdir().display()
        );
        Ok(())
    }

    fn finalize(&mut self, _env: &GdsEnv) {
        for job in self.jobs.values() {
            for arena in job.arenas() {
                arena.log_stats();
            }
        }
        for s in self.sessions.values() {
            s.arena.log_stats();
        }
        self.jobs.clear();
        self.sessions.clear();
    }

    fn assign_module(&self, env: &GdsEnv, directives: &[Info]) -> Option<u32> {
        if !env.config.shmem.enabled || !vmhole::available() {
            return None;
        }
        directive_priority(directives, Self::NAME, Self::DEFAULT_PRIORITY)
    }

    fn cache_job_info(&mut self, _env: &GdsEnv, nspace: &Nspace, _info: &[Info]) -> Result<()> {
        Err(Error::not_supported(format!("shmem job info caching for {nspace}")))
    }

    fn store(&mut self, _env: &GdsEnv, proc: &ProcId, _scope: Scope, kv: &KeyValue) -> Result<()> {
        Err(Error::not_supported(format!("shmem store of {} for {}", kv.key, proc)))
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
        self.attach_job(env, nspace, buf)
    }

    fn register_job_info(
        &mut self,
        env: &GdsEnv,
        peer: &PeerInfo,
        out: &mut WireBuffer,
    ) -> Result<()> {
        self.pack_connection_info(env, peer, out)
    }

    fn store_modex(
        &mut self,
        env: &GdsEnv,
        nspace: &Nspace,
        buf: &mut WireBuffer,
        ctx: &mut ModexCtx,
    ) -> Result<()> {
        if env.is_server() {
            self.publish_modex(env, nspace, buf, ctx)
        } else {
            self.attach_modex(nspace, buf)
        }
    }

    fn setup_fork(
        &mut self,
        _env: &GdsEnv,
        proc: &ProcId,
        child_env: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        debug!("shmem setup_fork for {}", proc);
        child_env.insert(keys::GDS_MODULE_ENV.to_string(), Self::NAME.to_string());
        Ok(())
    }

    fn del_nspace(&mut self, _env: &GdsEnv, nspace: &Nspace) -> Result<()> {
        let Some(job) = self.jobs.remove(nspace) else {
            return Ok(());
        };
        for arena in job.arenas() {
            arena.log_stats();
        }
        if let Some(id) = job.session {
            self.release_session(id);
        }
        debug!("shmem deleted namespace {}", nspace);
        Ok(())
    }

    fn publish_job(&mut self, env: &GdsEnv, nspace: &Nspace, snapshot: &[KeyValue]) -> Result<()> {
        self.publish(env, nspace, snapshot).inspect_err(|e| {
            warn!("cannot publish {} in shared memory: {}", nspace, e);
        })
    }
}
