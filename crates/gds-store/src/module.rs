//! Storage module contract
//!
//! Every backend implements [`GdsModule`]. Calls are made from the single
//! progress thread, so implementations take `&mut self` and hold no locks.
//!
//! ```text
//!              GdsContext
//!                  |
//!      +-----------+-----------+
//!      |                       |
//!  HashStore (10)        ShmemStore (20)
//!  per-process tables    shared segments
//! ```

use crate::env::GdsEnv;
use gds_common::codec::pack_modex_kval;
use gds_common::keys;
use gds_common::{
    Info, KeyValue, ModexKeyFormat, Nspace, PeerVersion, ProcId, Result, Scope, WireBuffer,
};
use std::collections::BTreeMap;

/// Priority granted to a module the caller asked for by name
pub const REQUESTED_PRIORITY: u32 = 100;

/// Identifier of a connected peer
pub type PeerId = u32;

/// Connected peer as seen by the modules
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: PeerId,
    pub proc: ProcId,
    pub version: PeerVersion,
}

impl PeerInfo {
    #[must_use]
    pub fn new(id: PeerId, proc: ProcId) -> Self {
        Self {
            id,
            proc,
            version: PeerVersion::CURRENT,
        }
    }
}

/// What a module can do
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModuleCapabilities {
    /// Readers access data in place without IPC
    pub zero_copy: bool,
    /// Server-side job registration is handled by this module
    pub caches_job_info: bool,
    /// Direct stores of individual key/values are handled by this module
    pub direct_store: bool,
}

/// Per-exchange state of a modex operation
#[derive(Debug, Default)]
pub struct ModexCtx {
    /// Key encoding used inside the per-proc blobs
    pub key_format: ModexKeyFormat,
    /// Key map for [`ModexKeyFormat::Compact`]
    pub kmap: Vec<String>,
    /// Data the server relays to its local clients
    pub reply: WireBuffer,
}

impl ModexCtx {
    #[must_use]
    pub fn new(key_format: ModexKeyFormat) -> Self {
        Self {
            key_format,
            ..Self::default()
        }
    }
}

/// Append one proc's modex contribution to `buf`
///
/// The blob layout is the proc id followed by a byte object holding the
/// key/values in the context's key format.
pub fn pack_modex_blob(
    buf: &mut WireBuffer,
    proc: &ProcId,
    kvs: &[KeyValue],
    ctx: &mut ModexCtx,
) -> Result<()> {
    let mut blob = WireBuffer::new();
    for kv in kvs {
        pack_modex_kval(&mut blob, ctx.key_format, &mut ctx.kmap, kv)?;
    }
    buf.pack(proc)?;
    buf.pack(&blob.unread().to_vec())
}

/// Modules named by a `GDS_MODULE` directive, if any
#[must_use]
pub fn requested_modules(directives: &[Info]) -> Option<Vec<String>> {
    directives
        .iter()
        .find(|info| info.check_key(keys::GDS_MODULE))
        .and_then(|info| info.value.as_str())
        .map(|list| {
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
}

/// Priority of module `name` under the given directives
///
/// An explicit request wins outright; a request naming only other modules
/// excludes this one.
#[must_use]
pub fn directive_priority(directives: &[Info], name: &str, default: u32) -> Option<u32> {
    match requested_modules(directives) {
        Some(list) if list.iter().any(|m| m == name) => Some(REQUESTED_PRIORITY),
        Some(_) => None,
        None => Some(default),
    }
}

/// Storage backend contract
pub trait GdsModule: Send {
    /// Module name as used in directives
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> ModuleCapabilities;

    /// Prepare the module; called once before any other operation
    fn init(&mut self, env: &GdsEnv) -> Result<()>;

    /// Release everything the module holds
    fn finalize(&mut self, env: &GdsEnv);

    /// Priority for a peer presenting `directives`; `None` when ineligible
    fn assign_module(&self, env: &GdsEnv, directives: &[Info]) -> Option<u32>;

    /// Server-side registration of a namespace's job-level information
    fn cache_job_info(&mut self, env: &GdsEnv, nspace: &Nspace, info: &[Info]) -> Result<()>;

    /// Store one key/value for a proc under a scope
    fn store(&mut self, env: &GdsEnv, proc: &ProcId, scope: Scope, kv: &KeyValue) -> Result<()>;

    /// Fetch a key (all keys when `None`) for a proc, appending to `out`
    fn fetch(
        &self,
        env: &GdsEnv,
        proc: &ProcId,
        scope: Scope,
        key: Option<&str>,
        qualifiers: &[Info],
        out: &mut Vec<KeyValue>,
    ) -> Result<()>;

    /// Client-side ingest of the job payload sent by the server
    fn store_job_info(&mut self, env: &GdsEnv, nspace: &Nspace, buf: &mut WireBuffer)
    -> Result<()>;

    /// Server-side packing of the job payload for a newly connected peer
    fn register_job_info(
        &mut self,
        env: &GdsEnv,
        peer: &PeerInfo,
        out: &mut WireBuffer,
    ) -> Result<()>;

    /// Ingest the result of a modex exchange
    fn store_modex(
        &mut self,
        env: &GdsEnv,
        nspace: &Nspace,
        buf: &mut WireBuffer,
        ctx: &mut ModexCtx,
    ) -> Result<()>;

    /// Add whatever a forked child needs to find this module
    fn setup_fork(
        &mut self,
        env: &GdsEnv,
        proc: &ProcId,
        child_env: &mut BTreeMap<String, String>,
    ) -> Result<()>;

    /// Drop all data of a namespace
    fn del_nspace(&mut self, env: &GdsEnv, nspace: &Nspace) -> Result<()>;

    /// Publish a job snapshot taken from another module
    ///
    /// Modules that serve readers out of their own storage use this to
    /// mirror the job data the server registered elsewhere.
    fn publish_job(&mut self, _env: &GdsEnv, nspace: &Nspace, _snapshot: &[KeyValue]) -> Result<()> {
        Err(gds_common::Error::not_supported(format!(
            "{}: publishing job {nspace}",
            self.name()
        )))
    }
}
