//! GDS Store - Job-level metadata storage backends
//!
//! This crate stores the key/value data a job's processes publish and read
//! during startup and wire-up:
//! - **hash**: per-process hash tables with scoped visibility, node, app
//!   and session records, and transparent compression of long strings
//! - **shmem**: the local server writes job data once into shared segments
//!   that every client maps read-only at the same address
//!
//! # Dispatch
//!
//! Each peer is assigned the highest-priority module both sides support
//! (shmem 20, hash 10, an explicit request 100). Requests a module cannot
//! serve fall back to the hash module.
//!
//! # Example
//!
//! ```
//! use gds_common::{GdsConfig, KeyValue, ProcId, Rank, Scope};
//! use gds_store::{GdsContext, GdsEnv, Role};
//!
//! let mut config = GdsConfig::default();
//! config.modules = vec!["hash".into()];
//! let env = GdsEnv::with_hostname(config, ProcId::new("ns1", Rank::new(0)), Role::Client, "n0");
//! let mut ctx = GdsContext::new(env).unwrap();
//!
//! let me = ProcId::new("ns1", Rank::new(0));
//! ctx.store(&me, Scope::Global, &KeyValue::new("user.ep", "tcp://10.0.0.1")).unwrap();
//! let got = ctx.fetch(&me, Scope::Undef, Some("user.ep"), &[]).unwrap();
//! assert_eq!(got.len(), 1);
//! ```

pub mod context;
pub mod env;
pub mod factory;
pub mod hash;
pub mod module;
pub mod progress;
pub mod shmem;

pub use context::GdsContext;
pub use env::{GdsEnv, Role};
pub use factory::{ModuleFactory, ModuleKind, Selection};
pub use hash::HashStore;
pub use module::{GdsModule, ModexCtx, ModuleCapabilities, PeerId, PeerInfo};
pub use progress::ProgressThread;
pub use shmem::ShmemStore;

/// Prelude for common imports
pub mod prelude {
    pub use super::{
        GdsContext, GdsEnv, GdsModule, ModexCtx, ModuleKind, PeerInfo, ProgressThread, Role,
    };
    pub use gds_common::{Error, Info, KeyValue, Nspace, ProcId, Rank, Result, Scope, Value};
}
