//! Module factory and selection
//!
//! Builds the storage modules available in this process and picks one per
//! peer by priority.

use crate::env::GdsEnv;
use crate::hash::HashStore;
use crate::module::GdsModule;
use crate::shmem::{ShmemStore, vmhole};
use gds_common::{Error, GdsConfig, Info, Result};
use tracing::debug;

/// Storage module selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
    /// Per-process hash tables
    Hash,
    /// Shared-memory segments
    Shmem,
}

impl ModuleKind {
    pub const ALL: [Self; 2] = [Self::Hash, Self::Shmem];

    /// Get the module name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Hash => HashStore::NAME,
            Self::Shmem => ShmemStore::NAME,
        }
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ModuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "shmem" | "shmem2" | "ds21" => Ok(Self::Shmem),
            other => Err(Error::Configuration(format!("unknown gds module: {other}"))),
        }
    }
}

/// Winner of a selection round
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    pub kind: ModuleKind,
    pub priority: u32,
}

/// Factory for storage modules
pub struct ModuleFactory;

impl ModuleFactory {
    /// Create an uninitialized module
    #[must_use]
    pub fn create(kind: ModuleKind) -> Box<dyn GdsModule> {
        match kind {
            ModuleKind::Hash => Box::new(HashStore::new()),
            ModuleKind::Shmem => Box::new(ShmemStore::new()),
        }
    }

    /// Modules that can run in this process
    #[must_use]
    pub fn available_modules(config: &GdsConfig) -> Vec<ModuleKind> {
        ModuleKind::ALL
            .into_iter()
            .filter(|kind| match kind {
                ModuleKind::Hash => true,
                ModuleKind::Shmem => config.shmem.enabled && vmhole::available(),
            })
            .collect()
    }

    /// Pick the highest-priority module among `modules` for `directives`
    ///
    /// Ties go to the module listed first.
    pub fn select<'a>(
        env: &GdsEnv,
        modules: impl IntoIterator<Item = (ModuleKind, &'a dyn GdsModule)>,
        directives: &[Info],
    ) -> Result<Selection> {
        let mut best: Option<Selection> = None;
        for (kind, module) in modules {
            let Some(priority) = module.assign_module(env, directives) else {
                debug!("module {} declined", kind);
                continue;
            };
            if best.is_none_or(|b| priority > b.priority) {
                best = Some(Selection { kind, priority });
            }
        }
        best.ok_or_else(|| Error::not_supported("no gds module accepts these directives"))
    }
}
