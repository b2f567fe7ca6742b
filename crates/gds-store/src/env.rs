//! Process environment shared by every module
//!
//! Holds who this process is, which host it runs on, the loaded
//! configuration and the key dictionary. One `GdsEnv` lives inside the
//! [`GdsContext`](crate::context::GdsContext) and is lent to modules on
//! every call.

use gds_common::{GdsConfig, KeyDictionary, PeerVersion, ProcId, Result};
use std::fmt;

/// Role of this process in the job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Local job server; owns published data
    Server,
    /// Application process
    Client,
    /// Tool attached to a running job
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Process-wide identity, configuration and key dictionary
#[derive(Debug)]
pub struct GdsEnv {
    pub myid: ProcId,
    pub hostname: String,
    pub role: Role,
    pub version: PeerVersion,
    pub config: GdsConfig,
    pub keys: KeyDictionary,
}

impl GdsEnv {
    /// Build the environment for this process using the OS hostname
    pub fn new(config: GdsConfig, myid: ProcId, role: Role) -> Result<Self> {
        let hostname = nix::unistd::gethostname()
            .map_err(std::io::Error::from)?
            .to_string_lossy()
            .into_owned();
        Ok(Self::with_hostname(config, myid, role, hostname))
    }

    /// Build the environment with an explicit hostname
    pub fn with_hostname(
        config: GdsConfig,
        myid: ProcId,
        role: Role,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            myid,
            hostname: hostname.into(),
            role,
            version: PeerVersion::CURRENT,
            config,
            keys: KeyDictionary::new(),
        }
    }

    #[must_use]
    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// Check whether `proc` names this very process
    #[must_use]
    pub fn is_me(&self, proc: &ProcId) -> bool {
        self.myid == *proc
    }

    /// Compression threshold of the hash backend
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.config.hash.compression_threshold
    }
}
