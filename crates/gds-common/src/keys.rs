//! Well-known attribute names
//!
//! Keys starting with `pmix` are reserved; they are registered in the key
//! dictionary in a fixed order so every process assigns them the same id.

pub const JOBID: &str = "pmix.jobid";
pub const NSPACE: &str = "pmix.nspace";
pub const RANK: &str = "pmix.rank";
pub const PROCID: &str = "pmix.procid";
pub const APPNUM: &str = "pmix.appnum";

// Job-level sizing
pub const JOB_SIZE: &str = "pmix.job.size";
pub const UNIV_SIZE: &str = "pmix.univ.size";
pub const MAX_PROCS: &str = "pmix.max.size";
pub const NUM_NODES: &str = "pmix.num.nodes";
pub const NPROC_OFFSET: &str = "pmix.offset";

// Maps and bulk blobs
pub const NODE_MAP: &str = "pmix.nmap";
pub const PROC_MAP: &str = "pmix.pmap";
pub const NODE_LIST: &str = "pmix.nlist";
pub const PROC_DATA: &str = "pmix.pdata";
pub const PROC_BLOB: &str = "pmix.pblob";
pub const MAP_BLOB: &str = "pmix.mblob";

// Structural arrays
pub const NODE_INFO_ARRAY: &str = "pmix.node.arr";
pub const APP_INFO_ARRAY: &str = "pmix.app.arr";
pub const SESSION_INFO_ARRAY: &str = "pmix.ssn.arr";
pub const JOB_INFO_ARRAY: &str = "pmix.job.arr";

// Fetch directives
pub const SESSION_ID: &str = "pmix.session.id";
pub const SESSION_INFO: &str = "pmix.ssn.info";
pub const NODE_INFO: &str = "pmix.node.info";
pub const APP_INFO: &str = "pmix.app.info";
pub const QUALIFIED_VALUE: &str = "pmix.qual.val";

// Node-level
pub const NODEID: &str = "pmix.nodeid";
pub const HOSTNAME: &str = "pmix.hname";
pub const HOSTNAME_ALIASES: &str = "pmix.alias";
pub const LOCAL_PEERS: &str = "pmix.lpeers";
pub const LOCALLDR: &str = "pmix.lldr";
pub const LOCAL_SIZE: &str = "pmix.local.size";
pub const LOCAL_PROCS: &str = "pmix.lprocs";
pub const LOCAL_CPUSETS: &str = "pmix.lcpus";
pub const NODE_SIZE: &str = "pmix.node.size";
pub const NODE_OVERSUBSCRIBED: &str = "pmix.ndosub";
pub const AVAIL_PHYS_MEMORY: &str = "pmix.pmem";

// Proc-level
pub const LOCAL_RANK: &str = "pmix.lrank";
pub const NODE_RANK: &str = "pmix.nrank";

// App-level
pub const APP_SIZE: &str = "pmix.app.size";
pub const APPLDR: &str = "pmix.aldr";
pub const APP_ARGV: &str = "pmix.app.argv";
pub const APP_MAP_TYPE: &str = "pmix.apmap.type";
pub const APP_MAP_REGEX: &str = "pmix.apmap.regex";
pub const WDIR: &str = "pmix.wdir";

// Runtime directives
pub const GDS_MODULE: &str = "pmix.gds.mod";
pub const TMPDIR: &str = "pmix.tmpdir";
pub const NSDIR: &str = "pmix.nsdir";

/// Carries a packed shared-memory connection record
pub const SHMEM_CONNECTION_INFO: &str = "pmix.gds.shmem.cinfo";

/// Environment variable that pins a forked child to its parent's module
pub const GDS_MODULE_ENV: &str = "PMIX_GDS_MODULE";

/// Reserved keys in dictionary registration order
pub const RESERVED: &[&str] = &[
    JOBID,
    NSPACE,
    RANK,
    PROCID,
    APPNUM,
    JOB_SIZE,
    UNIV_SIZE,
    MAX_PROCS,
    NUM_NODES,
    NPROC_OFFSET,
    NODE_MAP,
    PROC_MAP,
    NODE_LIST,
    PROC_DATA,
    PROC_BLOB,
    MAP_BLOB,
    NODE_INFO_ARRAY,
    APP_INFO_ARRAY,
    SESSION_INFO_ARRAY,
    JOB_INFO_ARRAY,
    SESSION_ID,
    SESSION_INFO,
    NODE_INFO,
    APP_INFO,
    QUALIFIED_VALUE,
    NODEID,
    HOSTNAME,
    HOSTNAME_ALIASES,
    LOCAL_PEERS,
    LOCALLDR,
    LOCAL_SIZE,
    LOCAL_PROCS,
    LOCAL_CPUSETS,
    NODE_SIZE,
    NODE_OVERSUBSCRIBED,
    AVAIL_PHYS_MEMORY,
    LOCAL_RANK,
    NODE_RANK,
    APP_SIZE,
    APPLDR,
    APP_ARGV,
    APP_MAP_TYPE,
    APP_MAP_REGEX,
    WDIR,
    GDS_MODULE,
    TMPDIR,
    NSDIR,
    SHMEM_CONNECTION_INFO,
];

const NODE_LEVEL: &[&str] = &[
    LOCAL_PEERS,
    LOCALLDR,
    LOCAL_SIZE,
    LOCAL_PROCS,
    LOCAL_CPUSETS,
    NODE_SIZE,
    NODE_OVERSUBSCRIBED,
    AVAIL_PHYS_MEMORY,
    HOSTNAME_ALIASES,
];

const APP_LEVEL: &[&str] = &[APP_SIZE, APPLDR, APP_ARGV, APP_MAP_TYPE, APP_MAP_REGEX, WDIR];

/// Check whether a key is in the reserved namespace
#[must_use]
pub fn is_reserved(key: &str) -> bool {
    key.starts_with("pmix")
}

/// Check whether a key describes a node rather than a job or process
#[must_use]
pub fn is_node_level(key: &str) -> bool {
    NODE_LEVEL.contains(&key)
}

/// Check whether a key describes an application within a job
#[must_use]
pub fn is_app_level(key: &str) -> bool {
    APP_LEVEL.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_reserved_keys_unique() {
        let set: HashSet<_> = RESERVED.iter().collect();
        assert_eq!(set.len(), RESERVED.len());
        assert!(RESERVED.iter().all(|k| is_reserved(k)));
    }

    #[test]
    fn test_key_levels() {
        assert!(is_node_level(LOCAL_PEERS));
        assert!(!is_node_level(JOB_SIZE));
        assert!(is_app_level(APP_SIZE));
        assert!(!is_app_level(HOSTNAME));
        assert!(!is_reserved("user.endpoint"));
    }
}
