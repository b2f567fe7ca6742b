//! Node and proc map handling
//!
//! A job registration may describe its layout as two parallel lists: the
//! node names, and for each node the ranks placed on it. [`store_map`]
//! expands them into per-node and per-rank facts.
//!
//! ```text
//!   nodes: "n0,n1"
//!   procs: "0,1;2,3"
//!          ^^^ ^^^
//!          n0  n1
//! ```

use super::tracker::{JobTracker, node_by_name_mut};
use crate::env::GdsEnv;
use gds_common::keys;
use gds_common::{Error, KeyValue, Rank, Result, Value};
use tracing::{debug, error};

/// Decodes node and proc maps into per-node lists
pub trait MapParser: Send {
    /// Node names in placement order
    fn parse_nodes(&self, map: &Value) -> Result<Vec<String>>;

    /// One comma-separated rank list per node
    fn parse_procs(&self, map: &Value) -> Result<Vec<String>>;
}

/// Parser for plain-text maps
///
/// Nodes are separated by commas; per-node rank lists by semicolons.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeMapParser;

impl NativeMapParser {
    fn text(map: &Value) -> Result<&str> {
        match map {
            Value::String(s) => Ok(s),
            Value::Regex(b) | Value::Bytes(b) => std::str::from_utf8(b)
                .map(|s| s.trim_end_matches('\0'))
                .map_err(|_| Error::bad_param("map is not valid text")),
            other => Err(Error::type_mismatch(format!(
                "map must be a string or regex, got {}",
                other.data_type()
            ))),
        }
    }
}

impl MapParser for NativeMapParser {
    fn parse_nodes(&self, map: &Value) -> Result<Vec<String>> {
        Ok(Self::text(map)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect())
    }

    fn parse_procs(&self, map: &Value) -> Result<Vec<String>> {
        Ok(Self::text(map)?
            .split(';')
            .map(|s| s.trim().to_string())
            .collect())
    }
}

/// Expand a comma-separated rank list; `a-b` ranges are inclusive
pub fn parse_ranks(list: &str) -> Result<Vec<u32>> {
    let mut ranks = Vec::new();
    for part in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parse = |s: &str| {
            s.trim()
                .parse::<u32>()
                .map_err(|_| Error::bad_param(format!("invalid rank {s:?} in {list:?}")))
        };
        if let Some((lo, hi)) = part.split_once('-') {
            let (lo, hi) = (parse(lo)?, parse(hi)?);
            if lo > hi {
                return Err(Error::bad_param(format!("empty rank range {part}")));
            }
            ranks.extend(lo..=hi);
        } else {
            ranks.push(parse(part)?);
        }
    }
    Ok(ranks)
}

/// Which job-level facts were provided separately and must not be derived
#[derive(Clone, Copy, Debug, Default)]
pub struct MapFlags {
    pub job_size: bool,
    pub num_nodes: bool,
    pub max_procs: bool,
}

/// Rebuild per-node and per-rank facts from parsed maps
pub fn store_map(
    env: &GdsEnv,
    trk: &mut JobTracker,
    nodes: &[String],
    procs: &[String],
    flags: MapFlags,
) -> Result<()> {
    if nodes.len() != procs.len() {
        error!(
            "node map has {} entries but proc map has {}",
            nodes.len(),
            procs.len()
        );
        return Err(Error::bad_param("node and proc maps differ in length"));
    }
    let dict = &env.keys;
    let threshold = env.threshold();
    let count = |n: usize| {
        u32::try_from(n).map_err(|_| Error::bad_param("map too large"))
    };

    if !flags.num_nodes {
        trk.internal.store(
            dict,
            Rank::WILDCARD,
            &KeyValue::new(keys::NUM_NODES, count(nodes.len())?),
            threshold,
        )?;
    }

    let mut total = 0u32;
    for (n, (host, plist)) in nodes.iter().zip(procs).enumerate() {
        let nodeid = count(n)?;
        let ranks = parse_ranks(plist)?;
        let Some(&leader) = ranks.first() else {
            return Err(Error::bad_param(format!("no ranks on node {host}")));
        };
        let local_size = count(ranks.len())?;

        let node = node_by_name_mut(&mut trk.nodes, host);
        if node.nodeid.is_none() {
            node.nodeid = Some(nodeid);
        }
        node.set(KeyValue::new(keys::LOCAL_PEERS, plist.as_str()));
        node.set(KeyValue::new(keys::LOCALLDR, Rank::new(leader)));
        node.set(KeyValue::new(keys::LOCAL_SIZE, local_size));

        if *host == env.hostname {
            for kv in [
                KeyValue::new(keys::LOCAL_PEERS, plist.as_str()),
                KeyValue::new(keys::LOCALLDR, Rank::new(leader)),
                KeyValue::new(keys::LOCAL_SIZE, local_size),
            ] {
                trk.internal.store(dict, Rank::WILDCARD, &kv, threshold)?;
            }
            if trk.nlocalprocs == 0 {
                trk.nlocalprocs = local_size;
            }
        }

        for (m, &r) in ranks.iter().enumerate() {
            let local_rank = u16::try_from(m).map_err(|_| Error::bad_param("too many local ranks"))?;
            let rank = Rank::new(r);
            for kv in [
                KeyValue::new(keys::HOSTNAME, host.as_str()),
                KeyValue::new(keys::NODEID, nodeid),
                KeyValue::new(keys::LOCAL_RANK, Value::Uint16(local_rank)),
                KeyValue::new(keys::NODE_RANK, Value::Uint16(local_rank)),
            ] {
                trk.internal.store(dict, rank, &kv, threshold)?;
            }
            total += 1;
        }
    }
    debug!("stored map for {}: {} nodes, {} procs", trk.nspace, nodes.len(), total);

    if !flags.job_size {
        trk.internal.store(
            dict,
            Rank::WILDCARD,
            &KeyValue::new(keys::JOB_SIZE, total),
            threshold,
        )?;
        if trk.nprocs == 0 {
            trk.nprocs = total;
        }
    }
    if !flags.max_procs {
        trk.internal.store(
            dict,
            Rank::WILDCARD,
            &KeyValue::new(keys::MAX_PROCS, total),
            threshold,
        )?;
    }
    trk.internal.store(
        dict,
        Rank::WILDCARD,
        &KeyValue::new(keys::NODE_LIST, nodes.join(",")),
        threshold,
    )
}
