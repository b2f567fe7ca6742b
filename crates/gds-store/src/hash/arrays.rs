//! Info-array processors
//!
//! Node, app, session and proc-data arrays arrive nested inside job
//! registrations, job payloads and direct stores. Each processor creates
//! its record on first sight and merges into it afterwards, with the last
//! write winning per key.

use super::table::HashTable;
use super::tracker::{AppTracker, JobTracker, NodeInfo, Sessions, merge_node, node_from_items, set_kv};
use gds_common::keys;
use gds_common::{Error, KeyDictionary, KeyValue, Rank, Result, Value};
use tracing::{debug, error};

/// Merge one NODE_INFO_ARRAY value into a node list
pub fn process_node_array(value: &Value, nodes: &mut Vec<NodeInfo>) -> Result<()> {
    let items = value.as_info_array()?;
    let node = node_from_items(items)?;
    if node.nodeid.is_none() && node.hostname.is_none() {
        error!("node info array carries neither a node id nor a hostname");
        return Err(Error::bad_param("node info array without node id or hostname"));
    }
    debug!(
        "processing node array for {:?}/{:?}",
        node.hostname, node.nodeid
    );
    merge_node(nodes, node);
    Ok(())
}

/// Merge one APP_INFO_ARRAY value into the job's apps
///
/// Without an APPNUM the array describes app 0, which is only allowed
/// while the job has no apps yet.
pub fn process_app_array(value: &Value, trk: &mut JobTracker) -> Result<()> {
    let items = value.as_info_array()?;
    let mut appnum = None;
    let mut info = Vec::new();
    let mut nodes = Vec::new();

    for item in items {
        match item.key.as_str() {
            keys::APPNUM => {
                if appnum.is_some() {
                    error!("app info array carries more than one appnum");
                    return Err(Error::bad_param("duplicate appnum in app info array"));
                }
                appnum = Some(item.value.as_u32()?);
            }
            keys::NODE_INFO_ARRAY => process_node_array(&item.value, &mut nodes)?,
            _ => info.push(KeyValue::from(item.clone())),
        }
    }

    let appnum = match appnum {
        Some(n) => n,
        None if trk.apps.is_empty() => 0,
        None => {
            error!("app info array without appnum for job {} with apps", trk.nspace);
            return Err(Error::bad_param("app info array without appnum"));
        }
    };
    debug!("processing app array {} for {}", appnum, trk.nspace);

    if trk.app(appnum).is_none() {
        trk.apps.push(AppTracker::new(appnum));
    }
    let Some(app) = trk.app_mut(appnum) else {
        return Err(Error::internal("app tracker vanished"));
    };
    for kv in info {
        set_kv(&mut app.info, kv);
    }
    for node in nodes {
        merge_node(&mut app.nodes, node);
    }
    Ok(())
}

/// Point a job at a session, moving its reference if it changed
pub fn attach_session(trk: &mut JobTracker, sessions: &mut Sessions, id: u32) {
    if trk.session == Some(id) {
        return;
    }
    if let Some(old) = trk.session.take() {
        sessions.release(old);
    }
    sessions.retain(id);
    trk.session = Some(id);
}

/// Merge one SESSION_INFO_ARRAY value into the shared session registry
pub fn process_session_array(
    value: &Value,
    trk: &mut JobTracker,
    sessions: &mut Sessions,
) -> Result<()> {
    let items = value.as_info_array()?;
    let id = items
        .iter()
        .find(|i| i.check_key(keys::SESSION_ID))
        .ok_or_else(|| {
            error!("session info array without session id");
            Error::bad_param("session info array without session id")
        })?
        .value
        .as_u32()?;

    attach_session(trk, sessions, id);
    let Some(session) = sessions.get_mut(id) else {
        return Err(Error::internal(format!("session {id} vanished")));
    };
    for item in items {
        match item.key.as_str() {
            keys::SESSION_ID => {}
            keys::NODE_INFO_ARRAY => process_node_array(&item.value, &mut session.nodes)?,
            _ => set_kv(&mut session.info, KeyValue::from(item.clone())),
        }
    }
    Ok(())
}

/// Store a PROC_DATA array into `table`, returning the rank it described
///
/// The first element must be the RANK with a rank value.
pub fn store_proc_data(
    dict: &KeyDictionary,
    table: &mut HashTable,
    value: &Value,
    threshold: usize,
) -> Result<Rank> {
    let items = value.as_info_array()?;
    let rank = match items.first() {
        Some(first) if first.check_key(keys::RANK) => match &first.value {
            Value::Rank(r) => *r,
            other => {
                error!("proc data rank has type {}", other.data_type());
                return Err(Error::type_mismatch(format!(
                    "proc data rank must be a rank, got {}",
                    other.data_type()
                )));
            }
        },
        _ => {
            error!("proc data array does not start with the rank");
            return Err(Error::type_mismatch("proc data array must start with the rank"));
        }
    };
    for item in &items[1..] {
        table.store(dict, rank, &KeyValue::from(item.clone()), threshold)?;
    }
    Ok(rank)
}
