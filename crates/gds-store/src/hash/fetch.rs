//! Fetch paths of the hash backend
//!
//! Lookups are resolved in this order:
//!
//! 1. WILDCARD rank with no key dumps the whole job
//! 2. a SESSION_INFO qualifier answers from the session
//! 3. node or app level requests with a marker rank answer from the node
//!    and app records (WILDCARD falls back to the tables on a miss)
//! 4. the scope picks the tables; UNDEF and GLOBAL cascade
//!    internal -> local -> remote

use super::HashStore;
use super::table::HashTable;
use super::tracker::{JobTracker, NodeInfo, find_node_by_id, find_node_by_name};
use crate::env::GdsEnv;
use gds_common::keys;
use gds_common::{Error, Info, KeyValue, ProcId, Rank, Result, Scope};
use tracing::trace;

#[derive(Default)]
struct Directives {
    session: bool,
    node: bool,
    app: bool,
}

impl Directives {
    fn scan(qualifiers: &[Info]) -> Self {
        let mut d = Self::default();
        for q in qualifiers {
            match q.key.as_str() {
                keys::SESSION_INFO => d.session = q.value.is_true(),
                keys::NODE_INFO => d.node = q.value.is_true(),
                keys::APP_INFO => d.app = q.value.is_true(),
                _ => {}
            }
        }
        d
    }
}

impl HashStore {
    pub(super) fn fetch_data(
        &self,
        env: &GdsEnv,
        proc: &ProcId,
        scope: Scope,
        key: Option<&str>,
        qualifiers: &[Info],
        out: &mut Vec<KeyValue>,
    ) -> Result<()> {
        trace!("hash fetch {} scope {} key {:?}", proc, scope, key);
        let trk = self
            .jobs
            .get(&proc.nspace)
            .ok_or_else(|| Error::InvalidNamespace(proc.nspace.to_string()))?;

        if proc.rank.is_wildcard() && key.is_none() {
            return dump_job(env, trk, out);
        }

        let directives = Directives::scan(qualifiers);
        if directives.session {
            return self.fetch_session_info(env, trk, key, qualifiers, out);
        }

        if !proc.rank.is_valid() {
            let res = if directives.node || key.is_some_and(keys::is_node_level) {
                Some(fetch_node_info(env, &trk.nodes, key, qualifiers, out))
            } else if directives.app || key.is_some_and(keys::is_app_level) {
                Some(fetch_app_info(env, trk, key, qualifiers, out))
            } else {
                None
            };
            match res {
                Some(Ok(())) => return Ok(()),
                // older peers deliver node and app facts as plain job data
                Some(Err(e)) if proc.rank.is_wildcard() && e.is_not_found() => {}
                Some(Err(e)) => return Err(e),
                None => {}
            }
        }

        fetch_tables(env, trk, proc.rank, scope, key, out)
    }

    fn fetch_session_info(
        &self,
        env: &GdsEnv,
        trk: &JobTracker,
        key: Option<&str>,
        qualifiers: &[Info],
        out: &mut Vec<KeyValue>,
    ) -> Result<()> {
        let id = match qualifiers.iter().find(|q| q.check_key(keys::SESSION_ID)) {
            Some(q) => q.value.as_u32()?,
            None => trk
                .session
                .ok_or_else(|| Error::not_found(format!("no session for {}", trk.nspace)))?,
        };
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| Error::not_found(format!("session {id}")))?;

        let Some(k) = key else {
            out.push(KeyValue::new(keys::SESSION_INFO_ARRAY, session.to_info_array()));
            return Ok(());
        };
        let node_qualified = qualifiers
            .iter()
            .any(|q| q.check_key(keys::NODEID) || q.check_key(keys::HOSTNAME));
        if node_qualified || keys::is_node_level(k) {
            match fetch_node_info(env, &session.nodes, key, qualifiers, out) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        let kv = session
            .info
            .iter()
            .find(|kv| kv.check_key(k))
            .ok_or_else(|| Error::not_found(format!("{k} in session {id}")))?;
        out.push(kv.clone());
        Ok(())
    }
}

/// Answer from a node list
///
/// NODEID or HOSTNAME qualifiers pick the node; without them this host is
/// used, and a missing node is reported as [`Error::DataValueNotFound`] so
/// the caller can try elsewhere.
pub(crate) fn fetch_node_info(
    env: &GdsEnv,
    nodes: &[NodeInfo],
    key: Option<&str>,
    qualifiers: &[Info],
    out: &mut Vec<KeyValue>,
) -> Result<()> {
    let mut nodeid = None;
    let mut hostname = None;
    for q in qualifiers {
        match q.key.as_str() {
            keys::NODEID => nodeid = Some(q.value.as_u32()?),
            keys::HOSTNAME => hostname = q.value.as_str(),
            _ => {}
        }
    }
    let qualified = nodeid.is_some() || hostname.is_some();

    if !qualified && key.is_none() {
        if nodes.is_empty() {
            return Err(Error::DataValueNotFound);
        }
        out.extend(
            nodes
                .iter()
                .map(|n| KeyValue::new(keys::NODE_INFO_ARRAY, n.to_info_array())),
        );
        return Ok(());
    }

    let node = match nodeid {
        Some(id) => find_node_by_id(nodes, id),
        None => find_node_by_name(nodes, hostname.unwrap_or(&env.hostname)),
    };
    let Some(node) = node else {
        return Err(if qualified {
            Error::not_found("node")
        } else {
            Error::DataValueNotFound
        });
    };

    match key {
        None => out.push(KeyValue::new(keys::NODE_INFO_ARRAY, node.to_info_array())),
        Some(keys::HOSTNAME) if node.hostname.is_some() => {
            out.push(KeyValue::new(keys::HOSTNAME, node.hostname.clone().unwrap_or_default()));
        }
        Some(keys::NODEID) if node.nodeid.is_some() => {
            out.push(KeyValue::new(keys::NODEID, node.nodeid.unwrap_or_default()));
        }
        Some(k) => {
            let kv = node
                .get(k)
                .ok_or_else(|| Error::not_found(format!("{k} on node")))?;
            out.push(kv.clone());
        }
    }
    Ok(())
}

/// The app this process belongs to when the job is its own
fn my_appnum(env: &GdsEnv, trk: &JobTracker) -> u32 {
    if env.myid.nspace != trk.nspace {
        return 0;
    }
    let mut tmp = Vec::new();
    trk.internal
        .fetch(&env.keys, env.myid.rank, Some(keys::APPNUM), &mut tmp)
        .ok()
        .and_then(|()| tmp.first().and_then(|kv| kv.value.as_u32().ok()))
        .unwrap_or(0)
}

fn fetch_app_info(
    env: &GdsEnv,
    trk: &JobTracker,
    key: Option<&str>,
    qualifiers: &[Info],
    out: &mut Vec<KeyValue>,
) -> Result<()> {
    let requested = match qualifiers.iter().find(|q| q.check_key(keys::APPNUM)) {
        Some(q) => Some(q.value.as_u32()?),
        None => None,
    };
    let appnum = requested.unwrap_or_else(|| my_appnum(env, trk));
    let Some(app) = trk.app(appnum) else {
        return Err(if requested.is_some() {
            Error::not_found(format!("app {appnum}"))
        } else {
            Error::DataValueNotFound
        });
    };

    let Some(k) = key else {
        out.push(KeyValue::new(keys::APP_INFO_ARRAY, app.to_info_array()));
        return Ok(());
    };
    if keys::is_node_level(k) {
        match fetch_node_info(env, &app.nodes, key, qualifiers, out) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    let kv = app
        .info
        .iter()
        .find(|kv| kv.check_key(k))
        .ok_or_else(|| Error::not_found(format!("{k} in app {appnum}")))?;
    out.push(kv.clone());
    Ok(())
}

/// Full job snapshot for a WILDCARD fetch without a key
fn dump_job(env: &GdsEnv, trk: &JobTracker, out: &mut Vec<KeyValue>) -> Result<()> {
    match trk.internal.fetch(&env.keys, Rank::WILDCARD, None, out) {
        Err(e) if !e.is_not_found() => return Err(e),
        _ => {}
    }
    out.extend(
        trk.nodes
            .iter()
            .map(|n| KeyValue::new(keys::NODE_INFO_ARRAY, n.to_info_array())),
    );
    out.extend(
        trk.apps
            .iter()
            .map(|a| KeyValue::new(keys::APP_INFO_ARRAY, a.to_info_array())),
    );
    for r in 0..trk.nprocs {
        let rank = Rank::new(r);
        let mut data = Vec::new();
        match trk.internal.fetch(&env.keys, rank, None, &mut data) {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        let mut items = Vec::with_capacity(data.len() + 1);
        items.push(Info::new(keys::RANK, rank));
        items.extend(data.into_iter().map(Info::from));
        out.push(KeyValue::new(keys::PROC_DATA, items));
    }
    Ok(())
}

/// Scan every rank of a table, then the job-level data
fn fetch_undef_rank(
    env: &GdsEnv,
    trk: &JobTracker,
    table: &HashTable,
    key: Option<&str>,
    out: &mut Vec<KeyValue>,
) -> Result<()> {
    let before = out.len();
    match table.fetch(&env.keys, Rank::UNDEF, key, out) {
        Ok(()) if key.is_some() => return Ok(()),
        Err(e) if !e.is_not_found() => return Err(e),
        _ => {}
    }
    if key.is_none() {
        match trk.internal.fetch(&env.keys, Rank::WILDCARD, None, out) {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
    }
    if out.len() > before {
        Ok(())
    } else {
        Err(Error::not_found(format!("{} in {}", key.unwrap_or("data"), table.label())))
    }
}

/// Table lookup with scope cascade and the exists-outside-scope check
fn fetch_tables(
    env: &GdsEnv,
    trk: &JobTracker,
    rank: Rank,
    scope: Scope,
    key: Option<&str>,
    out: &mut Vec<KeyValue>,
) -> Result<()> {
    let order: Vec<&HashTable> = match scope {
        _ if rank.is_wildcard() && !matches!(scope, Scope::Undef | Scope::Global) => {
            vec![&trk.internal]
        }
        Scope::Internal => vec![&trk.internal],
        Scope::Local => vec![&trk.local],
        Scope::Remote => vec![&trk.remote],
        Scope::Undef | Scope::Global => vec![&trk.internal, &trk.local, &trk.remote],
    };

    let mut found = false;
    for table in order {
        let mut got = Vec::new();
        let res = if rank.is_undef() {
            fetch_undef_rank(env, trk, table, key, &mut got)
        } else {
            table.fetch(&env.keys, rank, key, &mut got)
        };
        match res {
            Ok(()) => {
                found = true;
                // GLOBAL without a key keeps collecting; earlier tables win
                let union = scope == Scope::Global && key.is_none();
                for kv in got {
                    if !union || !out.iter().any(|o| o.key == kv.key) {
                        out.push(kv);
                    }
                }
                if !union {
                    return Ok(());
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    if found {
        return Ok(());
    }

    if rank.is_valid() {
        let other = match scope {
            Scope::Local => Some(&trk.remote),
            Scope::Remote => Some(&trk.local),
            _ => None,
        };
        let elsewhere = other.is_some_and(|t| match key {
            Some(k) => t.contains(&env.keys, rank, k),
            None => t.fetch(&env.keys, rank, None, &mut Vec::new()).is_ok(),
        });
        if elsewhere {
            return Err(Error::ExistsOutsideScope {
                key: key.unwrap_or("data").to_string(),
                scope: scope.to_string(),
            });
        }
    }
    Err(Error::not_found(format!(
        "{} for {}:{}",
        key.unwrap_or("data"),
        trk.nspace,
        rank
    )))
}
