//! Fetch paths of the shared-memory backend
//!
//! Lookups read the job segment first (job dump, session, node and app
//! records, then the job table) and fall through to the modex table.

use super::{Arena, ShmemStore};
use super::job::{JobView, modex_table, read_session};
use crate::env::GdsEnv;
use crate::hash::fetch::fetch_node_info;
use gds_common::keys;
use gds_common::{Error, Info, KeyValue, ProcId, Rank, Result, Scope, Value};
use tracing::trace;

fn wants(qualifiers: &[Info], key: &str) -> bool {
    qualifiers
        .iter()
        .any(|q| q.check_key(key) && q.value.is_true())
}

impl ShmemStore {
    pub(super) fn fetch_data(
        &self,
        env: &GdsEnv,
        proc: &ProcId,
        scope: Scope,
        key: Option<&str>,
        qualifiers: &[Info],
        out: &mut Vec<KeyValue>,
    ) -> Result<()> {
        trace!("shmem fetch {} scope {} key {:?}", proc, scope, key);
        let job = self
            .jobs
            .get(&proc.nspace)
            .ok_or_else(|| Error::InvalidNamespace(proc.nspace.to_string()))?;

        if wants(qualifiers, keys::SESSION_INFO) {
            return self.fetch_session(env, job.session, key, qualifiers, out);
        }

        if let Some(arena) = &job.job {
            let view = JobView::new(arena)?;
            if proc.rank.is_wildcard() && key.is_none() {
                return dump_job(env, arena, &view, out);
            }
            if !proc.rank.is_valid() {
                let res = if wants(qualifiers, keys::NODE_INFO) || key.is_some_and(keys::is_node_level) {
                    Some(fetch_node_info(env, &view.nodes()?, key, qualifiers, out))
                } else if wants(qualifiers, keys::APP_INFO) || key.is_some_and(keys::is_app_level) {
                    Some(fetch_app(env, arena, &view, proc, key, qualifiers, out))
                } else {
                    None
                };
                match res {
                    Some(Ok(())) => return Ok(()),
                    Some(Err(e)) if proc.rank.is_wildcard() && e.is_not_found() => {}
                    Some(Err(e)) => return Err(e),
                    None => {}
                }
            }
            match view
                .table()
                .fetch(arena, &env.keys, proc.rank, key, qualifiers, out)
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if !job.modex.is_empty() {
            return fetch_modex(env, &job.modex, proc.rank, key, qualifiers, out);
        }
        Err(Error::not_found(format!(
            "{} for {} in shared memory",
            key.unwrap_or("data"),
            proc
        )))
    }

    fn fetch_session(
        &self,
        env: &GdsEnv,
        own: Option<u32>,
        key: Option<&str>,
        qualifiers: &[Info],
        out: &mut Vec<KeyValue>,
    ) -> Result<()> {
        let id = match qualifiers.iter().find(|q| q.check_key(keys::SESSION_ID)) {
            Some(q) => q.value.as_u32()?,
            None => own.ok_or_else(|| Error::not_found("no session in shared memory"))?,
        };
        let shared = self
            .sessions
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("session {id}")))?;
        let session = read_session(&shared.arena)?;

        let Some(k) = key else {
            out.push(KeyValue::new(keys::SESSION_INFO_ARRAY, session.to_info_array()));
            return Ok(());
        };
        if keys::is_node_level(k) {
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

/// Search modex rounds newest first; a keyed lookup stops at the first hit
fn fetch_modex(
    env: &GdsEnv,
    rounds: &[Arena],
    rank: Rank,
    key: Option<&str>,
    qualifiers: &[Info],
    out: &mut Vec<KeyValue>,
) -> Result<()> {
    let before = out.len();
    for arena in rounds.iter().rev() {
        match modex_table(arena)?.fetch(arena, &env.keys, rank, key, qualifiers, out) {
            Ok(()) if key.is_some() => return Ok(()),
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    if out.len() == before {
        return Err(Error::not_found(format!(
            "{} for rank {rank} in modex",
            key.unwrap_or("data")
        )));
    }
    Ok(())
}

fn dump_job(
    env: &GdsEnv,
    arena: &Arena,
    view: &JobView<'_>,
    out: &mut Vec<KeyValue>,
) -> Result<()> {
    let table = view.table();
    match table.fetch(arena, &env.keys, Rank::WILDCARD, None, &[], out) {
        Err(e) if !e.is_not_found() => return Err(e),
        _ => {}
    }
    out.extend(
        view.nodes()?
            .iter()
            .map(|n| KeyValue::new(keys::NODE_INFO_ARRAY, n.to_info_array())),
    );
    out.extend(
        view.apps()?
            .iter()
            .map(|a| KeyValue::new(keys::APP_INFO_ARRAY, a.to_info_array())),
    );
    for r in 0..view.nprocs() {
        let rank = Rank::new(r);
        let mut data = Vec::new();
        match table.fetch(arena, &env.keys, rank, None, &[], &mut data) {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        let mut items = vec![Info::new(keys::RANK, rank)];
        items.extend(data.into_iter().map(Info::from));
        out.push(KeyValue::new(keys::PROC_DATA, items));
    }
    Ok(())
}

fn fetch_app(
    env: &GdsEnv,
    arena: &Arena,
    view: &JobView<'_>,
    proc: &ProcId,
    key: Option<&str>,
    qualifiers: &[Info],
    out: &mut Vec<KeyValue>,
) -> Result<()> {
    let requested = match qualifiers.iter().find(|q| q.check_key(keys::APPNUM)) {
        Some(q) => Some(q.value.as_u32()?),
        None => None,
    };
    let appnum = match requested {
        Some(n) => n,
        None if env.myid.nspace == proc.nspace => {
            let mut tmp = Vec::new();
            view.table()
                .fetch(arena, &env.keys, env.myid.rank, Some(keys::APPNUM), &[], &mut tmp)
                .ok()
                .and_then(|()| tmp.first().and_then(|kv| kv.value.as_u32().ok()))
                .unwrap_or(0)
        }
        None => 0,
    };
    let apps = view.apps()?;
    let Some(app) = apps.iter().find(|a| a.appnum == appnum) else {
        return Err(if requested.is_some() {
            Error::not_found(format!("app {appnum}"))
        } else {
            Error::DataValueNotFound
        });
    };
    let Some(k) = key else {
        out.push(KeyValue::new(keys::APP_INFO_ARRAY, Value::InfoArray(app.to_info_array())));
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

#[cfg(test)]
mod tests {
    use super::super::tests::{shm_env, snapshot};
    use super::*;
    use crate::module::GdsModule;
    use gds_common::Nspace;

    fn published(env: &GdsEnv) -> ShmemStore {
        let mut store = ShmemStore::new();
        store.publish_job(env, &Nspace::from("ns1"), &snapshot()).unwrap();
        store
    }

    fn fetch(
        store: &ShmemStore,
        env: &GdsEnv,
        rank: Rank,
        key: Option<&str>,
        quals: &[Info],
    ) -> Result<Vec<KeyValue>> {
        let mut out = Vec::new();
        store.fetch(env, &ProcId::new("ns1", rank), Scope::Undef, key, quals, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_job_dump_shape() {
        let dir = tempfile::tempdir().unwrap();
        let env = shm_env(dir.path());
        let store = published(&env);
        let all = fetch(&store, &env, Rank::WILDCARD, None, &[]).unwrap();

        assert!(all.contains(&KeyValue::new(keys::JOB_SIZE, 2u32)));
        let nodes: Vec<_> = all.iter().filter(|kv| kv.check_key(keys::NODE_INFO_ARRAY)).collect();
        assert_eq!(nodes.len(), 1);
        let first = &nodes[0].value.as_info_array().unwrap()[0];
        assert_eq!(first.key, keys::HOSTNAME);

        let procs: Vec<_> = all.iter().filter(|kv| kv.check_key(keys::PROC_DATA)).collect();
        assert_eq!(procs.len(), 2);
        let items = procs[1].value.as_info_array().unwrap();
        assert_eq!(items[0].value, Value::Rank(Rank::new(1)));
        assert_eq!(items[1], Info::new(keys::LOCAL_RANK, 1u32));
    }

    #[test]
    fn test_node_app_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let env = shm_env(dir.path());
        let store = published(&env);

        let got = fetch(&store, &env, Rank::WILDCARD, Some(keys::LOCAL_SIZE), &[]).unwrap();
        assert_eq!(got, vec![KeyValue::new(keys::LOCAL_SIZE, 2u32)]);

        let q = [Info::new(keys::NODEID, 0u32)];
        let got = fetch(&store, &env, Rank::UNDEF, Some(keys::LOCAL_SIZE), &q).unwrap();
        assert_eq!(got[0].value, Value::Uint32(2));

        let got = fetch(&store, &env, Rank::WILDCARD, Some(keys::APP_SIZE), &[]).unwrap();
        assert_eq!(got, vec![KeyValue::new(keys::APP_SIZE, 2u32)]);

        let q = [Info::new(keys::SESSION_INFO, true)];
        let got = fetch(&store, &env, Rank::WILDCARD, Some("user.alloc"), &q).unwrap();
        assert_eq!(got, vec![KeyValue::new("user.alloc", "a1")]);
        let got = fetch(&store, &env, Rank::WILDCARD, None, &q).unwrap();
        let items = got[0].value.as_info_array().unwrap();
        assert_eq!(items[0], Info::new(keys::SESSION_ID, 3u32));
    }

    #[test]
    fn test_misses() {
        let dir = tempfile::tempdir().unwrap();
        let env = shm_env(dir.path());
        let store = published(&env);
        let err = fetch(&store, &env, Rank::new(0), Some("user.none"), &[]).unwrap_err();
        assert!(err.is_not_found());

        let mut out = Vec::new();
        let err = store
            .fetch(&env, &ProcId::new("nsX", Rank::new(0)), Scope::Undef, None, &[], &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidNamespace(_)));

        // job-level data falls through from the wildcard node path
        let got = fetch(&store, &env, Rank::WILDCARD, Some("user.flag"), &[]).unwrap();
        assert_eq!(got, vec![KeyValue::new("user.flag", "on")]);
    }
}
