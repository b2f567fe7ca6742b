//! Job, app, node and session bookkeeping of the hash backend

use super::table::HashTable;
use bytes::Bytes;
use gds_common::keys;
use gds_common::{Info, KeyValue, Nspace, Value};
use std::collections::HashMap;
use tracing::debug;

/// Facts about one node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeInfo {
    pub nodeid: Option<u32>,
    pub hostname: Option<String>,
    pub aliases: Vec<String>,
    pub info: Vec<KeyValue>,
}

impl NodeInfo {
    #[must_use]
    pub fn with_hostname(name: impl Into<String>) -> Self {
        Self {
            hostname: Some(name.into()),
            ..Self::default()
        }
    }

    /// Answer to a hostname or one of the aliases
    #[must_use]
    pub fn answers_to(&self, name: &str) -> bool {
        self.hostname.as_deref() == Some(name) || self.aliases.iter().any(|a| a == name)
    }

    /// Check whether two records describe the same node
    ///
    /// Ids decide when both carry one; otherwise hostnames and aliases are
    /// compared.
    #[must_use]
    pub fn same_node(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.nodeid, other.nodeid) {
            return a == b;
        }
        match (&self.hostname, &other.hostname) {
            (Some(a), Some(b)) => {
                a == b || self.aliases.iter().any(|x| x == b) || other.aliases.iter().any(|x| x == a)
            }
            _ => false,
        }
    }

    /// Set a key, replacing any earlier value
    pub fn set(&mut self, kv: KeyValue) {
        set_kv(&mut self.info, kv);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&KeyValue> {
        self.info.iter().find(|kv| kv.check_key(key))
    }

    /// Render as an info array with HOSTNAME and NODEID first
    #[must_use]
    pub fn to_info_array(&self) -> Vec<Info> {
        let mut items = Vec::with_capacity(self.info.len() + 2);
        if let Some(name) = &self.hostname {
            items.push(Info::new(keys::HOSTNAME, name.as_str()));
        }
        if let Some(id) = self.nodeid {
            items.push(Info::new(keys::NODEID, id));
        }
        items.extend(
            self.info
                .iter()
                .filter(|kv| !kv.check_key(keys::HOSTNAME) && !kv.check_key(keys::NODEID))
                .cloned()
                .map(Info::from),
        );
        items
    }

    /// Fold `other` into this record
    pub fn merge(&mut self, other: Self) {
        if self.nodeid.is_none() {
            self.nodeid = other.nodeid;
        }
        if self.hostname.is_none() {
            self.hostname = other.hostname;
        }
        for alias in other.aliases {
            if !self.aliases.contains(&alias) {
                self.aliases.push(alias);
            }
        }
        for kv in other.info {
            self.set(kv);
        }
    }
}

/// Replace-or-append a key/value in a list
pub fn set_kv(list: &mut Vec<KeyValue>, kv: KeyValue) {
    if let Some(slot) = list.iter_mut().find(|x| x.key == kv.key) {
        slot.value = kv.value;
    } else {
        list.push(kv);
    }
}

/// Merge a node into a list, de-duplicating by id or name
pub fn merge_node(nodes: &mut Vec<NodeInfo>, incoming: NodeInfo) {
    if let Some(existing) = nodes.iter_mut().find(|n| n.same_node(&incoming)) {
        existing.merge(incoming);
    } else {
        nodes.push(incoming);
    }
}

/// Locate a node by id
#[must_use]
pub fn find_node_by_id(nodes: &[NodeInfo], id: u32) -> Option<&NodeInfo> {
    nodes.iter().find(|n| n.nodeid == Some(id))
}

/// Locate a node by hostname, then by alias
#[must_use]
pub fn find_node_by_name<'a>(nodes: &'a [NodeInfo], name: &str) -> Option<&'a NodeInfo> {
    nodes
        .iter()
        .find(|n| n.hostname.as_deref() == Some(name))
        .or_else(|| nodes.iter().find(|n| n.answers_to(name)))
}

/// Locate a node by hostname, creating it when missing
pub fn node_by_name_mut<'a>(nodes: &'a mut Vec<NodeInfo>, name: &str) -> &'a mut NodeInfo {
    let idx = match nodes.iter().position(|n| n.answers_to(name)) {
        Some(idx) => idx,
        None => {
            nodes.push(NodeInfo::with_hostname(name));
            nodes.len() - 1
        }
    };
    &mut nodes[idx]
}

/// One application within a job
#[derive(Clone, Debug, Default)]
pub struct AppTracker {
    pub appnum: u32,
    pub info: Vec<KeyValue>,
    pub nodes: Vec<NodeInfo>,
}

impl AppTracker {
    #[must_use]
    pub fn new(appnum: u32) -> Self {
        Self {
            appnum,
            ..Self::default()
        }
    }

    /// Render as an info array with APPNUM first
    #[must_use]
    pub fn to_info_array(&self) -> Vec<Info> {
        let mut items = vec![Info::new(keys::APPNUM, self.appnum)];
        items.extend(self.info.iter().cloned().map(Info::from));
        items.extend(
            self.nodes
                .iter()
                .map(|n| Info::new(keys::NODE_INFO_ARRAY, n.to_info_array())),
        );
        items
    }
}

/// Allocation shared by every job reporting the same session id
#[derive(Clone, Debug, Default)]
pub struct Session {
    pub id: u32,
    refs: usize,
    pub info: Vec<KeyValue>,
    pub nodes: Vec<NodeInfo>,
}

impl Session {
    /// Render as an info array with SESSION_ID first
    #[must_use]
    pub fn to_info_array(&self) -> Vec<Info> {
        let mut items = vec![Info::new(keys::SESSION_ID, self.id)];
        items.extend(self.info.iter().cloned().map(Info::from));
        items.extend(
            self.nodes
                .iter()
                .map(|n| Info::new(keys::NODE_INFO_ARRAY, n.to_info_array())),
        );
        items
    }
}

/// Reference-counted session registry
#[derive(Debug, Default)]
pub struct Sessions {
    by_id: HashMap<u32, Session>,
}

impl Sessions {
    /// Take a reference on a session, creating it on first sight
    pub fn retain(&mut self, id: u32) -> &mut Session {
        let session = self.by_id.entry(id).or_insert_with(|| {
            debug!("creating session {}", id);
            Session {
                id,
                ..Session::default()
            }
        });
        session.refs += 1;
        session
    }

    /// Drop a reference; the session goes away with its last job
    pub fn release(&mut self, id: u32) {
        if let Some(session) = self.by_id.get_mut(&id) {
            session.refs = session.refs.saturating_sub(1);
            if session.refs == 0 {
                debug!("releasing session {}", id);
                self.by_id.remove(&id);
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: u32) -> Option<&Session> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Session> {
        self.by_id.get_mut(&id)
    }

    #[must_use]
    pub fn refs(&self, id: u32) -> usize {
        self.by_id.get(&id).map_or(0, |s| s.refs)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Everything the hash backend knows about one namespace
#[derive(Debug)]
pub struct JobTracker {
    pub nspace: Nspace,
    pub nprocs: u32,
    pub nlocalprocs: u32,
    pub ndelivered: u32,
    /// Packed job payload served to local peers
    pub jobbkt: Option<Bytes>,
    pub internal: HashTable,
    pub local: HashTable,
    pub remote: HashTable,
    pub apps: Vec<AppTracker>,
    pub nodes: Vec<NodeInfo>,
    pub session: Option<u32>,
    pub gdata_added: bool,
}

impl JobTracker {
    #[must_use]
    pub fn new(nspace: Nspace) -> Self {
        Self {
            nspace,
            nprocs: 0,
            nlocalprocs: 0,
            ndelivered: 0,
            jobbkt: None,
            internal: HashTable::new("internal"),
            local: HashTable::new("local"),
            remote: HashTable::new("remote"),
            apps: Vec::new(),
            nodes: Vec::new(),
            session: None,
            gdata_added: false,
        }
    }

    pub fn app_mut(&mut self, appnum: u32) -> Option<&mut AppTracker> {
        self.apps.iter_mut().find(|a| a.appnum == appnum)
    }

    #[must_use]
    pub fn app(&self, appnum: u32) -> Option<&AppTracker> {
        self.apps.iter().find(|a| a.appnum == appnum)
    }
}

/// Build a node record from the items of a node info array
pub fn node_from_items(items: &[Info]) -> gds_common::Result<NodeInfo> {
    let mut node = NodeInfo::default();
    for item in items {
        match item.key.as_str() {
            keys::NODEID => node.nodeid = Some(item.value.as_u32()?),
            keys::HOSTNAME => {
                let name = item.value.as_str().ok_or_else(|| {
                    gds_common::Error::type_mismatch("hostname must be a string")
                })?;
                node.hostname = Some(name.to_string());
            }
            keys::HOSTNAME_ALIASES => {
                if let Value::String(list) = &item.value {
                    for alias in list.split(',').filter(|a| !a.is_empty()) {
                        if !node.aliases.iter().any(|a| a == alias) {
                            node.aliases.push(alias.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
        node.set(KeyValue::from(item.clone()));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_node() {
        let mut a = NodeInfo::with_hostname("n0");
        a.aliases.push("n0-ib".into());
        let b = NodeInfo::with_hostname("n0-ib");
        assert!(a.same_node(&b));

        let x = NodeInfo {
            nodeid: Some(1),
            ..NodeInfo::with_hostname("n0")
        };
        let y = NodeInfo {
            nodeid: Some(2),
            ..NodeInfo::with_hostname("n0")
        };
        // ids win over names
        assert!(!x.same_node(&y));
        assert!(!NodeInfo::default().same_node(&NodeInfo::default()));
    }

    #[test]
    fn test_merge_node_is_idempotent() {
        let mut nodes = Vec::new();
        let mut n = NodeInfo::with_hostname("n0");
        n.set(KeyValue::new(keys::LOCAL_SIZE, 2u32));
        merge_node(&mut nodes, n.clone());
        merge_node(&mut nodes, n);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].info.len(), 1);

        let mut update = NodeInfo::with_hostname("n0");
        update.set(KeyValue::new(keys::LOCAL_SIZE, 4u32));
        update.nodeid = Some(0);
        merge_node(&mut nodes, update);
        assert_eq!(nodes[0].nodeid, Some(0));
        assert_eq!(nodes[0].get(keys::LOCAL_SIZE).unwrap().value, Value::Uint32(4));
    }

    #[test]
    fn test_node_from_items() {
        let node = node_from_items(&[
            Info::new(keys::HOSTNAME, "n1"),
            Info::new(keys::HOSTNAME_ALIASES, "a,b"),
            Info::new(keys::NODEID, 1u32),
        ])
        .unwrap();
        assert_eq!(node.aliases, vec!["a", "b"]);
        assert!(node.answers_to("b"));
        // the alias list itself is kept as a regular key too
        assert!(node.get(keys::HOSTNAME_ALIASES).is_some());
        let items = node.to_info_array();
        assert_eq!(items[0].key, keys::HOSTNAME);
        assert_eq!(items[1].key, keys::NODEID);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_sessions_refcount() {
        let mut sessions = Sessions::default();
        sessions.retain(7);
        sessions.retain(7);
        assert_eq!(sessions.refs(7), 2);
        sessions.release(7);
        assert!(sessions.get(7).is_some());
        sessions.release(7);
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_find_node() {
        let mut nodes = vec![NodeInfo {
            nodeid: Some(3),
            aliases: vec!["alias".into()],
            ..NodeInfo::with_hostname("n3")
        }];
        assert!(find_node_by_id(&nodes, 3).is_some());
        assert!(find_node_by_name(&nodes, "alias").is_some());
        assert!(find_node_by_name(&nodes, "n4").is_none());
        node_by_name_mut(&mut nodes, "n4").nodeid = Some(4);
        assert_eq!(nodes.len(), 2);
    }
}
