use std::collections::{BTreeMap, HashSet};

use crate::context::TopologyIndex;
use crate::topology::RelationshipEdge;

pub const SELF: &str = "SELF";
pub const HOST: &str = "HOST";
pub const SOURCE: &str = "SOURCE";
pub const TARGET: &str = "TARGET";

/// Keyword aliases visible to one evaluation, mapping to node ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    aliases: BTreeMap<String, String>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, alias: &str, id: &str) {
        if !id.trim().is_empty() {
            self.aliases.insert(alias.to_string(), id.to_string());
        }
    }

    pub fn get(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

pub fn is_keyword(key: &str) -> bool {
    matches!(key, SELF | HOST | SOURCE | TARGET)
}

/// Follows containment parents upward and returns the topmost node id.
pub fn host_of<'a>(index: &TopologyIndex<'a>, node_id: &str) -> Option<&'a str> {
    let mut current = index.node(node_id)?.id.as_str();
    let mut visited = HashSet::new();
    visited.insert(current);
    while let Some(parent) = index.parent(current) {
        let next = index.node(parent)?.id.as_str();
        if !visited.insert(next) {
            return None;
        }
        current = next;
    }
    Some(current)
}

pub fn node_scope(index: &TopologyIndex<'_>, node_id: &str) -> Scope {
    let mut scope = Scope::new();
    if let Some(node) = index.node(node_id) {
        scope.insert(SELF, &node.id);
    }
    if let Some(host) = host_of(index, node_id) {
        scope.insert(HOST, host);
    }
    scope
}

pub fn relationship_scope(index: &TopologyIndex<'_>, source_id: &str, edge: &RelationshipEdge) -> Scope {
    let mut scope = Scope::new();
    if let Some(source) = index.node(source_id) {
        scope.insert(SOURCE, &source.id);
    }
    scope.insert(TARGET, &edge.target);
    scope
}
