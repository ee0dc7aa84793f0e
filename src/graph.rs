use std::collections::HashMap;

use anyhow::Result;
use serde_json::json;

use crate::context::TopologyIndex;
use crate::error::CompileError;
use crate::logging::Logger;
use crate::topology::{NodeTemplate, PropertyValue, HOST_REQUIREMENT};

/// Parent/child containment derived from host signals.
#[derive(Debug, Default)]
pub struct ContainmentGraph {
    order: Vec<String>,
    parents: HashMap<String, String>,
    children: HashMap<String, Vec<String>>,
    roots: HashMap<String, String>,
}

fn host_relationship(node: &NodeTemplate) -> Option<&str> {
    if !node.requirements.iter().any(|req| req == HOST_REQUIREMENT) {
        return None;
    }
    node.relationship_for(HOST_REQUIREMENT)
        .map(|rel| rel.target.as_str())
}

fn legacy_host(node: &NodeTemplate) -> Option<&str> {
    node.properties
        .get(HOST_REQUIREMENT)
        .and_then(PropertyValue::as_scalar)
}

/// Declared containment parent of a node: the target of its `host`
/// requirement, else the legacy `host` property.
pub fn host_parent(node: &NodeTemplate) -> Option<&str> {
    host_relationship(node).or_else(|| legacy_host(node))
}

fn host_target<'n>(node: &'n NodeTemplate, log: &mut Logger) -> Option<&'n str> {
    if host_relationship(node).is_some() {
        return host_parent(node);
    }
    if node.requirements.iter().any(|req| req == HOST_REQUIREMENT) {
        log.warn(
            format!("node {} declares a host requirement without a relationship", node.id),
            Some(json!({ "node": node.id })),
        );
    }
    if let Some(host) = legacy_host(node) {
        log.warn(
            format!("node {} uses the deprecated host property; declare a host requirement", node.id),
            Some(json!({ "node": node.id, "host": host })),
        );
    }
    host_parent(node)
}

impl ContainmentGraph {
    pub fn build(index: &TopologyIndex<'_>, log: &mut Logger) -> Result<Self> {
        let mut graph = ContainmentGraph::default();
        for node in index.nodes() {
            graph.order.push(node.id.clone());
            if let Some(parent) = host_target(node, log) {
                if !index.contains(parent) {
                    return Err(CompileError::referenced_node_not_found(parent, &node.id).into());
                }
                graph.parents.insert(node.id.clone(), parent.to_string());
                graph.children.entry(parent.to_string()).or_default().push(node.id.clone());
            }
        }
        Ok(graph)
    }

    pub fn parent(&self, id: &str) -> Option<&str> {
        self.parents.get(id).map(String::as_str)
    }

    /// Children in node declaration order.
    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn child_count(&self, id: &str) -> usize {
        self.children(id).len()
    }

    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    /// Topmost ancestor of `id`. Every node on the walked path is memoized.
    pub fn root(&mut self, id: &str) -> Result<String> {
        if !self.order.iter().any(|known| known == id) {
            return Err(CompileError::node_not_found(id).into());
        }
        let mut path = vec![id.to_string()];
        let mut current = id.to_string();
        let root = loop {
            if let Some(root) = self.roots.get(&current) {
                break root.clone();
            }
            match self.parents.get(&current) {
                Some(parent) => {
                    if let Some(start) = path.iter().position(|seen| seen == parent) {
                        let mut chain = path[start..].to_vec();
                        chain.push(parent.clone());
                        return Err(CompileError::CyclicHost { chain }.into());
                    }
                    path.push(parent.clone());
                    current = parent.clone();
                }
                None => break current.clone(),
            }
        };
        for node in path {
            self.roots.insert(node, root.clone());
        }
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::parse_topology;
    use serde_json::json;

    #[test]
    fn roots_are_memoized_along_the_path() {
        let topology = parse_topology(&json!({
            "node_templates": {
                "vm": { "type": "tosca.nodes.Compute" },
                "server": { "type": "x", "requirements": [ { "host": "vm" } ] },
                "app": { "type": "x", "requirements": [ { "host": "server" } ] }
            }
        }))
        .unwrap();
        let index = TopologyIndex::new(&topology);
        let mut graph = ContainmentGraph::build(&index, &mut Logger::default()).unwrap();
        assert_eq!(graph.root("app").unwrap(), "vm");
        assert_eq!(graph.roots.get("server").map(String::as_str), Some("vm"));
        assert_eq!(graph.children("vm"), &["server".to_string()]);
        assert_eq!(graph.parent("vm"), None);
    }
}
