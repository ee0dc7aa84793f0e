use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Map, Value};

use crate::artifacts::ArtifactResolver;
use crate::config::CompilerConfig;
use crate::expression::Resolution;
use crate::graph::host_parent;
use crate::logging::Logger;
use crate::registry::Registry;
use crate::topology::{NodeTemplate, Topology};
use crate::types::{TypeLookup, TypeMetadata};

/// Id and effective-name lookup over one topology snapshot.
#[derive(Debug)]
pub struct TopologyIndex<'a> {
    topology: &'a Topology,
    by_id: HashMap<&'a str, usize>,
    by_name: HashMap<&'a str, usize>,
    parents: HashMap<&'a str, &'a str>,
}

impl<'a> TopologyIndex<'a> {
    pub fn new(topology: &'a Topology) -> Self {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        let mut parents = HashMap::new();
        for (position, node) in topology.nodes.iter().enumerate() {
            by_id.insert(node.id.as_str(), position);
            by_name.entry(node.effective_name()).or_insert(position);
            if let Some(parent) = host_parent(node) {
                parents.insert(node.id.as_str(), parent);
            }
        }
        Self {
            topology,
            by_id,
            by_name,
            parents,
        }
    }

    pub fn topology(&self) -> &'a Topology {
        self.topology
    }

    pub fn nodes(&self) -> &'a [NodeTemplate] {
        &self.topology.nodes
    }

    pub fn node(&self, id: &str) -> Option<&'a NodeTemplate> {
        self.by_id.get(id).map(|&position| &self.topology.nodes[position])
    }

    /// Ids win over display names; names only resolve when no id matches.
    pub fn node_by_id_or_name(&self, key: &str) -> Option<&'a NodeTemplate> {
        self.by_id
            .get(key)
            .or_else(|| self.by_name.get(key))
            .map(|&position| &self.topology.nodes[position])
    }

    /// Declared containment parent, the same edge the containment graph uses.
    pub fn parent(&self, id: &str) -> Option<&'a str> {
        self.parents.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }
}

/// Traversal state for a single compilation pass.
pub struct CompileContext<'a> {
    pub index: TopologyIndex<'a>,
    pub registry: &'a Registry,
    pub artifacts: &'a ArtifactResolver,
    pub config: &'a CompilerConfig,
    pub log: Logger,
    types: HashMap<String, Arc<TypeMetadata>>,
    pub(crate) property_memo: HashMap<(String, String), Resolution>,
    pub(crate) resolving: Vec<(String, String)>,
}

impl<'a> CompileContext<'a> {
    /// Looks up every node and relationship type up front so type errors
    /// surface before any spec is built.
    pub fn new(
        topology: &'a Topology,
        types: &dyn TypeLookup,
        registry: &'a Registry,
        artifacts: &'a ArtifactResolver,
        config: &'a CompilerConfig,
    ) -> Result<Self> {
        let mut log = Logger::new(&config.logging);
        let mut metadata = HashMap::new();
        let names = topology.nodes.iter().flat_map(|node| {
            std::iter::once(node.node_type.as_str()).chain(
                node.relationships
                    .iter()
                    .map(|rel| rel.relationship_type.as_str()),
            )
        });
        for name in names {
            if metadata.contains_key(name) {
                continue;
            }
            let found = types.lookup(name, &topology.dependencies)?;
            if found.derived_from.is_empty() && found.interfaces.is_empty() && found.properties.is_empty() {
                log.debug(
                    "type has no indexed definition",
                    Some(json!({ "type": name })),
                );
            }
            metadata.insert(name.to_string(), Arc::new(found));
        }
        Ok(Self {
            index: TopologyIndex::new(topology),
            registry,
            artifacts,
            config,
            log,
            types: metadata,
            property_memo: HashMap::new(),
            resolving: Vec::new(),
        })
    }

    pub fn type_metadata(&self, type_name: &str) -> Arc<TypeMetadata> {
        self.types
            .get(type_name)
            .cloned()
            .unwrap_or_else(|| Arc::new(TypeMetadata::bare(type_name)))
    }

    pub fn push_node_tags(&mut self, node_id: &str) -> bool {
        let mut tags = Map::new();
        tags.insert("node".to_string(), Value::String(node_id.to_string()));
        self.log.push_tags(tags)
    }
}
