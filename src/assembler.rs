use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Map, Value};

use crate::artifacts::ArtifactResolver;
use crate::config::CompilerConfig;
use crate::context::CompileContext;
use crate::decorations::apply_group_decorations;
use crate::error::CompileError;
use crate::graph::ContainmentGraph;
use crate::lifecycle::{compile_lifecycle, compile_runtime_environment};
use crate::logging::Level;
use crate::node_config::{apply_attributes, apply_properties, apply_property_injection, apply_provisioning};
use crate::registry::Registry;
use crate::selector::select_spec;
use crate::spec::{SpecNode, SpecTree};
use crate::topology::Topology;
use crate::types::TypeLookup;

/// Compiles one topology into a spec tree and caches the result.
///
/// Not meant for concurrent use; wrap it in a `Mutex` to share it.
pub struct SpecAssembler {
    topology: Arc<Topology>,
    types: Arc<dyn TypeLookup>,
    registry: Registry,
    artifacts: Arc<ArtifactResolver>,
    config: CompilerConfig,
    cache: Option<Arc<SpecTree>>,
    diagnostics: Vec<Value>,
}

impl SpecAssembler {
    pub fn new(
        topology: impl Into<Arc<Topology>>,
        types: Arc<dyn TypeLookup>,
        registry: Registry,
        artifacts: Arc<ArtifactResolver>,
        config: CompilerConfig,
    ) -> Self {
        Self {
            topology: topology.into(),
            types,
            registry,
            artifacts,
            config,
            cache: None,
            diagnostics: Vec::new(),
        }
    }

    /// Uses the file-backed artifact resolver described by `config`.
    pub fn with_config(
        topology: impl Into<Arc<Topology>>,
        types: Arc<dyn TypeLookup>,
        registry: Registry,
        config: CompilerConfig,
    ) -> Self {
        let artifacts = Arc::new(ArtifactResolver::from_settings(&config.artifacts));
        Self::new(topology, types, registry, artifacts, config)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Log entries captured by the most recent compile.
    pub fn diagnostics(&self) -> &[Value] {
        &self.diagnostics
    }

    pub fn is_compiled(&self) -> bool {
        self.cache.is_some()
    }

    /// Builds the tree on first call; later calls return the cached tree.
    /// Failures are not cached.
    pub fn compile(&mut self) -> Result<Arc<SpecTree>> {
        if let Some(tree) = &self.cache {
            return Ok(tree.clone());
        }
        self.diagnostics.clear();
        let mut ctx = CompileContext::new(
            &self.topology,
            self.types.as_ref(),
            &self.registry,
            &self.artifacts,
            &self.config,
        )?;
        let result = build_tree(&mut ctx);
        if let Err(err) = &result {
            ctx.log.log(
                Level::Error,
                "compilation failed",
                Some(json!({ "error": format!("{err:#}") })),
            );
        }
        let entries = ctx.log.take_entries();
        drop(ctx);
        self.diagnostics = entries;
        let tree = Arc::new(result?);
        self.cache = Some(tree.clone());
        Ok(tree)
    }
}

fn build_tree(ctx: &mut CompileContext<'_>) -> Result<SpecTree> {
    let mut tags = Map::new();
    tags.insert("component".to_string(), Value::String("assembler".to_string()));
    let pushed = ctx.log.push_tags(tags);
    let result = build_forest(ctx);
    if pushed {
        ctx.log.pop_tags();
    }
    result
}

fn build_forest(ctx: &mut CompileContext<'_>) -> Result<SpecTree> {
    let mut graph = ContainmentGraph::build(&ctx.index, &mut ctx.log)?;
    for node in ctx.index.nodes() {
        for edge in &node.relationships {
            if !ctx.index.contains(&edge.target) {
                return Err(CompileError::referenced_node_not_found(&edge.target, &node.id).into());
            }
        }
    }

    let mut visited = HashSet::new();
    let mut roots = Vec::new();
    for id in graph.node_ids().to_vec() {
        let root = graph.root(&id)?;
        if visited.contains(&root) {
            continue;
        }
        roots.push(build_node(ctx, &graph, &root, &mut visited)?);
    }

    let topology = ctx.index.topology();
    let mut tree = SpecTree {
        name: topology.name.clone(),
        roots,
        behaviors: Vec::new(),
    };
    apply_group_decorations(&mut tree, topology, ctx.registry, &mut ctx.log)?;
    ctx.log.info(
        "topology compiled",
        Some(json!({ "roots": tree.roots.len(), "nodes": tree.node_count() })),
    );
    Ok(tree)
}

fn build_node(
    ctx: &mut CompileContext<'_>,
    graph: &ContainmentGraph,
    node_id: &str,
    visited: &mut HashSet<String>,
) -> Result<SpecNode> {
    visited.insert(node_id.to_string());
    let pushed = ctx.push_node_tags(node_id);
    let result = build_node_spec(ctx, graph, node_id, visited);
    if pushed {
        ctx.log.pop_tags();
    }
    result
}

/// The parent's kind is chosen before its children are built, since
/// co-location depends on the child count.
fn build_node_spec(
    ctx: &mut CompileContext<'_>,
    graph: &ContainmentGraph,
    node_id: &str,
    visited: &mut HashSet<String>,
) -> Result<SpecNode> {
    let mut spec = select_spec(ctx, node_id, graph.child_count(node_id))?;
    apply_properties(ctx, node_id, &mut spec);
    apply_provisioning(ctx, node_id, &mut spec);
    apply_property_injection(ctx, node_id, &mut spec)?;
    if spec.scripted {
        compile_runtime_environment(ctx, node_id, &mut spec);
        apply_attributes(ctx, node_id, &mut spec);
        compile_lifecycle(ctx, node_id, &mut spec)?;
    }
    for child in graph.children(node_id) {
        if visited.contains(child) {
            continue;
        }
        let child_spec = build_node(ctx, graph, child, visited)?;
        spec.children.push(child_spec);
    }
    Ok(spec)
}
