use anyhow::{Context as AnyhowContext, Result};
use serde_json::json;

use crate::context::CompileContext;
use crate::error::CompileError;
use crate::registry::Implementation;
use crate::spec::{ImplementationKind, SpecNode};
use crate::types::COMPUTE_TYPE;

/// Chooses the implementation for one node and stamps its identity.
///
/// Precedence: catalog registration, compute co-location or application
/// root, native implementation, generic scripted process.
pub fn select_spec(ctx: &mut CompileContext<'_>, node_id: &str, child_count: usize) -> Result<SpecNode> {
    let node = ctx
        .index
        .node(node_id)
        .ok_or_else(|| CompileError::node_not_found(node_id))?;
    let meta = ctx.type_metadata(&node.node_type);

    let (kind, implementation) =
        if let Some((name, factory)) = ctx.registry.find_catalog(&node.node_type, node.type_version.as_deref()) {
            let implementation = factory
                .create(node)
                .with_context(|| format!("catalog entry {name} failed for node {node_id}"))?;
            (ImplementationKind::Registered { name }, implementation)
        } else if meta.is_a(COMPUTE_TYPE) {
            if child_count > 1 {
                (ImplementationKind::CoLocation, Implementation::new())
            } else {
                (ImplementationKind::ApplicationRoot, Implementation::new())
            }
        } else if let Some((name, factory)) = ctx.registry.find_native(&node.node_type) {
            let implementation = factory
                .create(node)
                .with_context(|| format!("native implementation {name} failed for node {node_id}"))?;
            (ImplementationKind::Native { name }, implementation)
        } else {
            (ImplementationKind::ScriptedProcess, Implementation::new())
        };

    ctx.log.info(
        format!("selected implementation for {node_id}"),
        Some(json!({ "type": node.node_type, "kind": kind, "children": child_count })),
    );

    let mut spec = SpecNode::new(kind, implementation);
    spec.id = node.id.clone();
    spec.node_type = node.node_type.clone();
    spec.display_name = node.effective_name().to_string();
    Ok(spec)
}
