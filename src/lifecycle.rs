use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::json;

use crate::artifacts::artifact_archive;
use crate::context::CompileContext;
use crate::error::CompileError;
use crate::expression::{resolve, FormatString};
use crate::keywords::{node_scope, relationship_scope, Scope};
use crate::spec::{CommandSlot, ConfigValue, SpecNode};
use crate::topology::{find_interface, ArchiveCoordinates, Interface, Operation, RelationshipEdge};

pub const NODE_LIFECYCLE: [&str; 3] = [
    "tosca.interfaces.node.lifecycle.Standard",
    "Standard",
    "standard",
];

pub const RELATIONSHIP_CONFIGURE: [&str; 3] = [
    "tosca.interfaces.relationship.Configure",
    "Configure",
    "configure",
];

pub const FILE_ARTIFACT: &str = "tosca.artifacts.File";

pub fn node_stage(operation: &str) -> Option<CommandSlot> {
    match operation {
        "create" => Some(CommandSlot::Install),
        "configure" => Some(CommandSlot::Configure),
        "start" => Some(CommandSlot::Launch),
        "stop" => Some(CommandSlot::Stop),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelationshipEnd {
    Source,
    Target,
}

fn relationship_stage(operation: &str, end: RelationshipEnd) -> Option<CommandSlot> {
    match (operation, end) {
        ("pre_configure_source", RelationshipEnd::Source)
        | ("pre_configure_target", RelationshipEnd::Target) => Some(CommandSlot::PreConfigure),
        ("post_configure_source", RelationshipEnd::Source)
        | ("post_configure_target", RelationshipEnd::Target) => Some(CommandSlot::PostConfigure),
        _ => None,
    }
}

fn is_other_end(operation: &str, end: RelationshipEnd) -> bool {
    let other = match end {
        RelationshipEnd::Source => RelationshipEnd::Target,
        RelationshipEnd::Target => RelationshipEnd::Source,
    };
    relationship_stage(operation, other).is_some()
}

/// Type-level operations overlaid by instance operations that name a script.
pub fn merged_operations(
    type_interfaces: &[Interface],
    own_interfaces: &[Interface],
    aliases: &[&str],
) -> Vec<Operation> {
    let mut operations: Vec<Operation> = find_interface(type_interfaces, aliases)
        .map(|iface| iface.operations.clone())
        .unwrap_or_default();
    if let Some(iface) = find_interface(own_interfaces, aliases) {
        for op in &iface.operations {
            match operations.iter_mut().find(|existing| existing.name == op.name) {
                Some(existing) => {
                    if op.is_effective() {
                        *existing = op.clone();
                    }
                }
                None => operations.push(op.clone()),
            }
        }
    }
    operations
}

/// Export preamble plus script body, or `None` when the operation has no script.
fn compile_operation(
    ctx: &mut CompileContext<'_>,
    node_id: &str,
    operation: &Operation,
    scope: &Scope,
) -> Result<Option<FormatString>> {
    let Some(artifact) = &operation.implementation else {
        ctx.log.debug(
            format!("operation {} has no implementation", operation.name),
            Some(json!({ "operation": operation.name })),
        );
        return Ok(None);
    };
    if !artifact.has_reference() {
        ctx.log.warn(
            format!("operation {} has an empty artifact reference; skipping", operation.name),
            Some(json!({ "node": node_id, "operation": operation.name })),
        );
        return Ok(None);
    }

    let fallback = ctx.index.topology().archive.as_ref();
    let body = ctx
        .artifacts
        .load_script(artifact, fallback)
        .map_err(|err| CompileError::ArtifactNotFound {
            node: node_id.to_string(),
            reference: artifact.reference.clone(),
            detail: format!("{err:#}"),
        })?;

    let mut script = FormatString::new();
    for (name, value) in &operation.inputs {
        let resolution = resolve(ctx, value, scope);
        script.push_text(&format!("export {name}="));
        script.push_resolution(resolution);
        script.push_text("\n");
    }
    script.push_text(&body);
    Ok(Some(script))
}

#[derive(Default)]
struct Contributions {
    slots: BTreeMap<CommandSlot, Vec<FormatString>>,
}

impl Contributions {
    fn push(&mut self, slot: CommandSlot, script: FormatString) {
        self.slots.entry(slot).or_default().push(script);
    }

    fn apply(self, spec: &mut SpecNode) {
        for (slot, scripts) in self.slots {
            let mut joined = FormatString::new();
            for (position, script) in scripts.into_iter().enumerate() {
                if position > 0 {
                    joined.push_text("\n");
                }
                joined.append(script);
            }
            if let Some(value) = ConfigValue::from_resolution(joined.into_resolution()) {
                spec.commands.insert(slot, value);
            }
        }
    }
}

fn relationship_contributions(
    ctx: &mut CompileContext<'_>,
    node_id: &str,
    source_id: &str,
    edge: &RelationshipEdge,
    end: RelationshipEnd,
    out: &mut Contributions,
) -> Result<()> {
    let meta = ctx.type_metadata(&edge.relationship_type);
    let operations = merged_operations(&meta.interfaces, &edge.interfaces, &RELATIONSHIP_CONFIGURE);
    if operations.is_empty() {
        return Ok(());
    }
    let scope = relationship_scope(&ctx.index, source_id, edge);
    for op in &operations {
        let Some(slot) = relationship_stage(&op.name, end) else {
            if !is_other_end(&op.name, end) {
                ctx.log.warn(
                    format!("could not translate relationship operation {}", op.name),
                    Some(json!({ "relationship": edge.id, "operation": op.name })),
                );
            }
            continue;
        };
        if let Some(script) = compile_operation(ctx, node_id, op, &scope)? {
            out.push(slot, script);
        }
    }
    Ok(())
}

/// Compiles the lifecycle command map of a scripted spec.
///
/// Contributors to one slot are concatenated in order: the node's own
/// operation, then relationships it sources, then relationships targeting it.
pub fn compile_lifecycle(ctx: &mut CompileContext<'_>, node_id: &str, spec: &mut SpecNode) -> Result<()> {
    let Some(node) = ctx.index.node(node_id) else {
        return Err(CompileError::node_not_found(node_id).into());
    };
    let noop = ctx.config.lifecycle.noop_command.clone();
    for slot in [CommandSlot::Launch, CommandSlot::Stop, CommandSlot::CheckRunning] {
        spec.commands.insert(slot, ConfigValue::text(noop.clone()));
    }

    let mut contributions = Contributions::default();
    let meta = ctx.type_metadata(&node.node_type);
    let scope = node_scope(&ctx.index, node_id);
    for op in merged_operations(&meta.interfaces, &node.interfaces, &NODE_LIFECYCLE) {
        let Some(slot) = node_stage(&op.name) else {
            ctx.log.warn(
                format!("could not translate operation {}", op.name),
                Some(json!({ "operation": op.name })),
            );
            continue;
        };
        if let Some(script) = compile_operation(ctx, node_id, &op, &scope)? {
            contributions.push(slot, script);
        }
    }

    for edge in &node.relationships {
        relationship_contributions(ctx, node_id, node_id, edge, RelationshipEnd::Source, &mut contributions)?;
    }
    for source in ctx.index.nodes() {
        for edge in source.relationships.iter().filter(|edge| edge.target == node_id) {
            relationship_contributions(ctx, node_id, &source.id, edge, RelationshipEnd::Target, &mut contributions)?;
        }
    }

    contributions.apply(spec);
    Ok(())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn join_remote(root: &str, name: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Stages type-level file artifacts onto the target before install.
pub fn compile_runtime_environment(ctx: &mut CompileContext<'_>, node_id: &str, spec: &mut SpecNode) {
    let Some(node) = ctx.index.node(node_id) else {
        return;
    };
    let meta = ctx.type_metadata(&node.node_type);
    let fallback: Option<ArchiveCoordinates> = ctx.index.topology().archive.clone();
    for (artifact_id, artifact) in &meta.artifacts {
        if artifact.artifact_type.as_deref() != Some(FILE_ARTIFACT) {
            ctx.log.info(
                "skipping unsupported artifact type",
                Some(json!({ "artifact": artifact_id, "type": artifact.artifact_type })),
            );
            continue;
        }
        let Some(name) = artifact.artifact_name.as_deref().filter(|n| !n.trim().is_empty()) else {
            ctx.log.warn(
                format!("skipping artifact {artifact_id}: no destination name"),
                Some(json!({ "artifact": artifact_id })),
            );
            continue;
        };
        let dest_root = join_remote(&ctx.config.lifecycle.resources_root, name);
        let temp_root = join_remote(&ctx.config.lifecycle.temp_root, name);
        let runtime = &mut spec.runtime;
        runtime.pre_install_commands.push(format!("mkdir -p {dest_root}"));
        runtime.pre_install_commands.push(format!("mkdir -p {temp_root}"));
        runtime.shell_env.insert(name.to_string(), dest_root.clone());

        let resources = artifact_archive(artifact)
            .or_else(|| fallback.clone())
            .and_then(|coordinates| ctx.artifacts.expanded_path(&coordinates, artifact_id));
        let Some(resources) = resources.filter(|path| path.is_dir()) else {
            ctx.log.warn(
                format!("archive content for artifact {artifact_id} not found"),
                Some(json!({ "artifact": artifact_id, "name": name })),
            );
            continue;
        };
        let mut files = Vec::new();
        if let Err(err) = collect_files(&resources, &mut files) {
            ctx.log.warn(
                "cannot list artifact resources",
                Some(json!({ "artifact": artifact_id, "error": err.to_string() })),
            );
            continue;
        }
        for file in files {
            let Some(file_name) = file.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let temp_dest = join_remote(&temp_root, file_name);
            let final_dest = join_remote(&dest_root, file_name);
            spec.runtime
                .pre_install_files
                .insert(file.display().to_string(), temp_dest.clone());
            spec.runtime
                .pre_install_commands
                .push(format!("mv {temp_dest} {final_dest}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ArtifactRef;

    fn op(name: &str, reference: Option<&str>) -> Operation {
        Operation {
            name: name.into(),
            implementation: reference.map(ArtifactRef::new),
            inputs: Vec::new(),
        }
    }

    fn iface(name: &str, ops: Vec<Operation>) -> Vec<Interface> {
        vec![Interface {
            name: name.into(),
            operations: ops,
        }]
    }

    #[test]
    fn instance_operations_override_only_when_effective() {
        let type_level = iface(
            "tosca.interfaces.node.lifecycle.Standard",
            vec![op("create", Some("type-create.sh")), op("start", Some("type-start.sh"))],
        );
        let own = iface(
            "tosca.interfaces.node.lifecycle.Standard",
            vec![op("create", Some("own-create.sh")), op("start", Some("  ")), op("stop", None)],
        );
        let merged = merged_operations(&type_level, &own, &NODE_LIFECYCLE);
        let refs: Vec<_> = merged
            .iter()
            .map(|op| op.implementation.as_ref().map(|art| art.reference.as_str()))
            .collect();
        assert_eq!(refs, vec![Some("own-create.sh"), Some("type-start.sh"), None]);
    }

    #[test]
    fn stage_mapping_is_fixed() {
        assert_eq!(node_stage("create"), Some(CommandSlot::Install));
        assert_eq!(node_stage("configure"), Some(CommandSlot::Configure));
        assert_eq!(node_stage("start"), Some(CommandSlot::Launch));
        assert_eq!(node_stage("stop"), Some(CommandSlot::Stop));
        assert_eq!(node_stage("delete"), None);
        assert_eq!(
            relationship_stage("pre_configure_target", RelationshipEnd::Target),
            Some(CommandSlot::PreConfigure)
        );
        assert_eq!(relationship_stage("pre_configure_target", RelationshipEnd::Source), None);
        assert!(is_other_end("post_configure_source", RelationshipEnd::Target));
    }
}
