use anyhow::Result;
use serde_json::{json, Map, Value};

use crate::context::CompileContext;
use crate::error::CompileError;
use crate::expression::{node_properties, resolve, value_text, Resolution};
use crate::keywords::{node_scope, relationship_scope};
use crate::spec::{ConfigValue, SpecNode};
use crate::types::COMPUTE_TYPE;

pub const INJECT_PROPERTY: &str = "tosca.relationships.InjectProperty";

/// Compute sizing properties and the provisioning keys they become.
const PROVISIONING_KEYS: [(&str, &str); 5] = [
    ("mem_size", "min_ram"),
    ("disk_size", "min_disk"),
    ("num_cpus", "min_cores"),
    ("os_distribution", "os_family"),
    ("os_version", "os_version_regex"),
];

/// Resolved properties go onto the spec and into its config; artifact refs
/// become config keys named after the artifact.
pub fn apply_properties(ctx: &mut CompileContext<'_>, node_id: &str, spec: &mut SpecNode) {
    for (name, resolution) in node_properties(ctx, node_id) {
        match ConfigValue::from_resolution(resolution) {
            Some(value) => {
                spec.properties.insert(name.clone(), value.clone());
                spec.put_config(name, value);
            }
            None => ctx.log.debug(
                format!("property {name} is unresolved"),
                Some(json!({ "property": name })),
            ),
        }
    }
    if let Some(node) = ctx.index.node(node_id) {
        for (artifact_id, artifact) in &node.artifacts {
            if artifact.has_reference() {
                spec.put_config(artifact_id.clone(), ConfigValue::text(artifact.reference.clone()));
            }
        }
    }
}

pub fn apply_provisioning(ctx: &mut CompileContext<'_>, node_id: &str, spec: &mut SpecNode) {
    let Some(node) = ctx.index.node(node_id) else {
        return;
    };
    if !ctx.type_metadata(&node.node_type).is_a(COMPUTE_TYPE) {
        return;
    }
    for (property, key) in PROVISIONING_KEYS {
        if let Some(ConfigValue::Literal(value)) = spec.properties.get(property) {
            spec.provisioning.insert(key.to_string(), value.clone());
        }
    }
}

/// Static attribute values declared on the node's type.
pub fn apply_attributes(ctx: &mut CompileContext<'_>, node_id: &str, spec: &mut SpecNode) {
    let Some(node) = ctx.index.node(node_id) else {
        return;
    };
    let meta = ctx.type_metadata(&node.node_type);
    let scope = node_scope(&ctx.index, node_id);
    for (name, definition) in &meta.attributes {
        let Some(definition) = definition else {
            continue;
        };
        let key = name.split_whitespace().collect::<Vec<_>>().join(".");
        match ConfigValue::from_resolution(resolve(ctx, definition, &scope)) {
            Some(value) => {
                spec.attributes.insert(key, value);
            }
            None => ctx.log.warn(
                format!("attribute {name} could not be resolved; skipping"),
                Some(json!({ "attribute": name })),
            ),
        }
    }
}

fn literal_text(resolution: &Resolution) -> String {
    resolution.as_value().map(value_text).unwrap_or_default()
}

/// Relationships of the property-injection type write one value into the
/// source spec's config: `{collection: {name: value}}`, `{collection: [value]}`
/// or, without a collection, `{name: value}`.
pub fn apply_property_injection(ctx: &mut CompileContext<'_>, node_id: &str, spec: &mut SpecNode) -> Result<()> {
    let Some(node) = ctx.index.node(node_id) else {
        return Ok(());
    };
    for edge in &node.relationships {
        if !ctx.type_metadata(&edge.relationship_type).is_a(INJECT_PROPERTY) {
            continue;
        }
        let scope = relationship_scope(&ctx.index, node_id, edge);
        let mut read = |key: &str| match edge.properties.get(key) {
            Some(raw) => resolve(ctx, raw, &scope),
            None => Resolution::Unresolved,
        };
        let name = literal_text(&read("prop.name"));
        let collection = literal_text(&read("prop.collection"));
        let value = ConfigValue::from_resolution(read("prop.value"))
            .unwrap_or_else(|| ConfigValue::text(""));

        if name.trim().is_empty() && collection.trim().is_empty() {
            return Err(CompileError::InvalidRelationship {
                node: node_id.to_string(),
                relationship: edge.id.clone(),
                reason: "prop.name or prop.collection must be set".to_string(),
            }
            .into());
        }
        let value = match value {
            ConfigValue::Literal(literal) => literal,
            deferred => serde_json::to_value(&deferred)?,
        };
        if collection.trim().is_empty() {
            spec.put_config(name, ConfigValue::Literal(value));
        } else if name.trim().is_empty() {
            spec.put_config(collection, ConfigValue::Literal(Value::Array(vec![value])));
        } else {
            let mut entry = Map::new();
            entry.insert(name, value);
            spec.put_config(collection, ConfigValue::Literal(Value::Object(entry)));
        }
    }
    Ok(())
}
