use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CompileError;

pub const HOST_REQUIREMENT: &str = "host";
pub const HOSTED_ON: &str = "tosca.relationships.HostedOn";
pub const DEPENDS_ON: &str = "tosca.relationships.DependsOn";

/// Function names the expression evaluator knows about, supported or not.
pub const KNOWN_FUNCTIONS: [&str; 4] = [
    "get_property",
    "get_attribute",
    "get_input",
    "get_operation_output",
];

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Scalar(String),
    Complex(Map<String, Value>),
    List(Vec<Value>),
    Concat(Vec<PropertyValue>),
    Function(FunctionCall),
    /// A shape the compiler does not interpret, such as null.
    Other(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_function_name(name: &str) -> bool {
    KNOWN_FUNCTIONS.contains(&name) || name.starts_with("get_")
}

impl PropertyValue {
    pub fn scalar(text: impl Into<String>) -> Self {
        PropertyValue::Scalar(text.into())
    }

    pub fn from_value(value: &Value) -> Self {
        if let Some(text) = scalar_text(value) {
            return PropertyValue::Scalar(text);
        }
        match value {
            Value::Array(items) => PropertyValue::List(items.clone()),
            Value::Object(map) => {
                let single = if map.len() == 1 { map.iter().next() } else { None };
                match single {
                    Some((key, Value::Array(parts))) if key == "concat" => {
                        PropertyValue::Concat(parts.iter().map(PropertyValue::from_value).collect())
                    }
                    Some((name, arg)) if is_function_name(name) => {
                        let args = match arg {
                            Value::Array(items) => items
                                .iter()
                                .map(|item| scalar_text(item).unwrap_or_else(|| item.to_string()))
                                .collect(),
                            other => scalar_text(other).into_iter().collect(),
                        };
                        PropertyValue::Function(FunctionCall {
                            name: name.clone(),
                            args,
                        })
                    }
                    _ => PropertyValue::Complex(map.clone()),
                }
            }
            other => PropertyValue::Other(other.clone()),
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            PropertyValue::Scalar(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub archive_name: Option<String>,
    pub archive_version: Option<String>,
    pub reference: String,
    pub artifact_type: Option<String>,
    pub artifact_name: Option<String>,
}

impl ArtifactRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            ..Self::default()
        }
    }

    pub fn in_archive(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.archive_name = Some(name.into());
        self.archive_version = Some(version.into());
        self
    }

    pub fn has_reference(&self) -> bool {
        !self.reference.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub name: String,
    pub implementation: Option<ArtifactRef>,
    /// Declaration order is the export order.
    pub inputs: Vec<(String, PropertyValue)>,
}

impl Operation {
    /// An operation overrides a type default only when it names a script.
    pub fn is_effective(&self) -> bool {
        self.implementation
            .as_ref()
            .map(ArtifactRef::has_reference)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interface {
    pub name: String,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipEdge {
    pub id: String,
    pub requirement_name: String,
    pub target: String,
    pub relationship_type: String,
    pub properties: BTreeMap<String, PropertyValue>,
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeTemplate {
    pub id: String,
    pub node_type: String,
    pub type_version: Option<String>,
    pub name: Option<String>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub requirements: Vec<String>,
    pub relationships: Vec<RelationshipEdge>,
    pub interfaces: Vec<Interface>,
    pub artifacts: Vec<(String, ArtifactRef)>,
}

impl NodeTemplate {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            type_version: None,
            name: None,
            properties: BTreeMap::new(),
            requirements: Vec::new(),
            relationships: Vec::new(),
            interfaces: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// The declared name, or the id when the name is blank.
    pub fn effective_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.id,
        }
    }

    pub fn relationship_for(&self, requirement: &str) -> Option<&RelationshipEdge> {
        self.relationships
            .iter()
            .find(|rel| rel.requirement_name == requirement)
    }

    pub fn interface(&self, aliases: &[&str]) -> Option<&Interface> {
        find_interface(&self.interfaces, aliases)
    }
}

pub fn find_interface<'a>(interfaces: &'a [Interface], aliases: &[&str]) -> Option<&'a Interface> {
    aliases
        .iter()
        .find_map(|alias| interfaces.iter().find(|iface| iface.name == *alias))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecorationKind {
    Location,
    Behavior,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoration {
    pub name: String,
    pub kind: DecorationKind,
    pub behavior_type: Option<String>,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    pub members: Vec<String>,
    pub decorations: Vec<Decoration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCoordinates {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Topology {
    pub name: String,
    pub nodes: Vec<NodeTemplate>,
    pub groups: Vec<Group>,
    pub dependencies: Vec<Dependency>,
    pub archive: Option<ArchiveCoordinates>,
}

impl Topology {
    pub fn node(&self, id: &str) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|node| node.id == id)
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    CompileError::InvalidTopology(message.into()).into()
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| map.get(*key))
        .and_then(scalar_text)
}

fn parse_properties(value: Option<&Value>) -> BTreeMap<String, PropertyValue> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(name, raw)| (name.clone(), PropertyValue::from_value(raw)))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn parse_artifact(value: &Value) -> Option<ArtifactRef> {
    match value {
        Value::String(reference) => Some(ArtifactRef::new(reference.clone())),
        Value::Object(map) => Some(ArtifactRef {
            archive_name: string_field(map, &["archive_name", "archiveName"]),
            archive_version: string_field(map, &["archive_version", "archiveVersion"]),
            reference: string_field(map, &["ref", "file", "artifact_ref", "primary"])
                .unwrap_or_default(),
            artifact_type: string_field(map, &["type", "artifact_type"]),
            artifact_name: string_field(map, &["name", "artifact_name"]),
        }),
        _ => None,
    }
}

fn parse_operation(name: &str, value: &Value) -> Operation {
    let (implementation, inputs) = match value {
        Value::Object(map) => {
            let implementation = map.get("implementation").and_then(parse_artifact);
            let inputs = map
                .get("inputs")
                .and_then(Value::as_object)
                .map(|inputs| {
                    inputs
                        .iter()
                        .map(|(key, raw)| (key.clone(), PropertyValue::from_value(raw)))
                        .collect()
                })
                .unwrap_or_default();
            (implementation, inputs)
        }
        Value::String(_) => (parse_artifact(value), Vec::new()),
        _ => (None, Vec::new()),
    };
    Operation {
        name: name.to_string(),
        implementation,
        inputs,
    }
}

pub(crate) fn parse_interfaces(value: Option<&Value>) -> Vec<Interface> {
    let Some(map) = value.and_then(Value::as_object) else {
        return Vec::new();
    };
    map.iter()
        .map(|(name, body)| {
            let ops = body
                .get("operations")
                .and_then(Value::as_object)
                .or_else(|| body.as_object());
            let operations = ops
                .map(|ops| {
                    ops.iter()
                        .filter(|(op_name, _)| op_name.as_str() != "type")
                        .map(|(op_name, op)| parse_operation(op_name, op))
                        .collect()
                })
                .unwrap_or_default();
            Interface {
                name: name.clone(),
                operations,
            }
        })
        .collect()
}

fn parse_relationship(node_id: &str, id: &str, value: &Value) -> Result<RelationshipEdge> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid(format!("relationship {id} on node {node_id} must be a map")))?;
    let target = string_field(map, &["target", "node"])
        .ok_or_else(|| invalid(format!("relationship {id} on node {node_id} has no target")))?;
    let relationship_type =
        string_field(map, &["type", "relationship"]).unwrap_or_else(|| DEPENDS_ON.to_string());
    let requirement_name = string_field(map, &["requirement", "requirement_name"])
        .unwrap_or_else(|| {
            if relationship_type == HOSTED_ON {
                HOST_REQUIREMENT.to_string()
            } else {
                id.to_string()
            }
        });
    Ok(RelationshipEdge {
        id: id.to_string(),
        requirement_name,
        target,
        relationship_type,
        properties: parse_properties(map.get("properties")),
        interfaces: parse_interfaces(map.get("interfaces")),
    })
}

/// Requirement entries are either bare names or `{name: target}` shorthands
/// that also declare the satisfying relationship.
fn parse_requirement(
    node_id: &str,
    entry: &Value,
    requirements: &mut Vec<String>,
    relationships: &mut Vec<RelationshipEdge>,
) -> Result<()> {
    match entry {
        Value::String(name) => requirements.push(name.clone()),
        Value::Object(map) => {
            for (name, spec) in map {
                requirements.push(name.clone());
                let (target, rel_type, properties, interfaces) = match spec {
                    Value::String(target) => (target.clone(), None, BTreeMap::new(), Vec::new()),
                    Value::Object(body) => {
                        let target = string_field(body, &["node", "target"]).ok_or_else(|| {
                            invalid(format!("requirement {name} on node {node_id} has no target node"))
                        })?;
                        (
                            target,
                            string_field(body, &["relationship", "type"]),
                            parse_properties(body.get("properties")),
                            parse_interfaces(body.get("interfaces")),
                        )
                    }
                    _ => {
                        return Err(invalid(format!(
                            "requirement {name} on node {node_id} must name a target"
                        )))
                    }
                };
                let relationship_type = rel_type.unwrap_or_else(|| {
                    if name == HOST_REQUIREMENT {
                        HOSTED_ON.to_string()
                    } else {
                        DEPENDS_ON.to_string()
                    }
                });
                relationships.push(RelationshipEdge {
                    id: format!("{name}_{target}"),
                    requirement_name: name.clone(),
                    target,
                    relationship_type,
                    properties,
                    interfaces,
                });
            }
        }
        other => {
            return Err(invalid(format!(
                "unsupported requirement entry on node {node_id}: {other}"
            )))
        }
    }
    Ok(())
}

fn parse_node(id: &str, value: &Value) -> Result<NodeTemplate> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid(format!("node template {id} must be a map")))?;
    let node_type = string_field(map, &["type"])
        .ok_or_else(|| invalid(format!("node template {id} has no type")))?;

    let mut requirements = Vec::new();
    let mut relationships = Vec::new();
    if let Some(entries) = map.get("requirements").and_then(Value::as_array) {
        for entry in entries {
            parse_requirement(id, entry, &mut requirements, &mut relationships)?;
        }
    }
    if let Some(rels) = map.get("relationships").and_then(Value::as_object) {
        for (rel_id, rel) in rels {
            relationships.push(parse_relationship(id, rel_id, rel)?);
        }
    }
    for rel in &relationships {
        if !requirements.contains(&rel.requirement_name) {
            requirements.push(rel.requirement_name.clone());
        }
    }

    let artifacts = map
        .get("artifacts")
        .and_then(Value::as_object)
        .map(|arts| {
            arts.iter()
                .filter_map(|(art_id, raw)| parse_artifact(raw).map(|art| (art_id.clone(), art)))
                .collect()
        })
        .unwrap_or_default();

    Ok(NodeTemplate {
        id: id.to_string(),
        node_type,
        type_version: string_field(map, &["type_version", "version"]),
        name: string_field(map, &["name"]),
        properties: parse_properties(map.get("properties")),
        requirements,
        relationships,
        interfaces: parse_interfaces(map.get("interfaces")),
        artifacts,
    })
}

fn parse_decoration(group: &str, index: usize, value: &Value) -> Result<Decoration> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid(format!("policy #{index} of group {group} must be a map")))?;
    let name = string_field(map, &["name"]).unwrap_or_else(|| format!("{group}-{index}"));
    let mut data = map
        .get("data")
        .or_else(|| map.get("properties"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let kind = match string_field(map, &["kind"]).as_deref() {
        Some("location") => DecorationKind::Location,
        Some("behavior") => DecorationKind::Behavior,
        Some(other) => {
            return Err(invalid(format!(
                "policy {name} of group {group} has unknown kind {other}"
            )))
        }
        None if name == "location" => DecorationKind::Location,
        None => DecorationKind::Behavior,
    };
    let mut behavior_type = string_field(map, &["type"]);
    if kind == DecorationKind::Behavior && behavior_type.is_none() {
        behavior_type = data.remove("type").as_ref().and_then(scalar_text);
    }
    Ok(Decoration {
        name,
        kind,
        behavior_type,
        data,
    })
}

fn parse_group(name: &str, value: &Value) -> Result<Group> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid(format!("group {name} must be a map")))?;
    let members = map
        .get("members")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(scalar_text).collect())
        .unwrap_or_default();
    let mut decorations = Vec::new();
    match map.get("policies") {
        Some(Value::Array(items)) => {
            for (index, item) in items.iter().enumerate() {
                decorations.push(parse_decoration(name, index, item)?);
            }
        }
        Some(Value::Object(named)) => {
            for (index, (policy_name, body)) in named.iter().enumerate() {
                let mut body = body.clone();
                if let Value::Object(inner) = &mut body {
                    inner
                        .entry("name")
                        .or_insert_with(|| Value::String(policy_name.clone()));
                }
                decorations.push(parse_decoration(name, index, &body)?);
            }
        }
        _ => {}
    }
    Ok(Group {
        name: name.to_string(),
        members,
        decorations,
    })
}

fn parse_coordinates(value: &Value) -> Option<(String, String)> {
    let map = value.as_object()?;
    Some((string_field(map, &["name"])?, string_field(map, &["version"])?))
}

/// Builds a topology from a decoded YAML or JSON document.
///
/// Node templates and groups may sit at the top level or under
/// `topology_template`.
pub fn parse_topology(doc: &Value) -> Result<Topology> {
    let root = doc
        .as_object()
        .ok_or_else(|| invalid("topology document must be a map"))?;
    let template = root
        .get("topology_template")
        .and_then(Value::as_object)
        .unwrap_or(root);

    let mut nodes = Vec::new();
    if let Some(entries) = template.get("node_templates") {
        let entries = entries
            .as_object()
            .ok_or_else(|| invalid("node_templates must be a map"))?;
        for (id, body) in entries {
            nodes.push(parse_node(id, body)?);
        }
    }

    let mut groups = Vec::new();
    if let Some(Value::Object(entries)) = template.get("groups") {
        for (name, body) in entries {
            groups.push(parse_group(name, body)?);
        }
    }

    let dependencies = root
        .get("dependencies")
        .or_else(|| root.get("imports"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(parse_coordinates)
                .map(|(name, version)| Dependency { name, version })
                .collect()
        })
        .unwrap_or_default();

    let archive = root
        .get("archive")
        .and_then(parse_coordinates)
        .map(|(name, version)| ArchiveCoordinates { name, version });

    Ok(Topology {
        name: string_field(root, &["name", "template_name"]).unwrap_or_default(),
        nodes,
        groups,
        dependencies,
        archive,
    })
}

pub fn parse_topology_str(text: &str) -> Result<Topology> {
    let doc: Value = serde_yaml::from_str(text).with_context(|| "invalid YAML topology")?;
    parse_topology(&doc)
}

pub fn load_topology(path: &Path) -> Result<Topology> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read topology file: {}", path.display()))?;
    parse_topology_str(&content)
        .with_context(|| format!("invalid topology in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn property_shapes_are_classified() {
        assert_eq!(
            PropertyValue::from_value(&json!(3306)),
            PropertyValue::scalar("3306")
        );
        assert_eq!(
            PropertyValue::from_value(&json!({ "get_property": ["SELF", "port"] })),
            PropertyValue::Function(FunctionCall::new("get_property", &["SELF", "port"]))
        );
        assert_eq!(
            PropertyValue::from_value(&json!({ "get_input": "port" })),
            PropertyValue::Function(FunctionCall::new("get_input", &["port"]))
        );
        assert!(matches!(
            PropertyValue::from_value(&json!({ "concat": ["a", { "get_attribute": ["HOST", "ip"] }] })),
            PropertyValue::Concat(parts) if parts.len() == 2
        ));
        assert!(matches!(
            PropertyValue::from_value(&json!({ "a": "b" })),
            PropertyValue::Complex(_)
        ));
        assert!(matches!(
            PropertyValue::from_value(&json!(["x", "y"])),
            PropertyValue::List(items) if items.len() == 2
        ));
        assert_eq!(
            PropertyValue::from_value(&Value::Null),
            PropertyValue::Other(Value::Null)
        );
    }

    #[test]
    fn requirement_shorthand_declares_a_relationship() {
        let topology = parse_topology(&json!({
            "node_templates": {
                "vm": { "type": "tosca.nodes.Compute" },
                "app": {
                    "type": "org.example.App",
                    "requirements": [ { "host": "vm" }, "logging" ]
                }
            }
        }))
        .unwrap();
        let app = topology.node("app").unwrap();
        assert_eq!(app.requirements, vec!["host".to_string(), "logging".to_string()]);
        let host = app.relationship_for("host").unwrap();
        assert_eq!(host.target, "vm");
        assert_eq!(host.relationship_type, HOSTED_ON);
        assert_eq!(host.id, "host_vm");
    }

    #[test]
    fn explicit_relationships_fill_requirements() {
        let topology = parse_topology(&json!({
            "node_templates": {
                "app": {
                    "type": "org.example.App",
                    "relationships": {
                        "db_link": { "type": "tosca.relationships.ConnectsTo", "target": "db", "requirement": "database" },
                        "on_vm": { "type": "tosca.relationships.HostedOn", "target": "vm" }
                    }
                }
            }
        }))
        .unwrap();
        let app = topology.node("app").unwrap();
        assert_eq!(app.requirements, vec!["database".to_string(), "host".to_string()]);
        assert_eq!(app.relationships[0].id, "db_link");
        assert_eq!(app.relationships[1].requirement_name, "host");
    }

    #[test]
    fn operations_keep_input_order() {
        let topology = parse_topology_str(
            r#"
node_templates:
  app:
    type: org.example.App
    interfaces:
      Standard:
        create:
          implementation: scripts/install.sh
          inputs:
            port: 3306
            db_user: martin
        start: scripts/start.sh
"#,
        )
        .unwrap();
        let iface = topology.node("app").unwrap().interface(&["Standard"]).unwrap();
        let create = &iface.operations[0];
        assert_eq!(create.name, "create");
        assert_eq!(
            create.implementation.as_ref().map(|art| art.reference.as_str()),
            Some("scripts/install.sh")
        );
        let names: Vec<_> = create.inputs.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["port", "db_user"]);
        assert!(iface.operations[1].is_effective());
    }

    #[test]
    fn groups_infer_decoration_kind() {
        let topology = parse_topology(&json!({
            "topology_template": {
                "node_templates": { "vm": { "type": "tosca.nodes.Compute" } },
                "groups": {
                    "placement": {
                        "members": ["vm"],
                        "policies": [
                            { "name": "location", "data": { "value": "aws-ec2:us-east-1" } },
                            { "name": "scaler", "data": { "type": "org.example.AutoScaler", "max": 3 } }
                        ]
                    }
                }
            }
        }))
        .unwrap();
        let group = &topology.groups[0];
        assert_eq!(group.members, vec!["vm".to_string()]);
        assert_eq!(group.decorations[0].kind, DecorationKind::Location);
        let scaler = &group.decorations[1];
        assert_eq!(scaler.kind, DecorationKind::Behavior);
        assert_eq!(scaler.behavior_type.as_deref(), Some("org.example.AutoScaler"));
        assert_eq!(scaler.data.get("max"), Some(&json!(3)));
        assert!(scaler.data.get("type").is_none());
    }

    #[test]
    fn node_without_type_is_rejected() {
        let err = parse_topology(&json!({ "node_templates": { "app": {} } })).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompileError>(),
            Some(CompileError::InvalidTopology(message)) if message.contains("app")
        ));
    }
}
