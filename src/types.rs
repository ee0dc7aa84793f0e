use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use serde_json::Value;

use crate::error::CompileError;
use crate::topology::{parse_artifact, parse_interfaces, ArtifactRef, Dependency, Interface, PropertyValue};

pub const COMPUTE_TYPE: &str = "tosca.nodes.Compute";

/// Everything the compiler needs to know about a node or relationship type,
/// with inherited definitions already folded in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeMetadata {
    pub name: String,
    /// Ancestors, nearest parent first.
    pub derived_from: Vec<String>,
    pub interfaces: Vec<Interface>,
    pub properties: BTreeMap<String, PropertyValue>,
    pub attributes: Vec<(String, Option<PropertyValue>)>,
    pub artifacts: Vec<(String, ArtifactRef)>,
}

impl TypeMetadata {
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_a(&self, type_name: &str) -> bool {
        self.name == type_name || self.derived_from.iter().any(|parent| parent == type_name)
    }
}

pub trait TypeLookup: Send + Sync {
    fn lookup(&self, type_name: &str, dependencies: &[Dependency]) -> Result<TypeMetadata>;
}

#[derive(Debug, Clone, Default)]
struct TypeEntry {
    archive: Option<Dependency>,
    parent: Option<String>,
    interfaces: Vec<Interface>,
    properties: BTreeMap<String, PropertyValue>,
    attributes: Vec<(String, Option<PropertyValue>)>,
    artifacts: Vec<(String, ArtifactRef)>,
}

/// In-memory type index. A type defined by several archives is resolved
/// against the topology's dependency set, falling back to the latest insert.
#[derive(Debug, Clone, Default)]
pub struct TypeIndex {
    entries: HashMap<String, Vec<TypeEntry>>,
}

fn property_default(definition: &Value) -> Option<PropertyValue> {
    match definition {
        Value::Object(map) if map.contains_key("default") => {
            map.get("default").map(PropertyValue::from_value)
        }
        Value::Object(map) if map.contains_key("type") || map.is_empty() => None,
        other => Some(PropertyValue::from_value(other)),
    }
}

fn merge_interfaces(base: &mut Vec<Interface>, overrides: &[Interface]) {
    for iface in overrides {
        match base.iter_mut().find(|existing| existing.name == iface.name) {
            Some(existing) => {
                for op in &iface.operations {
                    match existing.operations.iter_mut().find(|o| o.name == op.name) {
                        Some(slot) => *slot = op.clone(),
                        None => existing.operations.push(op.clone()),
                    }
                }
            }
            None => base.push(iface.clone()),
        }
    }
}

fn merge_named<T: Clone>(base: &mut Vec<(String, T)>, overrides: &[(String, T)]) {
    for (name, value) in overrides {
        match base.iter_mut().find(|(existing, _)| existing == name) {
            Some(slot) => slot.1 = value.clone(),
            None => base.push((name.clone(), value.clone())),
        }
    }
}

impl TypeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    /// Adds every `node_types` and `relationship_types` entry of a type document.
    pub fn merge_document(&mut self, doc: &Value) -> Result<()> {
        let root = doc
            .as_object()
            .ok_or_else(|| anyhow!("type document must be a map"))?;
        let archive = root.get("archive").and_then(|value| {
            let name = value.get("name")?.as_str()?.to_string();
            let version = match value.get("version")? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(Dependency { name, version })
        });
        for section in ["node_types", "relationship_types"] {
            let Some(types) = root.get(section) else {
                continue;
            };
            let types = types
                .as_object()
                .ok_or_else(|| anyhow!("{section} must be a map"))?;
            for (name, body) in types {
                let entry = Self::parse_entry(body, archive.clone());
                self.entries.entry(name.clone()).or_default().push(entry);
            }
        }
        Ok(())
    }

    fn parse_entry(body: &Value, archive: Option<Dependency>) -> TypeEntry {
        let properties = body
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .filter_map(|(name, def)| property_default(def).map(|value| (name.clone(), value)))
                    .collect()
            })
            .unwrap_or_default();
        let attributes = body
            .get("attributes")
            .and_then(Value::as_object)
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, def)| (name.clone(), property_default(def)))
                    .collect()
            })
            .unwrap_or_default();
        let artifacts = body
            .get("artifacts")
            .and_then(Value::as_object)
            .map(|arts| {
                arts.iter()
                    .filter_map(|(id, raw)| parse_artifact(raw).map(|art| (id.clone(), art)))
                    .collect()
            })
            .unwrap_or_default();
        TypeEntry {
            archive,
            parent: body
                .get("derived_from")
                .and_then(Value::as_str)
                .map(str::to_string),
            interfaces: parse_interfaces(body.get("interfaces")),
            properties,
            attributes,
            artifacts,
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(text).with_context(|| "invalid YAML type document")?;
        let mut index = Self::new();
        index.merge_document(&doc)?;
        Ok(index)
    }

    pub fn load(&mut self, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("unable to read type document: {}", path.display()))?;
        let doc: Value = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid YAML type document: {}", path.display()))?;
        self.merge_document(&doc)
            .with_context(|| format!("invalid type document: {}", path.display()))
    }

    fn select(&self, type_name: &str, dependencies: &[Dependency]) -> Option<&TypeEntry> {
        let candidates = self.entries.get(type_name)?;
        candidates
            .iter()
            .rev()
            .find(|entry| {
                entry
                    .archive
                    .as_ref()
                    .map(|archive| dependencies.contains(archive))
                    .unwrap_or(false)
            })
            .or_else(|| candidates.last())
    }
}

impl TypeLookup for TypeIndex {
    fn lookup(&self, type_name: &str, dependencies: &[Dependency]) -> Result<TypeMetadata> {
        let mut chain: Vec<&TypeEntry> = Vec::new();
        let mut derived_from = Vec::new();
        let mut current = Some(type_name.to_string());
        let mut seen = vec![type_name.to_string()];
        while let Some(name) = current.take() {
            let Some(entry) = self.select(&name, dependencies) else {
                break;
            };
            chain.push(entry);
            if let Some(parent) = &entry.parent {
                if seen.contains(parent) {
                    seen.push(parent.clone());
                    return Err(CompileError::CyclicTypeHierarchy { chain: seen }.into());
                }
                seen.push(parent.clone());
                derived_from.push(parent.clone());
                current = Some(parent.clone());
            }
        }

        let mut metadata = TypeMetadata {
            name: type_name.to_string(),
            derived_from,
            ..TypeMetadata::default()
        };
        for entry in chain.iter().rev() {
            merge_interfaces(&mut metadata.interfaces, &entry.interfaces);
            for (name, value) in &entry.properties {
                metadata.properties.insert(name.clone(), value.clone());
            }
            merge_named(&mut metadata.attributes, &entry.attributes);
            merge_named(&mut metadata.artifacts, &entry.artifacts);
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NORMATIVE: &str = r#"
archive: { name: normative, version: "1.0" }
node_types:
  tosca.nodes.Root:
    interfaces:
      Standard:
        create: scripts/root-create.sh
  tosca.nodes.Compute:
    derived_from: tosca.nodes.Root
    properties:
      mem_size: { type: integer, default: 1024 }
      os_arch: { type: string }
    attributes:
      ip_address: { type: string }
  org.example.BigCompute:
    derived_from: tosca.nodes.Compute
    properties:
      mem_size: { type: integer, default: 8192 }
    interfaces:
      Standard:
        start: scripts/start.sh
"#;

    #[test]
    fn inherited_definitions_fold_into_metadata() {
        let index = TypeIndex::from_yaml_str(NORMATIVE).unwrap();
        let meta = index.lookup("org.example.BigCompute", &[]).unwrap();
        assert_eq!(
            meta.derived_from,
            vec!["tosca.nodes.Compute".to_string(), "tosca.nodes.Root".to_string()]
        );
        assert!(meta.is_a(COMPUTE_TYPE));
        assert_eq!(meta.properties.get("mem_size"), Some(&PropertyValue::scalar("8192")));
        assert!(!meta.properties.contains_key("os_arch"));
        assert_eq!(meta.attributes, vec![("ip_address".to_string(), None)]);
        let ops: Vec<_> = meta.interfaces[0].operations.iter().map(|op| op.name.as_str()).collect();
        assert_eq!(ops, vec!["create", "start"]);
    }

    #[test]
    fn unknown_types_yield_bare_metadata() {
        let index = TypeIndex::new();
        let meta = index.lookup("org.example.Unknown", &[]).unwrap();
        assert_eq!(meta, TypeMetadata::bare("org.example.Unknown"));
    }

    #[test]
    fn dependency_set_picks_the_matching_archive() {
        let mut index = TypeIndex::from_yaml_str(
            "archive: { name: lib, version: \"1.0\" }\nnode_types:\n  org.example.Db: { derived_from: tosca.nodes.Root }\n",
        )
        .unwrap();
        index
            .merge_document(&serde_json::json!({
                "archive": { "name": "lib", "version": "2.0" },
                "node_types": { "org.example.Db": { "derived_from": "tosca.nodes.Compute" } }
            }))
            .unwrap();
        let v1 = Dependency {
            name: "lib".into(),
            version: "1.0".into(),
        };
        assert_eq!(
            index.lookup("org.example.Db", &[v1]).unwrap().derived_from,
            vec!["tosca.nodes.Root".to_string()]
        );
        assert_eq!(
            index.lookup("org.example.Db", &[]).unwrap().derived_from,
            vec!["tosca.nodes.Compute".to_string()]
        );
    }

    #[test]
    fn cyclic_derivation_is_reported() {
        let index = TypeIndex::from_yaml_str(
            "node_types:\n  a: { derived_from: b }\n  b: { derived_from: a }\n",
        )
        .unwrap();
        let err = index.lookup("a", &[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompileError>(),
            Some(CompileError::CyclicTypeHierarchy { chain }) if chain == &["a", "b", "a"]
        ));
    }
}
