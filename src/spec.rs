use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::expression::{Deferred, Resolution};
use crate::registry::Implementation;

/// Which runtime implementation a node compiles to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImplementationKind {
    /// A catalog registration matched the declared type.
    Registered { name: String },
    /// A compute node hosting several children.
    CoLocation,
    /// A compute node hosting at most one child.
    ApplicationRoot,
    Native { name: String },
    ScriptedProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSlot {
    Install,
    Configure,
    Launch,
    Stop,
    PreConfigure,
    PostConfigure,
    CheckRunning,
}

impl CommandSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandSlot::Install => "install",
            CommandSlot::Configure => "configure",
            CommandSlot::Launch => "launch",
            CommandSlot::Stop => "stop",
            CommandSlot::PreConfigure => "pre_configure",
            CommandSlot::PostConfigure => "post_configure",
            CommandSlot::CheckRunning => "check_running",
        }
    }
}

impl fmt::Display for CommandSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value placed on a spec: either known now or filled in at run time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Literal(Value),
    Deferred(Deferred),
}

impl ConfigValue {
    pub fn text(text: impl Into<String>) -> Self {
        ConfigValue::Literal(Value::String(text.into()))
    }

    pub fn from_resolution(resolution: Resolution) -> Option<Self> {
        match resolution {
            Resolution::Resolved(value) => Some(ConfigValue::Literal(value)),
            Resolution::Deferred(deferred) => Some(ConfigValue::Deferred(deferred)),
            Resolution::Unresolved => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            ConfigValue::Literal(value) => Some(value),
            ConfigValue::Deferred(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_literal().and_then(Value::as_str)
    }

    /// Maps merge, lists append, anything else is replaced.
    pub fn join(self, newer: ConfigValue) -> ConfigValue {
        match (self, newer) {
            (ConfigValue::Literal(Value::Object(mut old)), ConfigValue::Literal(Value::Object(new))) => {
                for (key, value) in new {
                    old.insert(key, value);
                }
                ConfigValue::Literal(Value::Object(old))
            }
            (ConfigValue::Literal(Value::Array(mut old)), ConfigValue::Literal(Value::Array(new))) => {
                old.extend(new);
                ConfigValue::Literal(Value::Array(old))
            }
            (_, newer) => newer,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Literal(Value::String(text)) => f.write_str(text),
            ConfigValue::Literal(value) => write!(f, "{value}"),
            ConfigValue::Deferred(deferred) => write!(f, "{deferred}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorCategory {
    Policy,
    Enricher,
    Initializer,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Behavior {
    pub name: String,
    pub category: BehaviorCategory,
    pub behavior_type: String,
    pub config: Map<String, Value>,
}

/// Files and environment a scripted process needs before install.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuntimeEnvironment {
    pub pre_install_commands: Vec<String>,
    /// Local source path to destination path.
    pub pre_install_files: BTreeMap<String, String>,
    pub shell_env: BTreeMap<String, String>,
}

impl RuntimeEnvironment {
    pub fn is_empty(&self) -> bool {
        self.pre_install_commands.is_empty()
            && self.pre_install_files.is_empty()
            && self.shell_env.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecNode {
    pub id: String,
    pub node_type: String,
    pub display_name: String,
    #[serde(flatten)]
    pub kind: ImplementationKind,
    pub properties: BTreeMap<String, ConfigValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, ConfigValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub passthrough: BTreeMap<String, ConfigValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub provisioning: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<CommandSlot, ConfigValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, ConfigValue>,
    #[serde(skip_serializing_if = "RuntimeEnvironment::is_empty")]
    pub runtime: RuntimeEnvironment,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub behaviors: Vec<Behavior>,
    pub children: Vec<SpecNode>,
    #[serde(skip)]
    pub config_keys: BTreeSet<String>,
    #[serde(skip)]
    pub scripted: bool,
}

impl SpecNode {
    pub fn new(kind: ImplementationKind, implementation: Implementation) -> Self {
        let scripted = implementation.scripted || kind == ImplementationKind::ScriptedProcess;
        Self {
            id: String::new(),
            node_type: String::new(),
            display_name: String::new(),
            kind,
            properties: BTreeMap::new(),
            config: implementation.config,
            passthrough: BTreeMap::new(),
            provisioning: BTreeMap::new(),
            commands: BTreeMap::new(),
            attributes: BTreeMap::new(),
            runtime: RuntimeEnvironment::default(),
            locations: Vec::new(),
            behaviors: Vec::new(),
            children: Vec::new(),
            config_keys: implementation.config_keys,
            scripted,
        }
    }

    /// Routes a key to the typed config when the implementation declares it,
    /// otherwise to the pass-through map. A key set twice is joined.
    pub fn put_config(&mut self, key: impl Into<String>, value: ConfigValue) {
        let key = key.into();
        let target = if self.config_keys.contains(&key) || self.config.contains_key(&key) {
            &mut self.config
        } else {
            &mut self.passthrough
        };
        let joined = match target.remove(&key) {
            Some(old) => old.join(value),
            None => value,
        };
        target.insert(key, joined);
    }

    /// Pass-through entries overlaid by typed entries.
    pub fn effective_config(&self) -> BTreeMap<String, ConfigValue> {
        let mut merged = self.passthrough.clone();
        for (key, value) in &self.config {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn command(&self, slot: CommandSlot) -> Option<&ConfigValue> {
        self.commands.get(&slot)
    }

    pub fn command_text(&self, slot: CommandSlot) -> Option<String> {
        self.command(slot).map(ConfigValue::to_string)
    }

    pub fn find(&self, id: &str) -> Option<&SpecNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut SpecNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(id))
    }

    pub fn child_ids(&self) -> Vec<&str> {
        self.children.iter().map(|child| child.id.as_str()).collect()
    }
}

/// The compiled topology: one entry per containment root, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecTree {
    pub name: String,
    pub roots: Vec<SpecNode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub behaviors: Vec<Behavior>,
}

impl SpecTree {
    pub fn root(&self, id: &str) -> Option<&SpecNode> {
        self.roots.iter().find(|root| root.id == id)
    }

    pub fn find(&self, id: &str) -> Option<&SpecNode> {
        self.roots.iter().find_map(|root| root.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut SpecNode> {
        self.roots.iter_mut().find_map(|root| root.find_mut(id))
    }

    pub fn node_count(&self) -> usize {
        fn count(node: &SpecNode) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        self.roots.iter().map(count).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
