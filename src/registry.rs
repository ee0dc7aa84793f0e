use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::spec::{BehaviorCategory, ConfigValue};
use crate::topology::NodeTemplate;

/// What a factory contributes to a freshly selected spec.
#[derive(Debug, Clone, Default)]
pub struct Implementation {
    /// Keys routed to typed config instead of the pass-through map.
    pub config_keys: BTreeSet<String>,
    pub config: BTreeMap<String, ConfigValue>,
    /// Compile lifecycle scripts onto this spec as for a scripted process.
    pub scripted: bool,
}

impl Implementation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted() -> Self {
        Self {
            scripted: true,
            ..Self::default()
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
        let key = key.into();
        self.config_keys.insert(key.clone());
        self.config.insert(key, value);
        self
    }
}

pub trait SpecFactory: Send + Sync {
    fn create(&self, node: &NodeTemplate) -> Result<Implementation>;
}

impl<F> SpecFactory for F
where
    F: Fn(&NodeTemplate) -> Result<Implementation> + Send + Sync + 'static,
{
    fn create(&self, node: &NodeTemplate) -> Result<Implementation> {
        (self)(node)
    }
}

struct RegistryInner {
    catalog: HashMap<String, Arc<dyn SpecFactory>>,
    natives: HashMap<String, Arc<dyn SpecFactory>>,
    bindings: HashMap<String, String>,
    behaviors: HashMap<String, BehaviorCategory>,
}

impl RegistryInner {
    fn new() -> Self {
        Self {
            catalog: HashMap::new(),
            natives: HashMap::new(),
            bindings: HashMap::new(),
            behaviors: HashMap::new(),
        }
    }
}

/// Explicit name to factory registry consulted by the type selector.
///
/// Clones share the same underlying tables.
pub struct Registry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn find_entry(
    table: &HashMap<String, Arc<dyn SpecFactory>>,
    bindings: &HashMap<String, String>,
    name: &str,
) -> Option<(String, Arc<dyn SpecFactory>)> {
    if let Some(factory) = table.get(name) {
        return Some((name.to_string(), factory.clone()));
    }
    let binding = bindings.get(name)?;
    if binding == name {
        return None;
    }
    table
        .get(binding)
        .map(|factory| (binding.clone(), factory.clone()))
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::new())),
        }
    }

    /// Registers a catalog entry under a type name, or `type:version`.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: SpecFactory + 'static,
    {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.catalog.insert(name.into(), Arc::new(factory));
    }

    pub fn register_native<F>(&self, name: impl Into<String>, factory: F)
    where
        F: SpecFactory + 'static,
    {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.natives.insert(name.into(), Arc::new(factory));
    }

    pub fn set_binding(&self, alias: impl Into<String>, implementation: impl Into<String>) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.bindings.insert(alias.into(), implementation.into());
    }

    pub fn register_behavior(&self, behavior_type: impl Into<String>, category: BehaviorCategory) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.behaviors.insert(behavior_type.into(), category);
    }

    /// Catalog lookup: `type:version` first, then the bare type, each
    /// directly or through a binding. Returns the matched registration name.
    pub fn find_catalog(
        &self,
        type_name: &str,
        version: Option<&str>,
    ) -> Option<(String, Arc<dyn SpecFactory>)> {
        let inner = self.inner.lock().expect("registry poisoned");
        if let Some(version) = version.filter(|v| !v.is_empty()) {
            let versioned = format!("{type_name}:{version}");
            if let Some(found) = find_entry(&inner.catalog, &inner.bindings, &versioned) {
                return Some(found);
            }
        }
        find_entry(&inner.catalog, &inner.bindings, type_name)
    }

    pub fn find_native(&self, name: &str) -> Option<(String, Arc<dyn SpecFactory>)> {
        let inner = self.inner.lock().expect("registry poisoned");
        find_entry(&inner.natives, &inner.bindings, name)
    }

    pub fn behavior_category(&self, behavior_type: &str) -> Option<BehaviorCategory> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .behaviors
            .get(behavior_type)
            .or_else(|| {
                inner
                    .bindings
                    .get(behavior_type)
                    .and_then(|bound| inner.behaviors.get(bound))
            })
            .copied()
    }
}
