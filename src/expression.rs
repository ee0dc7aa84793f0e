use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};

use crate::context::CompileContext;
use crate::keywords::{is_keyword, node_scope, Scope};
use crate::topology::{FunctionCall, NodeTemplate, PropertyValue};

/// A runtime attribute of a node, read once the node is running.
/// `node` is always the template id, matching `SpecNode::id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeRef {
    pub node: String,
    pub attribute: String,
}

impl AttributeRef {
    pub fn new(node: &NodeTemplate, attribute: &str) -> Self {
        Self {
            node: node.id.clone(),
            attribute: attribute.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FormatPart {
    Text(String),
    Attribute(AttributeRef),
}

/// Text with attribute gaps, filled positionally at run time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormatString {
    pub parts: Vec<FormatPart>,
}

impl FormatString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(FormatPart::Text(last)) = self.parts.last_mut() {
            last.push_str(text);
            return;
        }
        self.parts.push(FormatPart::Text(text.to_string()));
    }

    pub fn push_attribute(&mut self, attribute: AttributeRef) {
        self.parts.push(FormatPart::Attribute(attribute));
    }

    pub fn append(&mut self, other: FormatString) {
        for part in other.parts {
            match part {
                FormatPart::Text(text) => self.push_text(&text),
                FormatPart::Attribute(attribute) => self.push_attribute(attribute),
            }
        }
    }

    /// Appends the textual form of a resolution; unresolved contributes nothing.
    pub fn push_resolution(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Resolved(value) => self.push_text(&value_text(&value)),
            Resolution::Deferred(Deferred::Attribute(attribute)) => self.push_attribute(attribute),
            Resolution::Deferred(Deferred::Format(format)) => self.append(format),
            Resolution::Unresolved => {}
        }
    }

    pub fn is_literal(&self) -> bool {
        self.parts
            .iter()
            .all(|part| matches!(part, FormatPart::Text(_)))
    }

    pub fn attributes(&self) -> impl Iterator<Item = &AttributeRef> {
        self.parts.iter().filter_map(|part| match part {
            FormatPart::Attribute(attribute) => Some(attribute),
            FormatPart::Text(_) => None,
        })
    }

    pub fn into_resolution(self) -> Resolution {
        if self.is_literal() {
            Resolution::Resolved(Value::String(self.to_string()))
        } else {
            Resolution::Deferred(Deferred::Format(self))
        }
    }
}

impl fmt::Display for FormatString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.parts {
            match part {
                FormatPart::Text(text) => f.write_str(text)?,
                FormatPart::Attribute(attr) => write!(f, "$[{}.{}]", attr.node, attr.attribute)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "deferred", rename_all = "snake_case")]
pub enum Deferred {
    Attribute(AttributeRef),
    Format(FormatString),
}

impl fmt::Display for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferred::Attribute(attr) => write!(f, "$[{}.{}]", attr.node, attr.attribute),
            Deferred::Format(format) => write!(f, "{format}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Value),
    Deferred(Deferred),
    Unresolved,
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Resolution::Resolved(value) => Some(value),
            _ => None,
        }
    }
}

/// Strings render bare, everything else as compact JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Evaluates a property value. Never fails: anything that cannot be
/// evaluated is unresolved, with a warning where the input is suspicious.
pub fn resolve(ctx: &mut CompileContext<'_>, value: &PropertyValue, scope: &Scope) -> Resolution {
    match value {
        PropertyValue::Scalar(text) => Resolution::Resolved(Value::String(text.clone())),
        PropertyValue::Complex(map) => Resolution::Resolved(Value::Object(map.clone())),
        PropertyValue::List(items) => Resolution::Resolved(Value::Array(items.clone())),
        PropertyValue::Concat(parts) => {
            let mut format = FormatString::new();
            for part in parts {
                let resolved = resolve(ctx, part, scope);
                format.push_resolution(resolved);
            }
            format.into_resolution()
        }
        PropertyValue::Function(call) => resolve_function(ctx, call, scope),
        PropertyValue::Other(raw) => {
            ctx.log.warn(
                "unrecognized property value",
                Some(json!({ "value": raw })),
            );
            Resolution::Unresolved
        }
    }
}

/// Bound keywords go straight to their node id. Unbound keywords name
/// nothing. Plain keys match an id first, then a display name.
fn entity<'a>(ctx: &CompileContext<'a>, scope: &Scope, key: &str) -> Option<&'a NodeTemplate> {
    match scope.get(key) {
        Some(id) => ctx.index.node(id),
        None if is_keyword(key) => None,
        None => ctx.index.node_by_id_or_name(key),
    }
}

fn requirement_target<'a>(
    ctx: &mut CompileContext<'a>,
    node: &'a NodeTemplate,
    requirement: &str,
) -> Option<&'a NodeTemplate> {
    let target = node
        .relationship_for(requirement)
        .and_then(|rel| ctx.index.node(&rel.target));
    if target.is_none() {
        ctx.log.debug(
            "requirement has no resolvable target",
            Some(json!({ "node": node.id, "requirement": requirement })),
        );
    }
    target
}

fn resolve_function(ctx: &mut CompileContext<'_>, call: &FunctionCall, scope: &Scope) -> Resolution {
    match call.name.as_str() {
        "get_property" => match call.args.as_slice() {
            [entity_key, property] => {
                let Some(node) = entity(ctx, scope, entity_key) else {
                    return missing_node(ctx, call, entity_key);
                };
                node_property(ctx, &node.id, property)
            }
            [entity_key, requirement, property] => {
                let Some(node) = entity(ctx, scope, entity_key) else {
                    return missing_node(ctx, call, entity_key);
                };
                match requirement_target(ctx, node, requirement) {
                    Some(target) => node_property(ctx, &target.id, property),
                    None => Resolution::Unresolved,
                }
            }
            _ => bad_arity(ctx, call),
        },
        "get_attribute" => match call.args.as_slice() {
            [entity_key, attribute] => {
                let reference = match entity(ctx, scope, entity_key) {
                    Some(node) => AttributeRef::new(node, attribute),
                    None => {
                        missing_node(ctx, call, entity_key);
                        AttributeRef {
                            node: entity_key.clone(),
                            attribute: attribute.clone(),
                        }
                    }
                };
                Resolution::Deferred(Deferred::Attribute(reference))
            }
            [entity_key, requirement, attribute] => {
                let Some(node) = entity(ctx, scope, entity_key) else {
                    return missing_node(ctx, call, entity_key);
                };
                match requirement_target(ctx, node, requirement) {
                    Some(target) => {
                        Resolution::Deferred(Deferred::Attribute(AttributeRef::new(target, attribute)))
                    }
                    None => Resolution::Unresolved,
                }
            }
            _ => bad_arity(ctx, call),
        },
        other => {
            ctx.log.warn(
                format!("unsupported function {other}"),
                Some(json!({ "function": other, "args": call.args })),
            );
            Resolution::Unresolved
        }
    }
}

fn missing_node(ctx: &mut CompileContext<'_>, call: &FunctionCall, key: &str) -> Resolution {
    ctx.log.debug(
        format!("{} references unknown node {key}", call.name),
        Some(json!({ "function": call.name, "node": key })),
    );
    Resolution::Unresolved
}

fn bad_arity(ctx: &mut CompileContext<'_>, call: &FunctionCall) -> Resolution {
    ctx.log.warn(
        format!("{} called with {} arguments", call.name, call.args.len()),
        Some(json!({ "function": call.name, "args": call.args })),
    );
    Resolution::Unresolved
}

/// The node's own value for a property, falling back to its type default.
pub fn raw_property(ctx: &CompileContext<'_>, node_id: &str, property: &str) -> Option<PropertyValue> {
    let node = ctx.index.node(node_id)?;
    if let Some(value) = node.properties.get(property) {
        return Some(value.clone());
    }
    ctx.type_metadata(&node.node_type)
        .properties
        .get(property)
        .cloned()
}

/// Resolves one property of a node in that node's own scope, memoized per pass.
pub fn node_property(ctx: &mut CompileContext<'_>, node_id: &str, property: &str) -> Resolution {
    let key = (node_id.to_string(), property.to_string());
    if let Some(memo) = ctx.property_memo.get(&key) {
        return memo.clone();
    }
    if ctx.resolving.contains(&key) {
        ctx.log.warn(
            "cyclic get_property reference",
            Some(json!({ "node": node_id, "property": property })),
        );
        return Resolution::Unresolved;
    }
    let Some(raw) = raw_property(ctx, node_id, property) else {
        return Resolution::Unresolved;
    };
    let scope = node_scope(&ctx.index, node_id);
    ctx.resolving.push(key.clone());
    let resolution = resolve(ctx, &raw, &scope);
    ctx.resolving.pop();
    ctx.property_memo.insert(key, resolution.clone());
    resolution
}

/// Every property of a node, merged with type defaults, in name order.
pub fn node_properties(ctx: &mut CompileContext<'_>, node_id: &str) -> BTreeMap<String, Resolution> {
    let Some(node) = ctx.index.node(node_id) else {
        return BTreeMap::new();
    };
    let mut names: Vec<String> = ctx
        .type_metadata(&node.node_type)
        .properties
        .keys()
        .cloned()
        .collect();
    for name in node.properties.keys() {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let resolution = node_property(ctx, node_id, &name);
            (name, resolution)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(node: &str, attribute: &str) -> AttributeRef {
        AttributeRef {
            node: node.into(),
            attribute: attribute.into(),
        }
    }

    #[test]
    fn adjacent_text_merges() {
        let mut format = FormatString::new();
        format.push_text("http://");
        format.push_attribute(attr("vm", "ip"));
        format.push_text(":");
        format.push_text("8080");
        assert_eq!(format.parts.len(), 3);
        assert_eq!(format.to_string(), "http://$[vm.ip]:8080");
        assert!(!format.is_literal());
    }

    #[test]
    fn literal_formats_collapse_to_text() {
        let mut format = FormatString::new();
        format.push_resolution(Resolution::Resolved(json!("a")));
        format.push_resolution(Resolution::Unresolved);
        format.push_resolution(Resolution::Resolved(json!(42)));
        assert_eq!(format.into_resolution(), Resolution::Resolved(json!("a42")));
    }

    #[test]
    fn deferred_serializes_with_tag() {
        let deferred = Deferred::Attribute(attr("vm", "ip"));
        assert_eq!(
            serde_json::to_value(&deferred).unwrap(),
            json!({ "deferred": "attribute", "node": "vm", "attribute": "ip" })
        );
    }
}
