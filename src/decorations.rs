use anyhow::Result;
use serde_json::{json, Map, Value};

use crate::error::CompileError;
use crate::logging::Logger;
use crate::registry::Registry;
use crate::spec::{Behavior, BehaviorCategory, SpecTree};
use crate::topology::{Decoration, DecorationKind, Group, Topology};

fn location_values(data: &Map<String, Value>) -> Vec<Value> {
    match data.get("value").or_else(|| data.get("location")) {
        Some(Value::Array(items)) => items.clone(),
        Some(value) => vec![value.clone()],
        None if data.is_empty() => Vec::new(),
        None => vec![Value::Object(data.clone())],
    }
}

fn behavior_for(
    group: &Group,
    decoration: &Decoration,
    registry: &Registry,
    log: &mut Logger,
) -> Result<Behavior> {
    let behavior_type = decoration
        .behavior_type
        .clone()
        .filter(|ty| !ty.trim().is_empty())
        .ok_or_else(|| CompileError::MissingBehaviorType {
            group: group.name.clone(),
            decoration: decoration.name.clone(),
        })?;
    let category = match registry.behavior_category(&behavior_type) {
        Some(category) => category,
        None => {
            log.warn(
                format!("behavior type {behavior_type} is not registered; attaching as policy"),
                Some(json!({ "group": group.name, "type": behavior_type })),
            );
            BehaviorCategory::Policy
        }
    };
    Ok(Behavior {
        name: decoration.name.clone(),
        category,
        behavior_type,
        config: decoration.data.clone(),
    })
}

/// Applies group locations and behaviors to the finished tree by node id.
pub fn apply_group_decorations(
    tree: &mut SpecTree,
    topology: &Topology,
    registry: &Registry,
    log: &mut Logger,
) -> Result<()> {
    for group in &topology.groups {
        for member in &group.members {
            if tree.find(member).is_none() {
                return Err(CompileError::UnknownGroupMember {
                    group: group.name.clone(),
                    id: member.clone(),
                }
                .into());
            }
        }
        for decoration in &group.decorations {
            match decoration.kind {
                DecorationKind::Location => {
                    let locations = location_values(&decoration.data);
                    for member in &group.members {
                        if let Some(spec) = tree.find_mut(member) {
                            spec.locations = locations.clone();
                        }
                    }
                }
                DecorationKind::Behavior => {
                    let behavior = behavior_for(group, decoration, registry, log)?;
                    if group.members.is_empty() {
                        tree.behaviors.push(behavior);
                        continue;
                    }
                    for member in &group.members {
                        if let Some(spec) = tree.find_mut(member) {
                            spec.behaviors.push(behavior.clone());
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_data_shapes() {
        let single = json!({ "value": "aws-ec2:us-east-1" });
        assert_eq!(
            location_values(single.as_object().unwrap()),
            vec![json!("aws-ec2:us-east-1")]
        );
        let many = json!({ "value": ["a", "b"] });
        assert_eq!(location_values(many.as_object().unwrap()).len(), 2);
        let inline = json!({ "provider": "localhost" });
        assert_eq!(location_values(inline.as_object().unwrap()), vec![inline.clone()]);
        assert!(location_values(&Map::new()).is_empty());
    }
}
