use thiserror::Error;

/// Structural failures that abort a compilation pass.
///
/// Functions in this crate return `anyhow::Result`; these variants are raised
/// through it so callers can `downcast_ref::<CompileError>()` and recover the
/// offending id.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("node not found: {id}{}", .referenced_by.as_ref().map(|by| format!(" (referenced by {by})")).unwrap_or_default())]
    NodeNotFound {
        id: String,
        referenced_by: Option<String>,
    },

    #[error("cyclic host relationship: {}", .chain.join(" -> "))]
    CyclicHost { chain: Vec<String> },

    #[error("group {group} references unknown member {id}")]
    UnknownGroupMember { group: String, id: String },

    #[error("behavior {decoration} in group {group} does not declare a type")]
    MissingBehaviorType { group: String, decoration: String },

    #[error("unable to resolve artifact {reference} for node {node}: {detail}")]
    ArtifactNotFound {
        node: String,
        reference: String,
        detail: String,
    },

    #[error("relationship {relationship} on node {node} is invalid: {reason}")]
    InvalidRelationship {
        node: String,
        relationship: String,
        reason: String,
    },

    #[error("cyclic derived_from chain for type {}", .chain.join(" -> "))]
    CyclicTypeHierarchy { chain: Vec<String> },

    #[error("invalid topology: {0}")]
    InvalidTopology(String),
}

impl CompileError {
    pub fn node_not_found(id: impl Into<String>) -> Self {
        CompileError::NodeNotFound {
            id: id.into(),
            referenced_by: None,
        }
    }

    pub fn referenced_node_not_found(id: impl Into<String>, by: impl Into<String>) -> Self {
        CompileError::NodeNotFound {
            id: id.into(),
            referenced_by: Some(by.into()),
        }
    }
}
