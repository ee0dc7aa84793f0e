pub mod artifacts;
pub mod assembler;
pub mod config;
pub mod context;
pub mod decorations;
pub mod error;
pub mod expression;
pub mod graph;
pub mod keywords;
pub mod lifecycle;
pub mod logging;
pub mod node_config;
pub mod registry;
pub mod selector;
pub mod spec;
pub mod topology;
pub mod types;

pub use artifacts::{ArchiveRepository, ArtifactResolver, DefaultResourceLoader, FileArchiveRepository, ResourceLoader};
pub use assembler::SpecAssembler;
pub use config::CompilerConfig;
pub use error::CompileError;
pub use expression::{AttributeRef, Deferred, FormatString, Resolution};
pub use registry::{Implementation, Registry, SpecFactory};
pub use spec::{CommandSlot, ConfigValue, ImplementationKind, SpecNode, SpecTree};
pub use topology::{load_topology, parse_topology, parse_topology_str, Topology};
pub use types::{TypeIndex, TypeLookup, TypeMetadata};
