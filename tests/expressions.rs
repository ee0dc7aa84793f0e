use anyhow::Result;
use serde_json::json;
use tosca_spec_rs::context::CompileContext;
use tosca_spec_rs::expression::{node_properties, node_property, resolve};
use tosca_spec_rs::keywords::{node_scope, relationship_scope, Scope};
use tosca_spec_rs::logging::{messages_at, Level};
use tosca_spec_rs::topology::PropertyValue;
use tosca_spec_rs::{
    parse_topology_str, ArtifactResolver, AttributeRef, CompilerConfig, DefaultResourceLoader,
    Deferred, FileArchiveRepository, Registry, Resolution, TypeIndex,
};

const TOPOLOGY: &str = r#"
node_templates:
  vm:
    type: tosca.nodes.Compute
    name: backend
  db:
    type: org.example.Database
    requirements: [ { host: vm } ]
    properties:
      port: 3306
      user: { get_property: [SELF, owner] }
      owner: martin
      settings: { charset: utf8 }
      replicas: [a, b]
      nothing: ~
  web:
    type: org.example.Web
    requirements:
      - host: vm
      - database: db
    properties:
      url: { concat: ["mysql://", { get_attribute: [HOST, ip_address] }, ":", { get_property: [db, port] }] }
      label: { concat: ["db-", { get_property: [SELF, database, port] }] }
      db_host: { get_attribute: [SELF, database, ip_address] }
      token: { get_input: token }
      ping: { get_attribute: [HOST] }
  loop:
    type: org.example.Loop
    properties:
      a: { get_property: [SELF, b] }
      b: { get_property: [SELF, a] }
"#;

const TYPES: &str = r#"
node_types:
  org.example.Database:
    properties:
      port: { type: integer, default: 5432 }
      engine: { type: string, default: mysql }
"#;

fn with_context<T>(f: impl FnOnce(&mut CompileContext<'_>) -> T) -> Result<T> {
    let topology = parse_topology_str(TOPOLOGY)?;
    let types = TypeIndex::from_yaml_str(TYPES)?;
    let registry = Registry::new();
    let artifacts = ArtifactResolver::new(
        FileArchiveRepository::new("/nonexistent"),
        DefaultResourceLoader::default(),
        "expanded",
    );
    let config = CompilerConfig::default();
    let mut ctx = CompileContext::new(&topology, &types, &registry, &artifacts, &config)?;
    Ok(f(&mut ctx))
}

fn attribute(node: &str, attribute: &str) -> Resolution {
    Resolution::Deferred(Deferred::Attribute(AttributeRef {
        node: node.into(),
        attribute: attribute.into(),
    }))
}

#[test]
fn literal_properties_round_trip() -> Result<()> {
    with_context(|ctx| {
        assert_eq!(node_property(ctx, "db", "port"), Resolution::Resolved(json!("3306")));
        assert_eq!(
            node_property(ctx, "db", "settings"),
            Resolution::Resolved(json!({ "charset": "utf8" }))
        );
        assert_eq!(node_property(ctx, "db", "replicas"), Resolution::Resolved(json!(["a", "b"])));
        assert_eq!(node_property(ctx, "db", "engine"), Resolution::Resolved(json!("mysql")));
        assert_eq!(node_property(ctx, "db", "absent"), Resolution::Unresolved);
    })
}

#[test]
fn self_references_resolve_in_the_owner_scope() -> Result<()> {
    with_context(|ctx| {
        assert_eq!(node_property(ctx, "db", "user"), Resolution::Resolved(json!("martin")));
    })
}

#[test]
fn host_attributes_defer_to_the_root_id() -> Result<()> {
    with_context(|ctx| {
        let scope = node_scope(&ctx.index, "web");
        let value = PropertyValue::from_value(&json!({ "get_attribute": ["HOST", "ip_address"] }));
        assert_eq!(resolve(ctx, &value, &scope), attribute("vm", "ip_address"));
    })
}

#[test]
fn concat_with_attributes_becomes_a_format_string() -> Result<()> {
    with_context(|ctx| {
        let url = node_property(ctx, "web", "url");
        let Resolution::Deferred(Deferred::Format(format)) = &url else {
            panic!("expected a format string, got {url:?}");
        };
        assert_eq!(format.to_string(), "mysql://$[vm.ip_address]:3306");
        assert_eq!(format.attributes().count(), 1);
        assert_eq!(node_property(ctx, "web", "label"), Resolution::Resolved(json!("db-3306")));
    })
}

#[test]
fn requirement_forms_follow_the_relationship() -> Result<()> {
    with_context(|ctx| {
        assert_eq!(node_property(ctx, "web", "db_host"), attribute("db", "ip_address"));
    })
}

#[test]
fn unsupported_functions_resolve_to_nothing_with_a_warning() -> Result<()> {
    with_context(|ctx| {
        assert_eq!(node_property(ctx, "web", "token"), Resolution::Unresolved);
        assert_eq!(node_property(ctx, "web", "ping"), Resolution::Unresolved);
        assert_eq!(node_property(ctx, "db", "nothing"), Resolution::Unresolved);
        let warnings = messages_at(ctx.log.entries(), Level::Warn);
        assert!(warnings.contains(&"unsupported function get_input".to_string()));
        assert!(warnings.contains(&"get_attribute called with 1 arguments".to_string()));
        assert!(warnings.contains(&"unrecognized property value".to_string()));
    })
}

#[test]
fn cyclic_property_references_are_cut() -> Result<()> {
    with_context(|ctx| {
        assert_eq!(node_property(ctx, "loop", "a"), Resolution::Unresolved);
        assert!(messages_at(ctx.log.entries(), Level::Warn)
            .contains(&"cyclic get_property reference".to_string()));
    })
}

#[test]
fn node_properties_merge_type_defaults_in_name_order() -> Result<()> {
    with_context(|ctx| {
        let names: Vec<String> = node_properties(ctx, "db").into_keys().collect();
        assert_eq!(
            names,
            vec!["engine", "nothing", "owner", "port", "replicas", "settings", "user"]
        );
    })
}

#[test]
fn relationship_scope_exposes_source_and_target() -> Result<()> {
    with_context(|ctx| {
        let web = ctx.index.node("web").unwrap();
        let edge = web.relationship_for("database").unwrap().clone();
        let scope = relationship_scope(&ctx.index, "web", &edge);
        let value = PropertyValue::from_value(&json!({
            "concat": [{ "get_property": ["TARGET", "port"] }, "/", { "get_attribute": ["SOURCE", "ip_address"] }]
        }));
        let resolved = resolve(ctx, &value, &scope);
        assert_eq!(
            resolved,
            Resolution::Deferred(Deferred::Format({
                let mut format = tosca_spec_rs::FormatString::new();
                format.push_text("3306/");
                format.push_attribute(AttributeRef {
                    node: "web".into(),
                    attribute: "ip_address".into(),
                });
                format
            }))
        );
    })
}

#[test]
fn unknown_entities_are_unresolved() -> Result<()> {
    with_context(|ctx| {
        let value = PropertyValue::from_value(&json!({ "get_property": ["ghost", "port"] }));
        assert_eq!(resolve(ctx, &value, &Scope::new()), Resolution::Unresolved);
    })
}

fn context_for<T>(topology: &str, f: impl FnOnce(&mut CompileContext<'_>) -> T) -> Result<T> {
    let topology = parse_topology_str(topology)?;
    let types = TypeIndex::new();
    let registry = Registry::new();
    let artifacts = ArtifactResolver::new(
        FileArchiveRepository::new("/nonexistent"),
        DefaultResourceLoader::default(),
        "expanded",
    );
    let config = CompilerConfig::default();
    let mut ctx = CompileContext::new(&topology, &types, &registry, &artifacts, &config)?;
    Ok(f(&mut ctx))
}

#[test]
fn shared_display_names_keep_hosts_apart() -> Result<()> {
    let yaml = r#"
node_templates:
  vm_a: { type: tosca.nodes.Compute, name: server, properties: { zone: east } }
  vm_b: { type: tosca.nodes.Compute, name: server, properties: { zone: west } }
  app_a:
    type: x
    requirements: [ { host: vm_a } ]
    properties: { zone: { get_property: [HOST, zone] } }
  app_b:
    type: x
    requirements: [ { host: vm_b } ]
    properties:
      zone: { get_property: [HOST, zone] }
      ip: { get_attribute: [HOST, ip_address] }
"#;
    context_for(yaml, |ctx| {
        assert_eq!(node_property(ctx, "app_a", "zone"), Resolution::Resolved(json!("east")));
        assert_eq!(node_property(ctx, "app_b", "zone"), Resolution::Resolved(json!("west")));
        assert_eq!(node_property(ctx, "app_b", "ip"), attribute("vm_b", "ip_address"));
    })
}

#[test]
fn ids_win_over_display_names() -> Result<()> {
    let yaml = r#"
node_templates:
  db: { type: x, name: database, properties: { port: 5432 } }
  other: { type: x, name: db, properties: { port: 9999 } }
  web:
    type: x
    requirements: [ { database: db } ]
    properties:
      by_id: { get_property: [db, port] }
      by_name: { get_property: [database, port] }
"#;
    context_for(yaml, |ctx| {
        assert_eq!(node_property(ctx, "web", "by_id"), Resolution::Resolved(json!("5432")));
        assert_eq!(node_property(ctx, "web", "by_name"), Resolution::Resolved(json!("5432")));

        let web = ctx.index.node("web").unwrap();
        let edge = web.relationship_for("database").unwrap().clone();
        let scope = relationship_scope(&ctx.index, "web", &edge);
        let value = PropertyValue::from_value(&json!({ "get_property": ["TARGET", "port"] }));
        assert_eq!(resolve(ctx, &value, &scope), Resolution::Resolved(json!("5432")));
    })
}

#[test]
fn every_attribute_form_references_the_node_id() -> Result<()> {
    let yaml = r#"
node_templates:
  vm: { type: tosca.nodes.Compute, name: backend }
  db:
    type: x
    name: database
    requirements: [ { host: vm } ]
  web:
    type: x
    name: frontend
    requirements:
      - host: vm
      - database: db
"#;
    context_for(yaml, |ctx| {
        let web = ctx.index.node("web").unwrap();
        let edge = web.relationship_for("database").unwrap().clone();
        let node = node_scope(&ctx.index, "web");
        let relationship = relationship_scope(&ctx.index, "web", &edge);
        let cases = [
            (json!(["SELF", "pid"]), &node, attribute("web", "pid")),
            (json!(["HOST", "ip"]), &node, attribute("vm", "ip")),
            (json!(["SOURCE", "ip"]), &relationship, attribute("web", "ip")),
            (json!(["TARGET", "ip"]), &relationship, attribute("db", "ip")),
            (json!(["db", "ip"]), &node, attribute("db", "ip")),
            (json!(["database", "ip"]), &node, attribute("db", "ip")),
            (json!(["SELF", "database", "ip"]), &node, attribute("db", "ip")),
        ];
        for (args, scope, expected) in cases {
            let value = PropertyValue::from_value(&json!({ "get_attribute": args.clone() }));
            assert_eq!(resolve(ctx, &value, scope), expected, "{args}");
        }
    })
}

#[test]
fn unknown_attribute_entities_keep_their_key() -> Result<()> {
    with_context(|ctx| {
        let value = PropertyValue::from_value(&json!({ "get_attribute": ["ghost", "ip"] }));
        assert_eq!(resolve(ctx, &value, &Scope::new()), attribute("ghost", "ip"));
        let unbound = PropertyValue::from_value(&json!({ "get_property": ["HOST", "port"] }));
        assert_eq!(resolve(ctx, &unbound, &Scope::new()), Resolution::Unresolved);
    })
}
