use ace::core::AceError;
use ace::core::cluster::ClusterSpec;
use serde_json::json;

fn write_cluster(dir: &tempfile::TempDir, name: &str, body: serde_json::Value) {
    std::fs::write(
        dir.path().join(format!("{name}.json")),
        serde_json::to_string_pretty(&body).unwrap(),
    )
    .unwrap();
}

fn demo_cluster() -> serde_json::Value {
    json!({
        "cluster_name": "demo",
        "databases": [
            {"db_name": "appdb", "db_user": "ace", "db_password": "secret"},
            {"db_name": "otherdb", "db_user": "ace", "db_password": "secret"}
        ],
        "nodes": [
            {"name": "n1", "host": "10.0.0.1", "port": 5432},
            {"name": "n2", "host": "10.0.0.2", "port": 5433},
            {"name": "n3", "host": "10.0.0.3", "port": 5432, "is_active": false}
        ]
    })
}

#[test]
fn test_load_resolves_nodes_with_database_credentials() {
    let dir = tempfile::tempdir().unwrap();
    write_cluster(&dir, "demo", demo_cluster());

    let spec = ClusterSpec::load(dir.path().to_str().unwrap(), "demo").unwrap();
    let nodes = spec.resolve(None, "all").unwrap();

    // Inactive nodes are excluded; the first database is the default.
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].name, "n1");
    assert_eq!(nodes[0].dbname, "appdb");
    assert_eq!(nodes[0].user, "ace");
    assert_eq!(nodes[1].port, 5433);
}

#[test]
fn test_named_database_selection() {
    let dir = tempfile::tempdir().unwrap();
    write_cluster(&dir, "demo", demo_cluster());

    let spec = ClusterSpec::load(dir.path().to_str().unwrap(), "demo").unwrap();
    let nodes = spec.resolve(Some("otherdb"), "all").unwrap();
    assert!(nodes.iter().all(|n| n.dbname == "otherdb"));

    assert!(matches!(
        spec.resolve(Some("missing"), "all"),
        Err(AceError::Validation(_))
    ));
}

#[test]
fn test_node_filter() {
    let dir = tempfile::tempdir().unwrap();
    write_cluster(&dir, "demo", demo_cluster());

    let spec = ClusterSpec::load(dir.path().to_str().unwrap(), "demo").unwrap();
    let nodes = spec.resolve(None, "n1,n2").unwrap();
    assert_eq!(nodes.len(), 2);

    assert!(matches!(
        spec.resolve(None, "n1,ghost"),
        Err(AceError::Validation(_))
    ));
}

#[test]
fn test_fewer_than_two_nodes_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_cluster(&dir, "demo", demo_cluster());

    let spec = ClusterSpec::load(dir.path().to_str().unwrap(), "demo").unwrap();
    assert!(matches!(
        spec.resolve(None, "n1"),
        Err(AceError::Validation(_))
    ));

    // Single-node resolution is allowed through the dedicated path.
    let one = spec.resolve_one(None, "n1").unwrap();
    assert_eq!(one.name, "n1");
}

#[test]
fn test_unknown_cluster() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        ClusterSpec::load(dir.path().to_str().unwrap(), "ghost"),
        Err(AceError::ClusterNotFound(_))
    ));
    assert!(!ClusterSpec::exists(dir.path().to_str().unwrap(), "ghost"));
}

#[test]
fn test_invalid_descriptor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_cluster(
        &dir,
        "empty",
        json!({"cluster_name": "empty", "databases": [], "nodes": []}),
    );
    assert!(matches!(
        ClusterSpec::load(dir.path().to_str().unwrap(), "empty"),
        Err(AceError::InvalidClusterSpec(_))
    ));

    std::fs::write(dir.path().join("garbled.json"), "{not json").unwrap();
    assert!(matches!(
        ClusterSpec::load(dir.path().to_str().unwrap(), "garbled"),
        Err(AceError::InvalidClusterSpec(_))
    ));
}

#[test]
fn test_debug_output_redacts_passwords() {
    let dir = tempfile::tempdir().unwrap();
    write_cluster(&dir, "demo", demo_cluster());

    let spec = ClusterSpec::load(dir.path().to_str().unwrap(), "demo").unwrap();
    let nodes = spec.resolve(None, "all").unwrap();
    let rendered = format!("{:?} {:?}", spec, nodes[0]);
    assert!(!rendered.contains("secret"));
    assert!(rendered.contains("<redacted>"));
}
