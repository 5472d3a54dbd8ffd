use ace::core::diff::{DiffFile, TableName};
use serde_json::json;
use std::collections::BTreeMap;

#[test]
fn test_table_name_parsing() {
    let bare = TableName::parse("orders").unwrap();
    assert_eq!(bare.schema, "public");
    assert_eq!(bare.name, "orders");
    assert_eq!(bare.display(), "public.orders");

    let qualified = TableName::parse("sales.orders").unwrap();
    assert_eq!(qualified.schema, "sales");
    assert_eq!(qualified.qualified(), "\"sales\".\"orders\"");

    assert!(TableName::parse("").is_err());
    assert!(TableName::parse("sales.").is_err());
    assert!(TableName::parse(".orders").is_err());
}

#[test]
fn test_quoting_doubles_embedded_quotes() {
    let odd = TableName {
        schema: "public".to_string(),
        name: "we\"ird".to_string(),
    };
    assert_eq!(odd.qualified(), "\"public\".\"we\"\"ird\"");
}

fn sample_diff() -> DiffFile {
    let mut diffs = BTreeMap::new();
    diffs.insert("n1".to_string(), vec![json!({"id": 2, "v": "y"})]);
    diffs.insert("n2".to_string(), vec![json!({"id": 2, "v": "Y"})]);
    DiffFile {
        schema: "public".to_string(),
        table: "t".to_string(),
        primary_key: vec!["id".to_string()],
        diffs,
    }
}

#[test]
fn test_write_then_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let diff = sample_diff();

    let path = diff.write(dir.path().to_str().unwrap(), "demo").unwrap();
    let name = path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("demo_public_t_"));
    assert!(name.ends_with(".json"));

    let loaded = DiffFile::load(path.to_str().unwrap()).unwrap();
    assert_eq!(loaded.schema, "public");
    assert_eq!(loaded.table, "t");
    assert_eq!(loaded.primary_key, vec!["id".to_string()]);
    assert_eq!(loaded.diffs["n1"], vec![json!({"id": 2, "v": "y"})]);
    assert_eq!(loaded.row_count(), 2);
}

#[test]
fn test_written_artifact_is_pretty_printed_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = sample_diff()
        .write(dir.path().to_str().unwrap(), "demo")
        .unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains('\n'));
    assert!(contents.contains("\"primary_key\""));
}

#[test]
fn test_load_rejects_missing_or_garbled_files() {
    assert!(DiffFile::load("/no/such/diff.json").is_err());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, "{").unwrap();
    assert!(DiffFile::load(path.to_str().unwrap()).is_err());
}
