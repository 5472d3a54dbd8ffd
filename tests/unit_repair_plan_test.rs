use ace::core::diff::DiffFile;
use ace::core::repair::{RepairOp, RepairOptions, build_plan, fold_fix_nulls};
use serde_json::{Value, json};
use std::collections::BTreeMap;

fn diff_file(diffs: Vec<(&str, Vec<Value>)>) -> DiffFile {
    DiffFile {
        schema: "public".to_string(),
        table: "t".to_string(),
        primary_key: vec!["id".to_string()],
        diffs: diffs
            .into_iter()
            .map(|(node, rows)| (node.to_string(), rows))
            .collect(),
    }
}

fn opts(source_of_truth: Option<&str>) -> RepairOptions {
    RepairOptions {
        source_of_truth: source_of_truth.map(|s| s.to_string()),
        fix_nulls: false,
        dry_run: false,
        upsert_only: false,
        generate_report: false,
    }
}

fn nodes(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_source_of_truth_plans_update_on_divergent_node() {
    let diff = diff_file(vec![
        ("n1", vec![json!({"id": 2, "v": "y"})]),
        ("n2", vec![json!({"id": 2, "v": "Y"})]),
    ]);

    let plan = build_plan(&diff, &nodes(&["n1", "n2"]), &opts(Some("n1"))).unwrap();
    assert!(!plan.contains_key("n1"));
    let ops = &plan["n2"];
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op, RepairOp::Upsert);
    assert_eq!(ops[0].row, json!({"id": 2, "v": "y"}));
}

#[test]
fn test_row_missing_on_other_node_is_upserted() {
    let diff = diff_file(vec![("n1", vec![json!({"id": 5, "v": "a"})])]);

    let plan = build_plan(&diff, &nodes(&["n1", "n2"]), &opts(Some("n1"))).unwrap();
    assert_eq!(plan["n2"].len(), 1);
    assert_eq!(plan["n2"][0].op, RepairOp::Upsert);
}

#[test]
fn test_row_absent_on_truth_is_deleted_elsewhere() {
    let diff = diff_file(vec![("n2", vec![json!({"id": 9, "v": "stale"})])]);

    let plan = build_plan(&diff, &nodes(&["n1", "n2"]), &opts(Some("n1"))).unwrap();
    assert!(!plan.contains_key("n1"));
    assert_eq!(plan["n2"][0].op, RepairOp::Delete);
}

#[test]
fn test_upsert_only_skips_deletes() {
    let diff = diff_file(vec![("n2", vec![json!({"id": 9, "v": "stale"})])]);

    let mut options = opts(Some("n1"));
    options.upsert_only = true;
    let plan = build_plan(&diff, &nodes(&["n1", "n2"]), &options).unwrap();
    assert!(plan.is_empty());
}

#[test]
fn test_empty_diff_plans_nothing() {
    // Idempotence: a diff with no rows (converged cluster) is a no-op.
    let diff = diff_file(vec![]);
    let plan = build_plan(&diff, &nodes(&["n1", "n2"]), &opts(Some("n1"))).unwrap();
    assert!(plan.is_empty());
}

#[test]
fn test_source_of_truth_must_participate() {
    let diff = diff_file(vec![("n1", vec![json!({"id": 1})])]);
    let err = build_plan(&diff, &nodes(&["n1", "n2"]), &opts(Some("n9"))).unwrap_err();
    assert!(err.to_string().contains("n9"));
}

#[test]
fn test_source_of_truth_required_without_fix_nulls() {
    let diff = diff_file(vec![]);
    assert!(build_plan(&diff, &nodes(&["n1", "n2"]), &opts(None)).is_err());
}

#[test]
fn test_fix_nulls_fold_takes_first_non_null_per_column() {
    let a = json!({"id": 1, "a": null, "b": "x"});
    let b = json!({"id": 1, "a": "α", "b": null});
    let c = json!({"id": 1, "a": null, "b": null});

    let mut versions: BTreeMap<String, &Value> = BTreeMap::new();
    versions.insert("A".to_string(), &a);
    versions.insert("B".to_string(), &b);
    versions.insert("C".to_string(), &c);

    let target = fold_fix_nulls(&versions);
    assert_eq!(target["id"], json!(1));
    assert_eq!(target["a"], json!("α"));
    assert_eq!(target["b"], json!("x"));
}

#[test]
fn test_fix_nulls_keeps_all_null_columns_null() {
    let a = json!({"id": 1, "a": null});
    let b = json!({"id": 1, "a": null});
    let mut versions: BTreeMap<String, &Value> = BTreeMap::new();
    versions.insert("A".to_string(), &a);
    versions.insert("B".to_string(), &b);

    let target = fold_fix_nulls(&versions);
    assert_eq!(target["a"], Value::Null);
}

#[test]
fn test_fix_nulls_plan_converges_every_node_to_the_fold() {
    let diff = diff_file(vec![
        ("A", vec![json!({"id": 1, "a": null, "b": "x"})]),
        ("B", vec![json!({"id": 1, "a": "α", "b": null})]),
        ("C", vec![json!({"id": 1, "a": null, "b": null})]),
    ]);

    let options = RepairOptions {
        source_of_truth: None,
        fix_nulls: true,
        dry_run: false,
        upsert_only: false,
        generate_report: false,
    };
    let plan = build_plan(&diff, &nodes(&["A", "B", "C"]), &options).unwrap();

    let target = json!({"id": 1, "a": "α", "b": "x"});
    for node in ["A", "B", "C"] {
        let ops = &plan[node];
        assert_eq!(ops.len(), 1, "node {node} should receive the folded row");
        assert_eq!(ops[0].op, RepairOp::Upsert);
        assert_eq!(ops[0].row, target);
    }
}

#[test]
fn test_fix_nulls_skips_nodes_already_at_target() {
    let diff = diff_file(vec![
        ("A", vec![json!({"id": 1, "a": "v", "b": "x"})]),
        ("B", vec![json!({"id": 1, "a": null, "b": "x"})]),
    ]);

    let options = RepairOptions {
        source_of_truth: None,
        fix_nulls: true,
        dry_run: false,
        upsert_only: false,
        generate_report: false,
    };
    let plan = build_plan(&diff, &nodes(&["A", "B"]), &options).unwrap();
    assert!(!plan.contains_key("A"));
    assert_eq!(plan["B"][0].row, json!({"id": 1, "a": "v", "b": "x"}));
}

#[test]
fn test_plan_is_ordered_by_key() {
    let diff = diff_file(vec![(
        "n2",
        vec![
            json!({"id": 30, "v": "c"}),
            json!({"id": 4, "v": "a"}),
            json!({"id": 11, "v": "b"}),
        ],
    )]);

    let plan = build_plan(&diff, &nodes(&["n1", "n2"]), &opts(Some("n1"))).unwrap();
    let ids: Vec<i64> = plan["n2"]
        .iter()
        .map(|op| op.row["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![4, 11, 30]);
}
