use ace::core::diff::{cmp_json, cmp_key_tuple, key_of, merge_row_sets};
use serde_json::{Value, json};
use std::cmp::Ordering;
use std::collections::BTreeMap;

fn rows(values: Vec<Value>) -> Vec<Value> {
    values
}

fn key_cols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_converged_nodes_produce_empty_diff() {
    let mut per_node = BTreeMap::new();
    per_node.insert(
        "n1".to_string(),
        rows(vec![json!({"id": 1, "v": "x"}), json!({"id": 2, "v": "y"})]),
    );
    per_node.insert(
        "n2".to_string(),
        rows(vec![json!({"id": 1, "v": "x"}), json!({"id": 2, "v": "y"})]),
    );

    let diffs = merge_row_sets(&per_node, &key_cols(&["id"]));
    assert!(diffs.is_empty());
}

#[test]
fn test_two_node_single_row_divergence() {
    // Nodes agree on id=1 and disagree on id=2: both versions of id=2 are
    // surfaced, one per node.
    let mut per_node = BTreeMap::new();
    per_node.insert(
        "n1".to_string(),
        rows(vec![json!({"id": 1, "v": "x"}), json!({"id": 2, "v": "y"})]),
    );
    per_node.insert(
        "n2".to_string(),
        rows(vec![json!({"id": 1, "v": "x"}), json!({"id": 2, "v": "Y"})]),
    );

    let diffs = merge_row_sets(&per_node, &key_cols(&["id"]));
    assert_eq!(diffs.len(), 2);
    assert_eq!(diffs["n1"], vec![json!({"id": 2, "v": "y"})]);
    assert_eq!(diffs["n2"], vec![json!({"id": 2, "v": "Y"})]);

    let divergent_rows: usize = diffs.values().map(Vec::len).sum();
    assert_eq!(divergent_rows, 2);
}

#[test]
fn test_missing_row_counts_as_divergence() {
    let mut per_node = BTreeMap::new();
    per_node.insert("n1".to_string(), rows(vec![json!({"id": 7, "v": "only"})]));
    per_node.insert("n2".to_string(), rows(vec![]));

    let diffs = merge_row_sets(&per_node, &key_cols(&["id"]));
    assert_eq!(diffs["n1"], vec![json!({"id": 7, "v": "only"})]);
    assert!(!diffs.contains_key("n2"));
}

#[test]
fn test_agreeing_nodes_are_listed_when_any_node_differs() {
    let mut per_node = BTreeMap::new();
    per_node.insert("n1".to_string(), rows(vec![json!({"id": 1, "v": "a"})]));
    per_node.insert("n2".to_string(), rows(vec![json!({"id": 1, "v": "a"})]));
    per_node.insert("n3".to_string(), rows(vec![json!({"id": 1, "v": "b"})]));

    let diffs = merge_row_sets(&per_node, &key_cols(&["id"]));
    // All three nodes hold the row; all three versions appear.
    assert_eq!(diffs.len(), 3);
}

#[test]
fn test_rows_are_sorted_by_key_within_each_node() {
    let mut per_node = BTreeMap::new();
    per_node.insert(
        "n1".to_string(),
        rows(vec![
            json!({"id": 3, "v": "c"}),
            json!({"id": 10, "v": "a"}),
            json!({"id": 2, "v": "b"}),
        ]),
    );
    per_node.insert("n2".to_string(), rows(vec![]));

    let diffs = merge_row_sets(&per_node, &key_cols(&["id"]));
    let ids: Vec<i64> = diffs["n1"]
        .iter()
        .map(|row| row["id"].as_i64().unwrap())
        .collect();
    // Numeric key order, not lexicographic.
    assert_eq!(ids, vec![2, 3, 10]);
}

#[test]
fn test_composite_key_extraction_and_ordering() {
    let row = json!({"region": "eu", "id": 4, "v": "x"});
    let key = key_of(&row, &key_cols(&["region", "id"]));
    assert_eq!(key, vec![json!("eu"), json!(4)]);

    assert_eq!(
        cmp_key_tuple(&[json!("eu"), json!(4)], &[json!("eu"), json!(10)]),
        Ordering::Less
    );
    assert_eq!(
        cmp_key_tuple(&[json!("ap"), json!(9)], &[json!("eu"), json!(1)]),
        Ordering::Less
    );
}

#[test]
fn test_cmp_json_orders_numbers_numerically() {
    assert_eq!(cmp_json(&json!(9), &json!(10)), Ordering::Less);
    assert_eq!(cmp_json(&json!(10), &json!(10)), Ordering::Equal);
    assert_eq!(cmp_json(&json!("10"), &json!("9")), Ordering::Less);
}
