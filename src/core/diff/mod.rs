// src/core/diff/mod.rs

//! Shared types for the block-hash diff engine: table identity, block
//! ranges, diff-file artifacts, and the row-merge step that turns per-node
//! row sets into a row-level diff.

pub mod executor;
pub mod hasher;
pub mod planner;
pub mod rerun;
pub mod schema;
pub mod spock;

use crate::core::errors::AceError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Quotes a SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A schema-qualified table name. Bare names default to `public`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn parse(input: &str) -> Result<Self, AceError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AceError::Validation("table_name cannot be empty".to_string()));
        }
        let mut parts = trimmed.splitn(2, '.');
        let first = parts.next().unwrap_or_default();
        match parts.next() {
            Some(rest) if !rest.is_empty() && !first.is_empty() => Ok(Self {
                schema: first.to_string(),
                name: rest.to_string(),
            }),
            None => Ok(Self {
                schema: "public".to_string(),
                name: first.to_string(),
            }),
            _ => Err(AceError::Validation(format!(
                "invalid table name '{input}'"
            ))),
        }
    }

    /// Quoted `"schema"."table"` form for embedding in SQL.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    /// Unquoted `schema.table` form for display and file names.
    pub fn display(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// One column as seen by the information schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub position: i32,
}

/// Everything the diff engine needs to know about a table: its full column
/// list (in ordinal order) and the key columns used for ordering and block
/// ranges.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub table: TableName,
    pub columns: Vec<ColumnInfo>,
    pub key: Vec<ColumnInfo>,
}

impl TableMeta {
    pub fn key_names(&self) -> Vec<String> {
        self.key.iter().map(|c| c.name.clone()).collect()
    }
}

/// A half-open primary-key interval `[lo, hi)`. `None` bounds are
/// unbounded. Boundary values are canonical text encodings of the key
/// columns, bound back to their SQL types in range clauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub lo: Option<Vec<String>>,
    pub hi: Option<Vec<String>>,
}

impl Block {
    pub fn unbounded() -> Self {
        Self { lo: None, hi: None }
    }
}

/// The persisted diff artifact. Written once by the diff executor and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffFile {
    pub schema: String,
    pub table: String,
    /// Key column names, in key order.
    pub primary_key: Vec<String>,
    /// Node name → full rows present on that node, sorted by key.
    pub diffs: BTreeMap<String, Vec<Value>>,
}

impl DiffFile {
    pub fn load(path: &str) -> Result<Self, AceError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AceError::DiffFile(format!("cannot read '{path}': {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| AceError::DiffFile(format!("cannot parse '{path}': {e}")))
    }

    /// Writes the artifact as pretty-printed UTF-8 JSON and returns the
    /// path. File names carry the table and a timestamp so successive runs
    /// never collide.
    pub fn write(&self, diff_dir: &str, cluster_name: &str) -> Result<PathBuf, AceError> {
        std::fs::create_dir_all(diff_dir)?;
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let path = Path::new(diff_dir).join(format!(
            "{cluster_name}_{}_{}_{stamp}.json",
            self.schema, self.table
        ));
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Total number of rows enumerated across all nodes.
    pub fn row_count(&self) -> u64 {
        self.diffs.values().map(|rows| rows.len() as u64).sum()
    }
}

/// Orders two scalar JSON values the way the underlying key columns order:
/// numerically when both sides are numbers, lexicographically otherwise.
pub fn cmp_json(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(xi), Some(yi)) = (x.as_i64(), y.as_i64()) {
                xi.cmp(&yi)
            } else {
                x.as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal)
            }
        }
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Orders two key tuples column by column.
pub fn cmp_key_tuple(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match cmp_json(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Extracts the key tuple from a row object.
pub fn key_of(row: &Value, key_cols: &[String]) -> Vec<Value> {
    key_cols
        .iter()
        .map(|col| row.get(col).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Merges per-node row sets for one key range into a row-level diff.
///
/// A key is divergent when any two nodes that hold the row disagree, or
/// when the row is missing on at least one node. For every divergent key
/// the row from each node that has it is included, so the repair engine
/// sees the complete picture. Output rows are sorted by key; node keys are
/// sorted by node name by construction.
pub fn merge_row_sets(
    per_node: &BTreeMap<String, Vec<Value>>,
    key_cols: &[String],
) -> BTreeMap<String, Vec<Value>> {
    let node_count = per_node.len();

    // Index rows per node by a canonical text form of their key tuple.
    let mut indexed: BTreeMap<&String, BTreeMap<String, &Value>> = BTreeMap::new();
    let mut all_keys: Vec<(Vec<Value>, String)> = Vec::new();
    for (node, rows) in per_node {
        let mut by_key = BTreeMap::new();
        for row in rows {
            let key = key_of(row, key_cols);
            let tag = serde_json::to_string(&key).unwrap_or_default();
            all_keys.push((key, tag.clone()));
            by_key.insert(tag, row);
        }
        indexed.insert(node, by_key);
    }

    // All distinct keys, in ascending key order.
    all_keys.sort_by(|(a, _), (b, _)| cmp_key_tuple(a, b));
    all_keys.dedup_by(|(_, a), (_, b)| a == b);

    let mut diffs: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (_, tag) in &all_keys {
        let versions: Vec<(&String, &Value)> = indexed
            .iter()
            .filter_map(|(node, by_key)| by_key.get(tag).map(|row| (*node, *row)))
            .collect();

        let missing_somewhere = versions.len() < node_count;
        let unequal = versions.windows(2).any(|pair| pair[0].1 != pair[1].1);

        if missing_somewhere || unequal {
            for (node, row) in versions {
                diffs.entry(node.clone()).or_default().push(row.clone());
            }
        }
    }

    diffs
}
