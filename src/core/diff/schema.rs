// src/core/diff/schema.rs

//! Whole-schema comparison: table lists and column definitions, node
//! against node.

use crate::core::diff::ColumnInfo;
use crate::core::errors::AceError;
use crate::core::pool::ClusterPools;
use serde_json::{Value, json};
use std::collections::BTreeMap;

const SCHEMA_COLUMNS_SQL: &str = "SELECT table_name, column_name, data_type, ordinal_position::int4 \
     FROM information_schema.columns \
     WHERE table_schema = $1 \
     ORDER BY table_name, ordinal_position";

type SchemaMap = BTreeMap<String, Vec<ColumnInfo>>;

async fn load_schema(
    pools: &ClusterPools,
    node: &str,
    schema_name: &str,
) -> Result<SchemaMap, AceError> {
    let client = pools.client(node).await?;
    let rows = client
        .query(SCHEMA_COLUMNS_SQL, &[&schema_name])
        .await
        .map_err(|e| AceError::from_pg(e, node))?;

    let mut tables: SchemaMap = BTreeMap::new();
    for row in rows {
        let table: String = row.get(0);
        tables.entry(table).or_default().push(ColumnInfo {
            name: row.get(1),
            data_type: row.get(2),
            position: row.get(3),
        });
    }
    Ok(tables)
}

/// Compares a schema across every node. The first node is the reference;
/// the result enumerates missing tables, extra tables, and per-table
/// column mismatches for each other node.
pub async fn schema_diff(pools: &ClusterPools, schema_name: &str) -> Result<Value, AceError> {
    let reference_node = pools.reference_node().to_string();
    let reference = load_schema(pools, &reference_node, schema_name).await?;

    if reference.is_empty() {
        return Err(AceError::Validation(format!(
            "schema '{schema_name}' has no tables on node '{reference_node}'"
        )));
    }

    let mut mismatches: Vec<Value> = Vec::new();
    let mut table_counts: BTreeMap<String, usize> = BTreeMap::new();
    table_counts.insert(reference_node.clone(), reference.len());

    for node in pools.node_names().iter().skip(1) {
        let other = load_schema(pools, node, schema_name).await?;
        table_counts.insert(node.clone(), other.len());

        for (table, columns) in &reference {
            match other.get(table) {
                None => mismatches.push(json!({
                    "node": node,
                    "table": table,
                    "kind": "missing_table",
                })),
                Some(other_cols) if other_cols != columns => {
                    mismatches.push(json!({
                        "node": node,
                        "table": table,
                        "kind": "column_mismatch",
                        "reference_columns": columns,
                        "node_columns": other_cols,
                    }));
                }
                Some(_) => {}
            }
        }
        for table in other.keys() {
            if !reference.contains_key(table) {
                mismatches.push(json!({
                    "node": node,
                    "table": table,
                    "kind": "extra_table",
                }));
            }
        }
    }

    Ok(json!({
        "schema": schema_name,
        "reference_node": reference_node,
        "table_counts": table_counts,
        "matches": mismatches.is_empty(),
        "mismatches": mismatches,
    }))
}
