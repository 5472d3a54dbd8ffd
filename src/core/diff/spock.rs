// src/core/diff/spock.rs

//! Comparison of Spock replication metadata across nodes: node registry,
//! subscriptions, and replication-set rules.

use crate::core::errors::AceError;
use crate::core::pool::ClusterPools;
use serde_json::{Value, json};
use std::collections::BTreeMap;

const SPOCK_NODES_SQL: &str =
    "SELECT node_id::int8, node_name FROM spock.node ORDER BY node_name";

const SPOCK_SUBS_SQL: &str = "SELECT sub_name, sub_enabled, sub_replication_sets \
     FROM spock.subscription ORDER BY sub_name";

const SPOCK_REPSETS_SQL: &str = "SELECT set_name, replicate_insert, replicate_update, \
     replicate_delete, replicate_truncate \
     FROM spock.replication_set ORDER BY set_name";

async fn load_spock_meta(pools: &ClusterPools, node: &str) -> Result<Value, AceError> {
    let client = pools.client(node).await?;

    let node_rows = client
        .query(SPOCK_NODES_SQL, &[])
        .await
        .map_err(|e| AceError::from_pg(e, node))?;
    let nodes: Vec<Value> = node_rows
        .iter()
        .map(|row| {
            json!({
                "node_id": row.get::<_, i64>(0),
                "node_name": row.get::<_, String>(1),
            })
        })
        .collect();

    let sub_rows = client
        .query(SPOCK_SUBS_SQL, &[])
        .await
        .map_err(|e| AceError::from_pg(e, node))?;
    let subscriptions: Vec<Value> = sub_rows
        .iter()
        .map(|row| {
            json!({
                "sub_name": row.get::<_, String>(0),
                "sub_enabled": row.get::<_, bool>(1),
                "replication_sets": row.get::<_, Vec<String>>(2),
            })
        })
        .collect();

    let repset_rows = client
        .query(SPOCK_REPSETS_SQL, &[])
        .await
        .map_err(|e| AceError::from_pg(e, node))?;
    let replication_sets: Vec<Value> = repset_rows
        .iter()
        .map(|row| {
            json!({
                "set_name": row.get::<_, String>(0),
                "replicate_insert": row.get::<_, bool>(1),
                "replicate_update": row.get::<_, bool>(2),
                "replicate_delete": row.get::<_, bool>(3),
                "replicate_truncate": row.get::<_, bool>(4),
            })
        })
        .collect();

    Ok(json!({
        "nodes": nodes,
        "subscriptions": subscriptions,
        "replication_sets": replication_sets,
    }))
}

/// Reads the Spock catalogs on every node and flags rule differences.
/// Subscriptions legitimately differ per node, so only the node registry
/// and replication-set rules participate in the mismatch check.
pub async fn spock_diff(pools: &ClusterPools) -> Result<Value, AceError> {
    let mut per_node: BTreeMap<String, Value> = BTreeMap::new();
    for node in pools.node_names() {
        per_node.insert(node.clone(), load_spock_meta(pools, node).await?);
    }

    let reference_node = pools.reference_node().to_string();
    let reference = &per_node[&reference_node];

    let mut mismatches: Vec<Value> = Vec::new();
    for (node, meta) in &per_node {
        if node == &reference_node {
            continue;
        }
        for section in ["nodes", "replication_sets"] {
            if meta.get(section) != reference.get(section) {
                mismatches.push(json!({
                    "node": node,
                    "section": section,
                }));
            }
        }
    }

    Ok(json!({
        "reference_node": reference_node,
        "spock_config": per_node,
        "matches": mismatches.is_empty(),
        "mismatches": mismatches,
    }))
}

/// Tables belonging to a replication set, as seen by the given node.
pub async fn repset_tables(
    pools: &ClusterPools,
    node: &str,
    repset_name: &str,
) -> Result<Vec<String>, AceError> {
    let client = pools.client(node).await?;
    let rows = client
        .query(
            "SELECT DISTINCT nspname || '.' || relname FROM spock.tables \
             WHERE set_name = $1 ORDER BY 1",
            &[&repset_name],
        )
        .await
        .map_err(|e| AceError::from_pg(e, node))?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}
