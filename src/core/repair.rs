// src/core/repair.rs

//! The repair engine: reconciles divergent rows enumerated by a diff file
//! against a declared source of truth, or column-wise for NULL-vs-value
//! conflicts.
//!
//! Planning is pure: the diff file and the options fully determine the
//! per-node operation list. Execution applies each node's operations in a
//! single transaction with Spock's repair mode enabled, so applied rows do
//! not loop back through replication. Nodes fail independently.

use crate::core::diff::{DiffFile, TableMeta, cmp_key_tuple, key_of, quote_ident};
use crate::core::errors::AceError;
use crate::core::pool::ClusterPools;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RepairOptions {
    /// Node whose row wins every conflict. Required unless `fix_nulls`.
    pub source_of_truth: Option<String>,
    /// Column-wise first-non-NULL merge instead of a trusted node.
    pub fix_nulls: bool,
    pub dry_run: bool,
    /// Never plan DELETEs; rows absent on the source of truth are skipped.
    pub upsert_only: bool,
    pub generate_report: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairOp {
    Upsert,
    Delete,
}

/// One planned operation against one node.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedOp {
    pub op: RepairOp,
    /// The target row for upserts; a key-bearing row for deletes.
    pub row: Value,
}

/// Node name → operations, in diff key order.
pub type RepairPlan = BTreeMap<String, Vec<PlannedOp>>;

/// Folds row versions column-wise, taking the first non-NULL value per
/// column with nodes scanned in alphabetical order. Columns NULL
/// everywhere stay NULL.
pub fn fold_fix_nulls(versions: &BTreeMap<String, &Value>) -> Value {
    let mut target = Map::new();
    for version in versions.values() {
        if let Value::Object(fields) = version {
            for (col, value) in fields {
                let slot = target.entry(col.clone()).or_insert(Value::Null);
                if slot.is_null() && !value.is_null() {
                    *slot = value.clone();
                }
            }
        }
    }
    Value::Object(target)
}

/// Builds the per-node resolution plan for a diff file.
///
/// `nodes` is the full node set being repaired (sorted or not; the plan is
/// keyed per node regardless). A node absent from a key's version map is
/// treated as missing the row.
pub fn build_plan(
    diff: &DiffFile,
    nodes: &[String],
    opts: &RepairOptions,
) -> Result<RepairPlan, AceError> {
    if !opts.fix_nulls {
        let truth = opts
            .source_of_truth
            .as_deref()
            .ok_or_else(|| {
                AceError::Validation(
                    "source_of_truth is required when fix_nulls is not enabled".to_string(),
                )
            })?;
        if !nodes.iter().any(|n| n == truth) {
            return Err(AceError::Validation(format!(
                "source_of_truth node '{truth}' is not part of the repair"
            )));
        }
    }

    // Index row versions by a canonical text form of their key tuple, then
    // walk the distinct keys in ascending key order.
    let mut indexed: BTreeMap<&String, BTreeMap<String, &Value>> = BTreeMap::new();
    let mut keys: Vec<(Vec<Value>, String)> = Vec::new();
    for (node, rows) in &diff.diffs {
        let mut by_key = BTreeMap::new();
        for row in rows {
            let key = key_of(row, &diff.primary_key);
            let tag = serde_json::to_string(&key).unwrap_or_default();
            keys.push((key, tag.clone()));
            by_key.insert(tag, row);
        }
        indexed.insert(node, by_key);
    }
    keys.sort_by(|(a, _), (b, _)| cmp_key_tuple(a, b));
    keys.dedup_by(|(_, a), (_, b)| a == b);

    let mut plan: RepairPlan = BTreeMap::new();
    for (_, tag) in &keys {
        let versions: BTreeMap<String, &Value> = indexed
            .iter()
            .filter_map(|(node, by_key)| by_key.get(tag).map(|row| ((*node).clone(), *row)))
            .collect();

        if opts.fix_nulls {
            let target = fold_fix_nulls(&versions);
            for node in nodes {
                if versions.get(node).copied() != Some(&target) {
                    plan.entry(node.clone()).or_default().push(PlannedOp {
                        op: RepairOp::Upsert,
                        row: target.clone(),
                    });
                }
            }
            continue;
        }

        let truth = opts.source_of_truth.as_deref().unwrap_or_default();
        match versions.get(truth) {
            Some(truth_row) => {
                for node in nodes {
                    if node == truth {
                        continue;
                    }
                    if versions.get(node).copied() != Some(*truth_row) {
                        plan.entry(node.clone()).or_default().push(PlannedOp {
                            op: RepairOp::Upsert,
                            row: (*truth_row).clone(),
                        });
                    }
                }
            }
            // The row is absent on the source of truth: converging means
            // deleting it everywhere else, unless deletions are opted out.
            None => {
                if opts.upsert_only {
                    continue;
                }
                for (node, row) in &versions {
                    plan.entry(node.clone()).or_default().push(PlannedOp {
                        op: RepairOp::Delete,
                        row: (*row).clone(),
                    });
                }
            }
        }
    }

    Ok(plan)
}

/// SQL for upserting a JSON row into the table.
fn upsert_sql(meta: &TableMeta) -> String {
    let key_cols: Vec<String> = meta.key.iter().map(|c| quote_ident(&c.name)).collect();
    let non_key: Vec<String> = meta
        .columns
        .iter()
        .filter(|c| !meta.key.iter().any(|k| k.name == c.name))
        .map(|c| {
            let ident = quote_ident(&c.name);
            format!("{ident} = EXCLUDED.{ident}")
        })
        .collect();

    let conflict_action = if non_key.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", non_key.join(", "))
    };

    format!(
        "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1::jsonb) \
         ON CONFLICT ({keys}) {conflict_action}",
        table = meta.table.qualified(),
        keys = key_cols.join(", ")
    )
}

/// SQL for deleting the row identified by a JSON row's key columns.
fn delete_sql(meta: &TableMeta) -> String {
    let conditions: Vec<String> = meta
        .key
        .iter()
        .map(|c| {
            let ident = quote_ident(&c.name);
            format!("t.{ident} = r.{ident}")
        })
        .collect();
    format!(
        "DELETE FROM {table} t USING jsonb_populate_record(NULL::{table}, $1::jsonb) r WHERE {}",
        conditions.join(" AND "),
        table = meta.table.qualified()
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRepairReport {
    pub upserted: u64,
    pub deleted: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Applies the plan, one transaction per node. A failing node rolls back
/// alone; the remaining nodes proceed.
async fn execute_plan(
    pools: &ClusterPools,
    meta: &TableMeta,
    plan: &RepairPlan,
) -> BTreeMap<String, NodeRepairReport> {
    let upsert = upsert_sql(meta);
    let delete = delete_sql(meta);
    let mut reports = BTreeMap::new();

    for (node, ops) in plan {
        let report = apply_node_ops(pools, node, ops, &upsert, &delete).await;
        match &report {
            Ok(_) => info!("Repair applied on node '{node}' ({} op(s)).", ops.len()),
            Err(e) => warn!("Repair failed on node '{node}', rolled back: {e}"),
        }
        reports.insert(
            node.clone(),
            match report {
                Ok((upserted, deleted)) => NodeRepairReport {
                    upserted,
                    deleted,
                    status: "applied".to_string(),
                    error: None,
                },
                Err(e) => NodeRepairReport {
                    upserted: 0,
                    deleted: 0,
                    status: "rolled_back".to_string(),
                    error: Some(e.to_string()),
                },
            },
        );
    }

    reports
}

async fn apply_node_ops(
    pools: &ClusterPools,
    node: &str,
    ops: &[PlannedOp],
    upsert: &str,
    delete: &str,
) -> Result<(u64, u64), AceError> {
    let mut client = pools.client(node).await?;
    let tx = client
        .transaction()
        .await
        .map_err(|e| AceError::from_pg(e, node))?;

    // Keep the applied rows from looping back through replication.
    tx.execute("SELECT spock.repair_mode(true)", &[])
        .await
        .map_err(|e| AceError::from_pg(e, node))?;

    let mut upserted = 0u64;
    let mut deleted = 0u64;
    for op in ops {
        let payload = serde_json::to_string(&op.row)?;
        match op.op {
            RepairOp::Upsert => {
                tx.execute(upsert, &[&payload])
                    .await
                    .map_err(|e| AceError::from_pg(e, node))?;
                upserted += 1;
            }
            RepairOp::Delete => {
                deleted += tx
                    .execute(delete, &[&payload])
                    .await
                    .map_err(|e| AceError::from_pg(e, node))?;
            }
        }
    }

    tx.commit().await.map_err(|e| AceError::from_pg(e, node))?;
    Ok((upserted, deleted))
}

/// Applies one row version to one node, outside any diff-file flow. Used
/// by the auto-repair driver for synthesised single-row repairs.
pub async fn apply_row(
    pools: &ClusterPools,
    meta: &TableMeta,
    node: &str,
    row: &Value,
) -> Result<(), AceError> {
    let ops = [PlannedOp {
        op: RepairOp::Upsert,
        row: row.clone(),
    }];
    apply_node_ops(pools, node, &ops, &upsert_sql(meta), &delete_sql(meta)).await?;
    Ok(())
}

/// Runs a repair end to end and returns `(result, fully_applied)`. The
/// caller decides the task's terminal status from the flag.
pub async fn table_repair(
    pools: &ClusterPools,
    meta: &TableMeta,
    diff: &DiffFile,
    opts: &RepairOptions,
) -> Result<(Value, bool), AceError> {
    let started = Instant::now();
    let nodes: Vec<String> = pools.node_names().to_vec();
    let plan = build_plan(diff, &nodes, opts)?;
    let planned_ops: usize = plan.values().map(Vec::len).sum();

    if opts.dry_run {
        let plan_json: BTreeMap<&String, Vec<Value>> = plan
            .iter()
            .map(|(node, ops)| {
                (
                    node,
                    ops.iter()
                        .map(|op| json!({ "op": op.op, "row": op.row }))
                        .collect(),
                )
            })
            .collect();
        return Ok((
            json!({
                "dry_run": true,
                "planned_ops": planned_ops,
                "plan": plan_json,
            }),
            true,
        ));
    }

    let reports = execute_plan(pools, meta, &plan).await;
    let all_applied = reports.values().all(|r| r.error.is_none());

    let mut result = json!({
        "planned_ops": planned_ops,
        "nodes": reports,
        "elapsed_ms": started.elapsed().as_millis() as u64,
    });
    if opts.generate_report {
        let plan_json: BTreeMap<&String, Vec<Value>> = plan
            .iter()
            .map(|(node, ops)| {
                (
                    node,
                    ops.iter()
                        .map(|op| json!({ "op": op.op, "row": op.row }))
                        .collect(),
                )
            })
            .collect();
        result["report"] = json!({ "operations": plan_json });
    }

    Ok((result, all_applied))
}
