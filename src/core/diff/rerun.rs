// src/core/diff/rerun.rs

//! Re-verification of a prior diff: instead of re-hashing the whole table,
//! only the keys enumerated in an earlier diff file are fetched again and
//! re-compared.
//!
//! Two behaviors are supported. `multiprocessing` fetches the keys from
//! every node in bounded batches with tuple IN-lists. `hostdb` stages the
//! keys in a per-node temporary table and joins against the live table,
//! which keeps the statement small when the key list is large.

use crate::core::diff::executor::{DiffOutcome, DiffSummary};
use crate::core::diff::hasher::bind_expr;
use crate::core::diff::{
    DiffFile, TableMeta, cmp_key_tuple, key_of, merge_row_sets, quote_ident,
};
use crate::core::errors::AceError;
use crate::core::pool::ClusterPools;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio_postgres::types::ToSql;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RerunBehavior {
    Multiprocessing,
    Hostdb,
}

/// Converts a JSON key value from a diff file into the canonical text used
/// for SQL binding.
fn json_key_to_canon(value: &Value, data_type: &str) -> String {
    match value {
        Value::String(s) => {
            // row_to_json renders bytea as "\x"-prefixed hex.
            if data_type == "bytea" {
                s.strip_prefix("\\x").unwrap_or(s).to_string()
            } else {
                s.clone()
            }
        }
        Value::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        other => other.to_string(),
    }
}

/// Distinct key tuples enumerated by a diff file, in ascending key order,
/// converted to canonical binding text.
fn keys_from_diff(diff: &DiffFile, meta: &TableMeta) -> Vec<Vec<String>> {
    let mut keys: Vec<Vec<Value>> = diff
        .diffs
        .values()
        .flatten()
        .map(|row| key_of(row, &diff.primary_key))
        .collect();
    keys.sort_by(|a, b| cmp_key_tuple(a, b));
    keys.dedup();

    keys.iter()
        .map(|key| {
            key.iter()
                .zip(meta.key.iter())
                .map(|(v, col)| json_key_to_canon(v, &col.data_type))
                .collect()
        })
        .collect()
}

/// Re-checks the rows from a prior diff file and produces a fresh diff.
pub async fn table_rerun(
    pools: Arc<ClusterPools>,
    meta: &TableMeta,
    prior: &DiffFile,
    behavior: RerunBehavior,
    batch_size: u64,
) -> Result<DiffOutcome, AceError> {
    if prior.primary_key != meta.key_names() {
        return Err(AceError::DiffFile(format!(
            "diff file key {:?} does not match table key {:?}",
            prior.primary_key,
            meta.key_names()
        )));
    }

    let keys = keys_from_diff(prior, meta);
    let total_rows = keys.len() as u64;
    info!(
        "Re-running diff for {} key(s) of {} ({} mode).",
        total_rows,
        meta.table.display(),
        behavior
    );

    let per_node: BTreeMap<String, Vec<Value>> = match behavior {
        RerunBehavior::Multiprocessing => fetch_batched(&pools, meta, &keys, batch_size).await?,
        RerunBehavior::Hostdb => fetch_via_temp_table(&pools, meta, &keys).await?,
    };

    let diffs = merge_row_sets(&per_node, &meta.key_names());
    let divergent_rows: u64 = diffs.values().map(|rows| rows.len() as u64).sum();
    let mismatched_blocks = u64::from(divergent_rows > 0);

    let diff = (divergent_rows > 0).then(|| DiffFile {
        schema: meta.table.schema.clone(),
        table: meta.table.name.clone(),
        primary_key: meta.key_names(),
        diffs,
    });

    Ok(DiffOutcome {
        summary: DiffSummary {
            total_rows,
            divergent_rows,
            mismatched_blocks,
            diff_file_path: None,
        },
        diff,
    })
}

/// Fetches the listed keys from every node in IN-list batches.
async fn fetch_batched(
    pools: &Arc<ClusterPools>,
    meta: &TableMeta,
    keys: &[Vec<String>],
    batch_size: u64,
) -> Result<BTreeMap<String, Vec<Value>>, AceError> {
    let mut per_node: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for chunk in keys.chunks(batch_size.max(1) as usize) {
        let fetches = pools.node_names().iter().map(|node| {
            let pools = pools.clone();
            let node = node.clone();
            async move {
                let client = pools.client(&node).await?;
                let rows = fetch_keys_in_list(&client, meta, chunk, &node).await?;
                Ok::<_, AceError>((node, rows))
            }
        });
        for (node, mut rows) in futures::future::try_join_all(fetches).await? {
            per_node.entry(node).or_default().append(&mut rows);
        }
    }

    Ok(per_node)
}

async fn fetch_keys_in_list(
    client: &deadpool_postgres::Object,
    meta: &TableMeta,
    keys: &[Vec<String>],
    node: &str,
) -> Result<Vec<Value>, AceError> {
    let key_tuple = format!(
        "({})",
        meta.key
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let order: Vec<String> = meta.key.iter().map(|c| quote_ident(&c.name)).collect();

    let mut params: Vec<String> = Vec::with_capacity(keys.len() * meta.key.len());
    let mut tuples: Vec<String> = Vec::with_capacity(keys.len());
    for key in keys {
        let binds: Vec<String> = meta
            .key
            .iter()
            .enumerate()
            .map(|(i, c)| bind_expr(params.len() + i + 1, &c.data_type))
            .collect();
        params.extend(key.iter().cloned());
        tuples.push(format!("({})", binds.join(", ")));
    }

    let sql = format!(
        "SELECT row_to_json(t) FROM (SELECT * FROM {} WHERE {key_tuple} IN ({}) ORDER BY {}) t",
        meta.table.qualified(),
        tuples.join(", "),
        order.join(", ")
    );
    let param_refs: Vec<&(dyn ToSql + Sync)> =
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

    let rows = client
        .query(&sql, &param_refs)
        .await
        .map_err(|e| AceError::from_pg(e, node))?;
    Ok(rows.iter().map(|row| row.get::<_, Value>(0)).collect())
}

/// Stages the key list in a temporary table on each node and joins against
/// the live table. The temp table lives for one transaction.
async fn fetch_via_temp_table(
    pools: &Arc<ClusterPools>,
    meta: &TableMeta,
    keys: &[Vec<String>],
) -> Result<BTreeMap<String, Vec<Value>>, AceError> {
    let mut per_node: BTreeMap<String, Vec<Value>> = BTreeMap::new();

    for node in pools.node_names() {
        let mut client = pools.client(node).await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| AceError::from_pg(e, node))?;

        let key_cols: Vec<String> = meta
            .key
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.data_type))
            .collect();
        tx.execute(
            &format!(
                "CREATE TEMP TABLE ace_rerun_keys ({}) ON COMMIT DROP",
                key_cols.join(", ")
            ),
            &[],
        )
        .await
        .map_err(|e| AceError::from_pg(e, node))?;

        // Multi-row insert of the staged keys, in bounded chunks so the
        // statement never grows past the parameter limit.
        for chunk in keys.chunks(1000) {
            let mut params: Vec<String> = Vec::with_capacity(chunk.len() * meta.key.len());
            let mut tuples: Vec<String> = Vec::with_capacity(chunk.len());
            for key in chunk {
                let binds: Vec<String> = meta
                    .key
                    .iter()
                    .enumerate()
                    .map(|(i, c)| bind_expr(params.len() + i + 1, &c.data_type))
                    .collect();
                params.extend(key.iter().cloned());
                tuples.push(format!("({})", binds.join(", ")));
            }
            let sql = format!(
                "INSERT INTO ace_rerun_keys VALUES {}",
                tuples.join(", ")
            );
            let param_refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            tx.execute(&sql, &param_refs)
                .await
                .map_err(|e| AceError::from_pg(e, node))?;
        }

        let join_cols: Vec<String> = meta
            .key
            .iter()
            .map(|c| format!("t.{ident} = k.{ident}", ident = quote_ident(&c.name)))
            .collect();
        let order: Vec<String> = meta
            .key
            .iter()
            .map(|c| format!("t.{}", quote_ident(&c.name)))
            .collect();
        let sql = format!(
            "SELECT row_to_json(t) FROM (SELECT t.* FROM {} t \
             JOIN ace_rerun_keys k ON {} ORDER BY {}) t",
            meta.table.qualified(),
            join_cols.join(" AND "),
            order.join(", ")
        );
        let rows = tx
            .query(&sql, &[])
            .await
            .map_err(|e| AceError::from_pg(e, node))?;
        per_node.insert(
            node.clone(),
            rows.iter().map(|row| row.get::<_, Value>(0)).collect(),
        );

        tx.commit().await.map_err(|e| AceError::from_pg(e, node))?;
    }

    Ok(per_node)
}
