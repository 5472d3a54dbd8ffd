// src/core/diff/executor.rs

//! The diff pipeline: pre-flight schema checks, block planning, parallel
//! (block x node) hashing, and row-level resolution of divergent blocks.

use crate::core::diff::hasher::{self, BlockHash};
use crate::core::diff::planner;
use crate::core::diff::{Block, DiffFile, TableMeta, TableName, merge_row_sets, quote_ident};
use crate::core::errors::AceError;
use crate::core::pool::ClusterPools;
use deadpool_postgres::Object;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_postgres::types::ToSql;
use tracing::{debug, info, warn};

/// One retry with a fixed backoff for transient per-job failures.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// Hard stop for pathological split recursion.
const MAX_SPLIT_DEPTH: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct DiffSummary {
    pub total_rows: u64,
    pub divergent_rows: u64,
    pub mismatched_blocks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_file_path: Option<String>,
}

pub struct DiffOutcome {
    pub summary: DiffSummary,
    /// Present only when divergence was found.
    pub diff: Option<DiffFile>,
}

/// A table-diff run over one table on a fixed set of nodes.
pub struct TableDiffRun {
    pools: Arc<ClusterPools>,
    meta: Arc<TableMeta>,
    block_rows: u64,
    batch_size: u64,
    hash_workers: usize,
    filter: Option<String>,
    cancel: Arc<AtomicBool>,
}

impl TableDiffRun {
    /// Runs pre-flight verification on every node and prepares the run.
    /// Any mismatch in columns, keys, or replication membership aborts
    /// before a single block is hashed.
    pub async fn prepare(
        pools: Arc<ClusterPools>,
        table: &TableName,
        block_rows: u64,
        batch_size: u64,
        hash_workers: usize,
        filter: Option<String>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, AceError> {
        let meta = preflight(&pools, table).await?;
        Ok(Self {
            pools,
            meta: Arc::new(meta),
            block_rows,
            batch_size,
            hash_workers: hash_workers.max(1),
            filter,
            cancel,
        })
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    /// Executes the full pipeline and returns the summary plus the diff
    /// artifact, if any divergence was found.
    pub async fn run(&self) -> Result<DiffOutcome, AceError> {
        let reference = self.pools.reference_node().to_string();
        let client = self.pools.client(&reference).await?;
        let blocks = planner::plan_blocks(
            &client,
            &self.meta,
            self.block_rows,
            self.filter.as_deref(),
            &reference,
        )
        .await?;
        drop(client);

        let (total_rows, divergent) = self.hash_all_blocks(&blocks, &reference).await?;
        let mismatched_blocks = divergent.len() as u64;

        if divergent.is_empty() {
            info!(
                "Table {} is consistent across {} node(s); {} row(s) checked.",
                self.meta.table.display(),
                self.pools.node_names().len(),
                total_rows
            );
            return Ok(DiffOutcome {
                summary: DiffSummary {
                    total_rows,
                    divergent_rows: 0,
                    mismatched_blocks: 0,
                    diff_file_path: None,
                },
                diff: None,
            });
        }

        let mut diffs: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (block, max_rows) in divergent {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(AceError::Validation("task was cancelled".to_string()));
            }
            let merged = self.resolve_block(block, max_rows, 0).await?;
            for (node, mut rows) in merged {
                diffs.entry(node).or_default().append(&mut rows);
            }
        }

        let diff = DiffFile {
            schema: self.meta.table.schema.clone(),
            table: self.meta.table.name.clone(),
            primary_key: self.meta.key_names(),
            diffs,
        };
        let divergent_rows = diff.row_count();

        warn!(
            "Table {} diverges: {} row version(s) across {} mismatched block(s).",
            self.meta.table.display(),
            divergent_rows,
            mismatched_blocks
        );

        Ok(DiffOutcome {
            summary: DiffSummary {
                total_rows,
                divergent_rows,
                mismatched_blocks,
                diff_file_path: None,
            },
            diff: Some(diff),
        })
    }

    /// Fans hash jobs out over (block x node) pairs, bounded by the hash
    /// worker count, and reduces results by block. Returns the total row
    /// count on the reference node and the divergent blocks with the
    /// largest per-node row count seen for each.
    async fn hash_all_blocks(
        &self,
        blocks: &[Block],
        reference: &str,
    ) -> Result<(u64, Vec<(Block, u64)>), AceError> {
        let nodes = self.pools.node_names().to_vec();
        let node_count = nodes.len();
        let sem = Arc::new(Semaphore::new(self.hash_workers));
        let mut jobs: JoinSet<(usize, String, Result<BlockHash, AceError>)> = JoinSet::new();

        let mut pending: HashMap<usize, HashMap<String, BlockHash>> = HashMap::new();
        let mut divergent: Vec<(usize, u64)> = Vec::new();
        let mut total_rows: u64 = 0;
        let mut failure: Option<AceError> = None;

        let mut collect =
            |idx: usize,
             node: String,
             res: Result<BlockHash, AceError>,
             pending: &mut HashMap<usize, HashMap<String, BlockHash>>,
             divergent: &mut Vec<(usize, u64)>,
             total_rows: &mut u64,
             failure: &mut Option<AceError>| {
                match res {
                    Ok(hash) => {
                        let complete = {
                            let entry = pending.entry(idx).or_default();
                            entry.insert(node, hash);
                            entry.len() == node_count
                        };
                        if complete {
                            let entry = pending.remove(&idx).unwrap_or_default();
                            if let Some(reference_hash) = entry.get(reference) {
                                *total_rows += reference_hash.rows;
                            }
                            let first = entry.values().next().map(|h| h.digest.clone());
                            let agreeing =
                                first.is_some_and(|f| entry.values().all(|h| h.digest == f));
                            if !agreeing {
                                let max_rows =
                                    entry.values().map(|h| h.rows).max().unwrap_or_default();
                                divergent.push((idx, max_rows));
                            }
                        }
                    }
                    Err(e) => {
                        if failure.is_none() {
                            *failure = Some(e);
                        }
                    }
                }
            };

        'scheduling: for (idx, block) in blocks.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(AceError::Validation("task was cancelled".to_string()));
            }
            for node in &nodes {
                if failure.is_some() {
                    break 'scheduling;
                }
                let permit = sem
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| AceError::Internal("hash semaphore closed".to_string()))?;
                let pools = self.pools.clone();
                let meta = self.meta.clone();
                let filter = self.filter.clone();
                let block = block.clone();
                let node = node.clone();
                jobs.spawn(async move {
                    let res = hash_with_retry(&pools, &meta, &block, filter.as_deref(), &node).await;
                    drop(permit);
                    (idx, node, res)
                });
            }

            // Drain whatever has already finished so the pending map stays
            // proportional to the in-flight window.
            while let Some(res) = jobs.try_join_next() {
                if let Ok((idx, node, res)) = res {
                    collect(
                        idx,
                        node,
                        res,
                        &mut pending,
                        &mut divergent,
                        &mut total_rows,
                        &mut failure,
                    );
                }
            }
        }

        while let Some(res) = jobs.join_next().await {
            match res {
                Ok((idx, node, res)) => collect(
                    idx,
                    node,
                    res,
                    &mut pending,
                    &mut divergent,
                    &mut total_rows,
                    &mut failure,
                ),
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(AceError::Internal(format!("hash job panicked: {e}")));
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(AceError::PartialHashFailure(format!(
                "hash job failed after retry: {e}"
            )));
        }
        if !pending.is_empty() {
            return Err(AceError::PartialHashFailure(format!(
                "{} block(s) have incomplete hash results",
                pending.len()
            )));
        }

        divergent.sort_by_key(|(idx, _)| *idx);
        Ok((
            total_rows,
            divergent
                .into_iter()
                .map(|(idx, max_rows)| (blocks[idx].clone(), max_rows))
                .collect(),
        ))
    }

    /// Resolves one divergent block to row level. Blocks holding more than
    /// `batch_size` rows are halved and re-hashed recursively, so memory
    /// stays bounded and divergence is localised to the smallest block the
    /// key distribution allows.
    fn resolve_block(
        &self,
        block: Block,
        max_rows: u64,
        depth: usize,
    ) -> futures::future::BoxFuture<'_, Result<BTreeMap<String, Vec<Value>>, AceError>> {
        Box::pin(async move {
            if max_rows > self.batch_size && depth < MAX_SPLIT_DEPTH {
                if let Some(mid) = self.midpoint(&block, max_rows).await? {
                    let halves = [
                        Block {
                            lo: block.lo.clone(),
                            hi: Some(mid.clone()),
                        },
                        Block {
                            lo: Some(mid),
                            hi: block.hi.clone(),
                        },
                    ];

                    let mut merged: BTreeMap<String, Vec<Value>> = BTreeMap::new();
                    for half in halves {
                        let hashes = self.hash_on_all_nodes(&half).await?;
                        let first = hashes.values().next().map(|h| h.digest.clone());
                        let agreeing =
                            first.is_some_and(|f| hashes.values().all(|h| h.digest == f));
                        if agreeing {
                            continue;
                        }
                        let half_rows = hashes.values().map(|h| h.rows).max().unwrap_or_default();
                        let sub = self.resolve_block(half, half_rows, depth + 1).await?;
                        for (node, mut rows) in sub {
                            merged.entry(node).or_default().append(&mut rows);
                        }
                    }
                    return Ok(merged);
                }
            }

            self.fetch_and_merge(&block).await
        })
    }

    /// Hashes one range on every node, with the per-job retry policy.
    async fn hash_on_all_nodes(
        &self,
        block: &Block,
    ) -> Result<HashMap<String, BlockHash>, AceError> {
        let jobs = self.pools.node_names().iter().map(|node| {
            let pools = self.pools.clone();
            let meta = self.meta.clone();
            let filter = self.filter.clone();
            let block = block.clone();
            let node = node.clone();
            async move {
                let hash = hash_with_retry(&pools, &meta, &block, filter.as_deref(), &node).await?;
                Ok::<_, AceError>((node, hash))
            }
        });
        let results = futures::future::try_join_all(jobs).await?;
        Ok(results.into_iter().collect())
    }

    /// Finds a key near the middle of a range on the reference node, for
    /// halving. Returns `None` when no strictly interior midpoint exists.
    async fn midpoint(
        &self,
        block: &Block,
        max_rows: u64,
    ) -> Result<Option<Vec<String>>, AceError> {
        // Any node works as a boundary source; a midpoint only needs to
        // make progress, not to be perfectly balanced.
        let node = self.pools.reference_node().to_string();
        let client = self.pools.client(&node).await?;

        let (range, params) = hasher::key_range_clause(&self.meta, block);
        let canon: Vec<String> = self
            .meta
            .key
            .iter()
            .map(|c| hasher::canon_expr(&c.name, &c.data_type))
            .collect();
        let order: Vec<String> = self
            .meta
            .key
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect();
        let predicate = match &self.filter {
            Some(f) => format!("({range}) AND ({f})"),
            None => range,
        };
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} OFFSET {} LIMIT 1",
            canon.join(", "),
            self.meta.table.qualified(),
            predicate,
            order.join(", "),
            max_rows / 2
        );
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = client
            .query(&sql, &param_refs)
            .await
            .map_err(|e| AceError::from_pg(e, &node))?;

        let mid: Option<Vec<String>> = rows.first().map(|row| {
            (0..self.meta.key.len())
                .map(|i| row.get::<_, Option<String>>(i).unwrap_or_default())
                .collect()
        });

        // A midpoint equal to the lower bound cannot make progress.
        Ok(mid.filter(|m| block.lo.as_ref() != Some(m)))
    }

    /// Fetches full rows from every node for a terminal block and merges
    /// them into the row-level diff.
    async fn fetch_and_merge(
        &self,
        block: &Block,
    ) -> Result<BTreeMap<String, Vec<Value>>, AceError> {
        let fetches = self.pools.node_names().iter().map(|node| {
            let pools = self.pools.clone();
            let meta = self.meta.clone();
            let filter = self.filter.clone();
            let block = block.clone();
            let node = node.clone();
            async move {
                let client = pools.client(&node).await?;
                let rows = fetch_rows(&client, &meta, &block, filter.as_deref(), &node).await?;
                Ok::<_, AceError>((node, rows))
            }
        });
        let per_node: BTreeMap<String, Vec<Value>> = futures::future::try_join_all(fetches)
            .await?
            .into_iter()
            .collect();

        debug!(
            "Fetched {} row version(s) for a terminal block of {}.",
            per_node.values().map(Vec::len).sum::<usize>(),
            self.meta.table.display()
        );
        Ok(merge_row_sets(&per_node, &self.meta.key_names()))
    }
}

/// One attempt plus one retry with backoff for transient failures. The
/// session is re-acquired on retry so a dead connection is not reused.
async fn hash_with_retry(
    pools: &ClusterPools,
    meta: &TableMeta,
    block: &Block,
    filter: Option<&str>,
    node: &str,
) -> Result<BlockHash, AceError> {
    let mut retried = false;
    loop {
        let res = async {
            let client = pools.client(node).await?;
            hasher::hash_block(&client, meta, block, filter, node).await
        }
        .await;

        match res {
            Ok(hash) => return Ok(hash),
            Err(e) if e.is_transient() && !retried => {
                warn!("Transient failure hashing a block on '{node}', retrying: {e}");
                retried = true;
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fetches every row of a range as a JSON object keyed by column name, in
/// ascending key order.
pub async fn fetch_rows(
    client: &Object,
    meta: &TableMeta,
    block: &Block,
    filter: Option<&str>,
    node: &str,
) -> Result<Vec<Value>, AceError> {
    let (range, params) = hasher::key_range_clause(meta, block);
    let order: Vec<String> = meta.key.iter().map(|c| quote_ident(&c.name)).collect();
    let predicate = match filter {
        Some(f) => format!("({range}) AND ({f})"),
        None => range,
    };
    let sql = format!(
        "SELECT row_to_json(t) FROM (SELECT * FROM {} WHERE {} ORDER BY {}) t",
        meta.table.qualified(),
        predicate,
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

/// Verifies that the table looks identical on every node before any
/// hashing: same columns (name, type, position), same key, and active
/// replication membership. Returns the reference node's metadata.
pub async fn preflight(pools: &ClusterPools, table: &TableName) -> Result<TableMeta, AceError> {
    let mut reference_meta: Option<TableMeta> = None;

    for node in pools.node_names() {
        let client = pools.client(node).await?;
        let meta = planner::resolve_table_meta(&client, table, node).await?;

        let replicated: i64 = client
            .query_one(
                "SELECT count(*) FROM spock.tables \
                 WHERE nspname = $1 AND relname = $2 AND set_name IS NOT NULL",
                &[&table.schema, &table.name],
            )
            .await
            .map_err(|e| AceError::from_pg(e, node))?
            .get(0);
        if replicated == 0 {
            return Err(AceError::SchemaDivergence(format!(
                "table '{}' is not part of any replication set on node '{node}'",
                table.display()
            )));
        }

        match &reference_meta {
            None => reference_meta = Some(meta),
            Some(reference) => {
                if reference.columns != meta.columns {
                    return Err(AceError::SchemaDivergence(format!(
                        "column list of '{}' on node '{node}' does not match node '{}'",
                        table.display(),
                        pools.reference_node()
                    )));
                }
                if reference.key != meta.key {
                    return Err(AceError::SchemaDivergence(format!(
                        "key columns of '{}' on node '{node}' do not match node '{}'",
                        table.display(),
                        pools.reference_node()
                    )));
                }
            }
        }
    }

    reference_meta.ok_or_else(|| AceError::Internal("no nodes to diff".to_string()))
}

/// Sizes the per-task hash worker pool from the configured CPU ratio.
pub fn hash_worker_count(max_cpu_ratio: f64) -> usize {
    ((num_cpus::get() as f64) * max_cpu_ratio).round().max(1.0) as usize
}
