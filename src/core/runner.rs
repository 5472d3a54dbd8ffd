// src/core/runner.rs

//! Worker-side task execution.
//!
//! The API gateway admits a task with basic validation only and hands a
//! typed payload to the worker pool. Everything that needs network I/O —
//! cluster resolution, schema pre-flight, the diff or repair itself —
//! happens here, and the outcome is written back to the task store. A task
//! error never propagates past this module; it becomes a FAILED record.

use crate::config::Config;
use crate::core::cluster::ClusterSpec;
use crate::core::diff::executor::{TableDiffRun, hash_worker_count};
use crate::core::diff::rerun::{RerunBehavior, table_rerun};
use crate::core::diff::{DiffFile, TableName, schema, spock};
use crate::core::errors::AceError;
use crate::core::pool::ClusterPools;
use crate::core::repair::{RepairOptions, table_repair};
use crate::core::taskstore::{TaskStatus, TaskStore, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDiffParams {
    pub cluster_name: String,
    pub table_name: String,
    pub dbname: Option<String>,
    pub block_rows: u64,
    pub max_cpu_ratio: f64,
    pub batch_size: u64,
    pub nodes: String,
    pub output: String,
    pub quiet: bool,
    pub table_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRepairParams {
    pub cluster_name: String,
    pub diff_file: String,
    pub source_of_truth: Option<String>,
    pub table_name: String,
    pub dbname: Option<String>,
    pub dry_run: bool,
    pub quiet: bool,
    pub generate_report: bool,
    pub upsert_only: bool,
    pub fix_nulls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRerunParams {
    pub cluster_name: String,
    pub diff_file: String,
    pub table_name: String,
    pub dbname: Option<String>,
    pub quiet: bool,
    pub behavior: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepsetDiffParams {
    pub cluster_name: String,
    pub repset_name: String,
    pub dbname: Option<String>,
    pub block_rows: u64,
    pub max_cpu_ratio: f64,
    pub batch_size: u64,
    pub nodes: String,
    pub output: String,
    pub quiet: bool,
    pub skip_tables: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDiffParams {
    pub cluster_name: String,
    pub schema_name: String,
    pub dbname: Option<String>,
    pub nodes: String,
    pub quiet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpockDiffParams {
    pub cluster_name: String,
    pub dbname: Option<String>,
    pub nodes: String,
    pub quiet: bool,
}

/// The closed set of work a worker can be handed. Each variant carries the
/// validated parameters snapshotted into the task's context at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskPayload {
    TableDiff(TableDiffParams),
    TableRepair(TableRepairParams),
    TableRerun(TableRerunParams),
    RepsetDiff(RepsetDiffParams),
    SchemaDiff(SchemaDiffParams),
    SpockDiff(SpockDiffParams),
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::TableDiff(_) => TaskType::TableDiff,
            TaskPayload::TableRepair(_) => TaskType::TableRepair,
            TaskPayload::TableRerun(_) => TaskType::TableRerun,
            TaskPayload::RepsetDiff(_) => TaskType::RepsetDiff,
            TaskPayload::SchemaDiff(_) => TaskType::SchemaDiff,
            TaskPayload::SpockDiff(_) => TaskType::SpockDiff,
        }
    }

    /// The JSON snapshot persisted as the task context.
    pub fn context(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub struct TaskRunner {
    pub config: Arc<Config>,
    pub store: Arc<TaskStore>,
}

impl TaskRunner {
    pub fn new(config: Arc<Config>, store: Arc<TaskStore>) -> Self {
        Self { config, store }
    }

    /// Executes one task to completion and records the outcome. Never
    /// panics the worker and never crashes the process.
    pub async fn run(self: Arc<Self>, task_id: String) {
        if let Err(e) = self.store.mark_started(&task_id).await {
            error!("Cannot start task {task_id}: {e}");
            return;
        }

        let payload = match self
            .store
            .get(&task_id)
            .and_then(|record| {
                serde_json::from_value::<TaskPayload>(record.task_context.clone())
                    .map_err(|e| AceError::Internal(format!("corrupt task context: {e}")))
            }) {
            Ok(payload) => payload,
            Err(e) => {
                self.fail(&task_id, &e).await;
                return;
            }
        };

        info!("Task {task_id} ({}) started.", payload.task_type());
        match self.execute(&payload).await {
            Ok((result, fully_applied)) => {
                let status = if fully_applied {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                };
                if let Err(e) = self.store.finish(&task_id, status, Some(result)).await {
                    error!("Cannot finish task {task_id}: {e}");
                } else {
                    info!("Task {task_id} finished: {status}.");
                }
            }
            Err(e) => self.fail(&task_id, &e).await,
        }
    }

    async fn fail(&self, task_id: &str, e: &AceError) {
        error!("Task {task_id} failed: {e}");
        let result = json!({ "error": { "kind": e.kind(), "message": e.to_string() } });
        if let Err(store_err) = self
            .store
            .finish(task_id, TaskStatus::Failed, Some(result))
            .await
        {
            error!("Cannot record failure of task {task_id}: {store_err}");
        }
    }

    async fn execute(&self, payload: &TaskPayload) -> Result<(Value, bool), AceError> {
        match payload {
            TaskPayload::TableDiff(p) => self.table_diff(p).await.map(|v| (v, true)),
            TaskPayload::TableRepair(p) => self.table_repair(p).await,
            TaskPayload::TableRerun(p) => self.table_rerun(p).await.map(|v| (v, true)),
            TaskPayload::RepsetDiff(p) => self.repset_diff(p).await,
            TaskPayload::SchemaDiff(p) => self.schema_diff(p).await.map(|v| (v, true)),
            TaskPayload::SpockDiff(p) => self.spock_diff(p).await.map(|v| (v, true)),
        }
    }

    fn pools_for(
        &self,
        cluster_name: &str,
        dbname: Option<&str>,
        nodes: &str,
        max_per_node: usize,
    ) -> Result<Arc<ClusterPools>, AceError> {
        let spec = ClusterSpec::load(&self.config.cluster_dir, cluster_name)?;
        let resolved = spec.resolve(dbname, nodes)?;
        Ok(Arc::new(ClusterPools::build(
            &resolved,
            self.config.statement_timeout_ms,
            max_per_node,
        )?))
    }

    async fn table_diff(&self, p: &TableDiffParams) -> Result<Value, AceError> {
        let workers = hash_worker_count(p.max_cpu_ratio);
        let pools = self.pools_for(&p.cluster_name, p.dbname.as_deref(), &p.nodes, workers)?;
        let table = TableName::parse(&p.table_name)?;

        let run = TableDiffRun::prepare(
            pools,
            &table,
            p.block_rows,
            p.batch_size,
            workers,
            p.table_filter.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .await?;

        let mut outcome = run.run().await?;
        if let Some(diff) = &outcome.diff {
            let path = diff.write(&self.config.diff_dir, &p.cluster_name)?;
            outcome.summary.diff_file_path = Some(path.display().to_string());
        }
        Ok(serde_json::to_value(&outcome.summary)?)
    }

    async fn table_repair(&self, p: &TableRepairParams) -> Result<(Value, bool), AceError> {
        let pools = self.pools_for(&p.cluster_name, p.dbname.as_deref(), "all", 2)?;
        let table = TableName::parse(&p.table_name)?;
        let diff = DiffFile::load(&p.diff_file)?;

        if diff.schema != table.schema || diff.table != table.name {
            return Err(AceError::Validation(format!(
                "diff file describes {}.{}, not {}",
                diff.schema,
                diff.table,
                table.display()
            )));
        }

        let reference = pools.reference_node().to_string();
        let client = pools.client(&reference).await?;
        let meta =
            crate::core::diff::planner::resolve_table_meta(&client, &table, &reference).await?;
        drop(client);

        let opts = RepairOptions {
            source_of_truth: p.source_of_truth.clone(),
            fix_nulls: p.fix_nulls,
            dry_run: p.dry_run,
            upsert_only: p.upsert_only,
            generate_report: p.generate_report,
        };
        table_repair(&pools, &meta, &diff, &opts).await
    }

    async fn table_rerun(&self, p: &TableRerunParams) -> Result<Value, AceError> {
        let behavior = RerunBehavior::from_str(&p.behavior)
            .map_err(|_| AceError::Validation(format!("invalid behavior '{}'", p.behavior)))?;
        let pools = self.pools_for(&p.cluster_name, p.dbname.as_deref(), "all", 2)?;
        let table = TableName::parse(&p.table_name)?;
        let prior = DiffFile::load(&p.diff_file)?;

        let reference = pools.reference_node().to_string();
        let client = pools.client(&reference).await?;
        let meta =
            crate::core::diff::planner::resolve_table_meta(&client, &table, &reference).await?;
        drop(client);

        let mut outcome =
            table_rerun(pools, &meta, &prior, behavior, self.config.batch_size).await?;
        if let Some(diff) = &outcome.diff {
            let path = diff.write(&self.config.diff_dir, &p.cluster_name)?;
            outcome.summary.diff_file_path = Some(path.display().to_string());
        }
        Ok(serde_json::to_value(&outcome.summary)?)
    }

    async fn repset_diff(&self, p: &RepsetDiffParams) -> Result<(Value, bool), AceError> {
        let workers = hash_worker_count(p.max_cpu_ratio);
        let pools = self.pools_for(&p.cluster_name, p.dbname.as_deref(), &p.nodes, workers)?;

        let reference = pools.reference_node().to_string();
        let tables = spock::repset_tables(&pools, &reference, &p.repset_name).await?;
        if tables.is_empty() {
            return Err(AceError::Validation(format!(
                "replication set '{}' has no tables",
                p.repset_name
            )));
        }

        let skipped: Vec<&str> = p
            .skip_tables
            .as_deref()
            .map(|s| s.split(',').map(str::trim).collect())
            .unwrap_or_default();

        let mut results = serde_json::Map::new();
        let mut all_ok = true;
        for table_name in &tables {
            if skipped.contains(&table_name.as_str()) {
                results.insert(table_name.clone(), json!({ "skipped": true }));
                continue;
            }
            let sub = TableDiffParams {
                cluster_name: p.cluster_name.clone(),
                table_name: table_name.clone(),
                dbname: p.dbname.clone(),
                block_rows: p.block_rows,
                max_cpu_ratio: p.max_cpu_ratio,
                batch_size: p.batch_size,
                nodes: p.nodes.clone(),
                output: p.output.clone(),
                quiet: p.quiet,
                table_filter: None,
            };
            match self.table_diff(&sub).await {
                Ok(summary) => {
                    results.insert(table_name.clone(), summary);
                }
                Err(e) => {
                    all_ok = false;
                    results.insert(
                        table_name.clone(),
                        json!({ "error": { "kind": e.kind(), "message": e.to_string() } }),
                    );
                }
            }
        }

        Ok((
            json!({ "repset": p.repset_name, "tables": results }),
            all_ok,
        ))
    }

    async fn schema_diff(&self, p: &SchemaDiffParams) -> Result<Value, AceError> {
        let pools = self.pools_for(&p.cluster_name, p.dbname.as_deref(), &p.nodes, 2)?;
        schema::schema_diff(&pools, &p.schema_name).await
    }

    async fn spock_diff(&self, p: &SpockDiffParams) -> Result<Value, AceError> {
        let pools = self.pools_for(&p.cluster_name, p.dbname.as_deref(), &p.nodes, 2)?;
        spock::spock_diff(&pools).await
    }
}
