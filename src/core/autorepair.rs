// src/core/autorepair.rs

//! The auto-repair loop.
//!
//! Spock records apply-side replication failures in `spock.exception_log`.
//! Two recurring jobs turn that log into repairs: the status promoter
//! mirrors novel log entries into the exception-status tables as PENDING,
//! and the repair driver classifies PENDING entries and applies a
//! synthesised single-row repair for the classes it can remediate.

use crate::core::cluster::ClusterSpec;
use crate::core::diff::{TableName, planner};
use crate::core::errors::AceError;
use crate::core::pool::ClusterPools;
use crate::core::repair;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tracing::{info, warn};

/// Everything the recurring auto-repair jobs need, captured from the
/// daemon configuration at startup.
#[derive(Debug, Clone)]
pub struct AutoRepairSettings {
    pub cluster_dir: String,
    pub cluster_name: String,
    pub dbname: String,
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ExceptionStatus {
    Pending,
    Resolved,
    Unresolvable,
}

/// How a logged replication exception can be remediated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    /// An incoming INSERT collided with an existing row: the remote row
    /// wins, applied as an upsert.
    InsertExists,
    /// An incoming UPDATE found no row to update: the remote row is
    /// inserted.
    UpdateMissing,
    /// An incoming DELETE found no row: already satisfied.
    DeleteMissing,
    /// Anything else is left for an operator.
    Unknown,
}

impl ExceptionClass {
    pub fn is_remediable(&self) -> bool {
        !matches!(self, ExceptionClass::Unknown)
    }
}

/// Classifies an exception-log entry from its operation and error message.
pub fn classify(operation: &str, error_message: &str) -> ExceptionClass {
    let msg = error_message.to_ascii_lowercase();
    match operation.to_ascii_uppercase().as_str() {
        "INSERT" if msg.contains("duplicate key") => ExceptionClass::InsertExists,
        "UPDATE" if msg.contains("did not find") || msg.contains("no rows") => {
            ExceptionClass::UpdateMissing
        }
        "DELETE" if msg.contains("did not find") || msg.contains("no rows") => {
            ExceptionClass::DeleteMissing
        }
        _ => ExceptionClass::Unknown,
    }
}

// Step 1: one PENDING parent per novel (origin, commit_ts, xid) trio.
const PROMOTE_PARENTS_SQL: &str = "INSERT INTO spock.exception_status \
     (remote_origin, remote_commit_ts, remote_xid, status) \
     SELECT DISTINCT remote_origin, remote_commit_ts, remote_xid, 'PENDING' \
     FROM spock.exception_log \
     ON CONFLICT (remote_origin, remote_commit_ts, remote_xid) DO NOTHING";

// Step 2: one PENDING child per failing command within a transaction.
const PROMOTE_DETAILS_SQL: &str = "INSERT INTO spock.exception_status_detail \
     (remote_origin, remote_commit_ts, remote_xid, command_counter, status) \
     SELECT DISTINCT remote_origin, remote_commit_ts, remote_xid, command_counter, 'PENDING' \
     FROM spock.exception_log \
     ON CONFLICT (remote_origin, remote_commit_ts, command_counter) DO NOTHING";

// Step 3: promote a parent to RESOLVED once every child is resolved.
const RESOLVE_PARENTS_SQL: &str = "UPDATE spock.exception_status es \
     SET status = 'RESOLVED', resolved_at = now(), resolution_details = $1::jsonb \
     FROM ( \
         SELECT remote_origin, remote_commit_ts, remote_xid \
         FROM spock.exception_status_detail \
         GROUP BY remote_origin, remote_commit_ts, remote_xid \
         HAVING count(*) = count(*) FILTER (WHERE status = 'RESOLVED') \
     ) done \
     WHERE es.remote_origin = done.remote_origin \
       AND es.remote_commit_ts = done.remote_commit_ts \
       AND es.remote_xid = done.remote_xid \
       AND es.status != 'RESOLVED'";

/// One promoter pass: runs the three idempotent statements on every node
/// of the configured cluster, each node in its own transaction.
pub async fn promote_exception_status(settings: &AutoRepairSettings) -> Result<(), AceError> {
    let spec = ClusterSpec::load(&settings.cluster_dir, &settings.cluster_name)?;
    let nodes = spec.resolve(Some(&settings.dbname), "all")?;
    let pools = ClusterPools::build(&nodes, settings.statement_timeout_ms, 1)?;

    let details = json!({
        "details": "All transaction operations auto-resolved by ACE. For specifics, \
                    check resolution_details on the exception_status_detail rows."
    })
    .to_string();

    for node in pools.node_names().to_vec() {
        let mut client = pools.client(&node).await?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| AceError::from_pg(e, &node))?;
        tx.execute(PROMOTE_PARENTS_SQL, &[])
            .await
            .map_err(|e| AceError::from_pg(e, &node))?;
        tx.execute(PROMOTE_DETAILS_SQL, &[])
            .await
            .map_err(|e| AceError::from_pg(e, &node))?;
        tx.execute(RESOLVE_PARENTS_SQL, &[&details])
            .await
            .map_err(|e| AceError::from_pg(e, &node))?;
        tx.commit().await.map_err(|e| AceError::from_pg(e, &node))?;
    }

    Ok(())
}

const PENDING_EXCEPTIONS_SQL: &str = "SELECT el.remote_origin, el.remote_commit_ts, el.remote_xid, el.command_counter::int8, \
            el.table_schema, el.table_name, el.operation, el.remote_new_tup, el.error_message \
     FROM spock.exception_status_detail esd \
     JOIN spock.exception_log el \
       ON el.remote_origin = esd.remote_origin \
      AND el.remote_commit_ts = esd.remote_commit_ts \
      AND el.command_counter = esd.command_counter \
     WHERE esd.status = 'PENDING' \
     ORDER BY el.remote_commit_ts, el.command_counter";

struct PendingException {
    remote_origin: String,
    remote_commit_ts: DateTime<Utc>,
    command_counter: i64,
    table_schema: String,
    table_name: String,
    operation: String,
    remote_new_tup: Option<Value>,
    error_message: String,
}

/// One driver pass: scan each node for PENDING exception details, classify
/// them, and either apply a synthesised single-row repair or mark the
/// entry UNRESOLVABLE.
pub async fn auto_repair_pass(settings: &AutoRepairSettings) -> Result<(), AceError> {
    let spec = ClusterSpec::load(&settings.cluster_dir, &settings.cluster_name)?;
    let nodes = spec.resolve(Some(&settings.dbname), "all")?;
    let pools = Arc::new(ClusterPools::build(
        &nodes,
        settings.statement_timeout_ms,
        2,
    )?);

    for node in pools.node_names().to_vec() {
        let pending = {
            let client = pools.client(&node).await?;
            let rows = client
                .query(PENDING_EXCEPTIONS_SQL, &[])
                .await
                .map_err(|e| AceError::from_pg(e, &node))?;
            rows.iter()
                .map(|row| PendingException {
                    remote_origin: row.get(0),
                    remote_commit_ts: row.get(1),
                    command_counter: row.get::<_, i64>(3),
                    table_schema: row.get(4),
                    table_name: row.get(5),
                    operation: row.get(6),
                    remote_new_tup: row.get(7),
                    error_message: row.get::<_, Option<String>>(8).unwrap_or_default(),
                })
                .collect::<Vec<_>>()
        };

        if pending.is_empty() {
            continue;
        }
        info!(
            "Auto-repair: {} pending exception(s) on node '{node}'.",
            pending.len()
        );

        for exception in pending {
            let class = classify(&exception.operation, &exception.error_message);
            let outcome = if class.is_remediable() {
                remediate(&pools, &node, &exception, class).await
            } else {
                Err(AceError::RepairError(format!(
                    "unremediable {} exception: {}",
                    exception.operation, exception.error_message
                )))
            };

            let (status, details) = match outcome {
                Ok(detail) => (ExceptionStatus::Resolved, detail),
                Err(e) => {
                    warn!(
                        "Auto-repair could not resolve an exception on '{node}' \
                         (table {}.{}): {e}",
                        exception.table_schema, exception.table_name
                    );
                    (
                        ExceptionStatus::Unresolvable,
                        json!({ "error": e.to_string() }),
                    )
                }
            };

            set_detail_status(
                &pools,
                &node,
                &exception.remote_origin,
                &exception.remote_commit_ts,
                Some(exception.command_counter),
                status,
                &details,
            )
            .await?;
        }
    }

    Ok(())
}

/// Applies the remediation for one classified exception and returns the
/// structured resolution details.
async fn remediate(
    pools: &Arc<ClusterPools>,
    node: &str,
    exception: &PendingException,
    class: ExceptionClass,
) -> Result<Value, AceError> {
    match class {
        ExceptionClass::DeleteMissing => Ok(json!({
            "action": "none",
            "reason": "row already absent; delete is satisfied",
        })),
        ExceptionClass::InsertExists | ExceptionClass::UpdateMissing => {
            let row = exception.remote_new_tup.clone().ok_or_else(|| {
                AceError::RepairError("exception log entry carries no remote tuple".to_string())
            })?;
            let table = TableName {
                schema: exception.table_schema.clone(),
                name: exception.table_name.clone(),
            };
            let client = pools.client(node).await?;
            let meta = planner::resolve_table_meta(&client, &table, node).await?;
            drop(client);

            repair::apply_row(pools, &meta, node, &row).await?;
            Ok(json!({
                "action": "upsert",
                "table": table.display(),
                "source": exception.remote_origin,
            }))
        }
        ExceptionClass::Unknown => unreachable!("unknown class is never remediated"),
    }
}

/// Records the outcome of one auto-repair attempt on a detail row.
async fn set_detail_status(
    pools: &Arc<ClusterPools>,
    node: &str,
    remote_origin: &str,
    remote_commit_ts: &DateTime<Utc>,
    command_counter: Option<i64>,
    status: ExceptionStatus,
    details: &Value,
) -> Result<(), AceError> {
    let client = pools.client(node).await?;
    let status_text = status.to_string();
    let details_text = details.to_string();

    match command_counter {
        Some(counter) => {
            client
                .execute(
                    "UPDATE spock.exception_status_detail \
                     SET status = $4, resolution_details = $5::jsonb \
                     WHERE remote_origin = $1 AND remote_commit_ts = $2 \
                       AND command_counter = $3",
                    &[
                        &remote_origin,
                        remote_commit_ts,
                        &counter,
                        &status_text,
                        &details_text,
                    ],
                )
                .await
                .map_err(|e| AceError::from_pg(e, node))?;
        }
        None => {
            client
                .execute(
                    "UPDATE spock.exception_status_detail \
                     SET status = $3, resolution_details = $4::jsonb \
                     WHERE remote_origin = $1 AND remote_commit_ts = $2",
                    &[&remote_origin, remote_commit_ts, &status_text, &details_text],
                )
                .await
                .map_err(|e| AceError::from_pg(e, node))?;
        }
    }
    Ok(())
}

/// Incoming payload for the update-spock-exception API.
#[derive(Debug, Clone, Deserialize)]
pub struct ExceptionStatusEntry {
    pub remote_origin: String,
    pub remote_commit_ts: String,
    pub remote_xid: i64,
    #[serde(default)]
    pub command_counter: Option<i64>,
    pub status: String,
    #[serde(default)]
    pub resolution_details: Option<Value>,
}

impl ExceptionStatusEntry {
    pub fn validate(&self) -> Result<ExceptionStatus, AceError> {
        if self.remote_origin.trim().is_empty() {
            return Err(AceError::Validation(
                "remote_origin is required".to_string(),
            ));
        }
        if DateTime::parse_from_rfc3339(&self.remote_commit_ts).is_err() {
            return Err(AceError::Validation(format!(
                "remote_commit_ts '{}' is not a valid RFC 3339 timestamp",
                self.remote_commit_ts
            )));
        }
        ExceptionStatus::from_str(&self.status).map_err(|_| {
            AceError::Validation(format!(
                "status must be one of PENDING, RESOLVED, UNRESOLVABLE; got '{}'",
                self.status
            ))
        })
    }
}

/// Applies an operator-submitted status update on one node. With a
/// `command_counter` only that detail row changes; without one the parent
/// row is updated and the status cascades to every detail of the trio.
pub async fn update_exception_status(
    pools: &ClusterPools,
    node: &str,
    entry: &ExceptionStatusEntry,
) -> Result<(), AceError> {
    let status = entry.validate()?;
    let details = entry
        .resolution_details
        .clone()
        .unwrap_or_else(|| json!({}))
        .to_string();
    let status_text = status.to_string();

    let mut client = pools.client(node).await?;
    let tx = client
        .transaction()
        .await
        .map_err(|e| AceError::from_pg(e, node))?;

    match entry.command_counter {
        Some(counter) => {
            let updated = tx
                .execute(
                    "UPDATE spock.exception_status_detail \
                     SET status = $4, resolution_details = $5::jsonb \
                     WHERE remote_origin = $1 AND remote_commit_ts = $2::timestamptz \
                       AND command_counter = $3",
                    &[
                        &entry.remote_origin,
                        &entry.remote_commit_ts,
                        &counter,
                        &status_text,
                        &details,
                    ],
                )
                .await
                .map_err(|e| AceError::from_pg(e, node))?;
            if updated == 0 {
                return Err(AceError::Validation(
                    "no exception detail matches the given trio and command_counter".to_string(),
                ));
            }
        }
        None => {
            let updated = tx
                .execute(
                    "UPDATE spock.exception_status \
                     SET status = $4, resolved_at = now(), resolution_details = $5::jsonb \
                     WHERE remote_origin = $1 AND remote_commit_ts = $2::timestamptz \
                       AND remote_xid = $3",
                    &[
                        &entry.remote_origin,
                        &entry.remote_commit_ts,
                        &entry.remote_xid,
                        &status_text,
                        &details,
                    ],
                )
                .await
                .map_err(|e| AceError::from_pg(e, node))?;
            if updated == 0 {
                return Err(AceError::Validation(
                    "no exception status matches the given trio".to_string(),
                ));
            }
            tx.execute(
                "UPDATE spock.exception_status_detail \
                 SET status = $4, resolution_details = $5::jsonb \
                 WHERE remote_origin = $1 AND remote_commit_ts = $2::timestamptz \
                   AND remote_xid = $3",
                &[
                    &entry.remote_origin,
                    &entry.remote_commit_ts,
                    &entry.remote_xid,
                    &status_text,
                    &details,
                ],
            )
            .await
            .map_err(|e| AceError::from_pg(e, node))?;
        }
    }

    tx.commit().await.map_err(|e| AceError::from_pg(e, node))?;
    Ok(())
}
