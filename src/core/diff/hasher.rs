// src/core/diff/hasher.rs

//! Block hashing: canonical row serialisation plus a SHA-256 digest,
//! computed client-side over one ordered range query per (node, block).
//!
//! Canonical encodings are produced in SQL so every node serialises a value
//! identically regardless of session settings: numerics as decimal text,
//! timestamps as ISO-8601 UTC with microsecond precision, booleans as
//! `t`/`f`, bytea as lowercase hex, text as UTF-8. NULL is encoded as the
//! byte 0x00 on the client.

use crate::core::diff::{Block, TableMeta, quote_ident};
use crate::core::errors::AceError;
use deadpool_postgres::Object;
use sha2::{Digest, Sha256};
use tokio_postgres::types::ToSql;

/// Separates column encodings within one row.
const COLUMN_SEP: u8 = 0x1f;
/// Terminates each row's serialisation.
const ROW_SEP: u8 = 0x1e;
/// Encodes SQL NULL.
const NULL_BYTE: u8 = 0x00;

/// Result of hashing one block on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHash {
    /// Lowercase hex SHA-256 digest of the block's canonical serialisation.
    pub digest: String,
    pub rows: u64,
}

/// SQL expression yielding the canonical text encoding of a column.
pub fn canon_expr(col: &str, data_type: &str) -> String {
    let ident = quote_ident(col);
    match data_type {
        "boolean" => format!(
            "CASE WHEN {ident} IS NULL THEN NULL WHEN {ident} THEN 't' ELSE 'f' END"
        ),
        "bytea" => format!("encode({ident}, 'hex')"),
        "timestamp with time zone" => format!(
            "to_char({ident} AT TIME ZONE 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.US\"Z\"')"
        ),
        "timestamp without time zone" => {
            format!("to_char({ident}, 'YYYY-MM-DD\"T\"HH24:MI:SS.US\"Z\"')")
        }
        _ => format!("{ident}::text"),
    }
}

/// SQL expression binding parameter `$n` (canonical text) back to the
/// column's declared type, for use in range comparisons.
pub fn bind_expr(n: usize, data_type: &str) -> String {
    match data_type {
        "bytea" => format!("decode(${n}, 'hex')"),
        "timestamp with time zone" => format!("${n}::timestamptz"),
        "timestamp without time zone" => format!("${n}::timestamp"),
        other => format!("CAST(${n} AS {other})"),
    }
}

/// Builds the `[lo, hi)` range predicate for a block using row-tuple
/// comparison, returning the SQL fragment and the parameter values in bind
/// order. An unbounded block yields `TRUE`.
pub fn key_range_clause(meta: &TableMeta, block: &Block) -> (String, Vec<String>) {
    let key_tuple = format!(
        "({})",
        meta.key
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut clauses = Vec::new();
    let mut params: Vec<String> = Vec::new();

    if let Some(lo) = &block.lo {
        let binds: Vec<String> = meta
            .key
            .iter()
            .enumerate()
            .map(|(i, c)| bind_expr(params.len() + i + 1, &c.data_type))
            .collect();
        params.extend(lo.iter().cloned());
        clauses.push(format!("{key_tuple} >= ({})", binds.join(", ")));
    }
    if let Some(hi) = &block.hi {
        let binds: Vec<String> = meta
            .key
            .iter()
            .enumerate()
            .map(|(i, c)| bind_expr(params.len() + i + 1, &c.data_type))
            .collect();
        params.extend(hi.iter().cloned());
        clauses.push(format!("{key_tuple} < ({})", binds.join(", ")));
    }

    if clauses.is_empty() {
        ("TRUE".to_string(), params)
    } else {
        (clauses.join(" AND "), params)
    }
}

/// The hash query: every column of every row in the block, canonically
/// encoded, in ascending key order.
pub fn hash_sql(meta: &TableMeta, block: &Block, filter: Option<&str>) -> (String, Vec<String>) {
    let (range, params) = key_range_clause(meta, block);
    let projections: Vec<String> = meta
        .columns
        .iter()
        .map(|c| canon_expr(&c.name, &c.data_type))
        .collect();
    let order: Vec<String> = meta.key.iter().map(|c| quote_ident(&c.name)).collect();
    let predicate = match filter {
        Some(f) => format!("({range}) AND ({f})"),
        None => range,
    };

    (
        format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {}",
            projections.join(", "),
            meta.table.qualified(),
            predicate,
            order.join(", ")
        ),
        params,
    )
}

/// Computes the domain-separated digest over canonically encoded rows.
/// `table_id` is the `schema.table` identifier; `columns` the ordered
/// column names. Deterministic across processes and platforms.
pub fn digest_rows<I, R>(table_id: &str, columns: &[String], rows: I) -> BlockHash
where
    I: IntoIterator<Item = R>,
    R: IntoIterator<Item = Option<Vec<u8>>>,
{
    let mut hasher = Sha256::new();
    hasher.update(b"ace:block-hash:v1");
    hasher.update([NULL_BYTE]);
    hasher.update(table_id.as_bytes());
    hasher.update([NULL_BYTE]);
    for col in columns {
        hasher.update(col.as_bytes());
        hasher.update([COLUMN_SEP]);
    }
    hasher.update([NULL_BYTE]);

    let mut count: u64 = 0;
    for row in rows {
        let mut first = true;
        for value in row {
            if !first {
                hasher.update([COLUMN_SEP]);
            }
            first = false;
            match value {
                Some(bytes) => hasher.update(&bytes),
                None => hasher.update([NULL_BYTE]),
            }
        }
        hasher.update([ROW_SEP]);
        count += 1;
    }

    BlockHash {
        digest: hex::encode(hasher.finalize()),
        rows: count,
    }
}

/// Hashes one block on one node: a single ordered range query whose rows
/// are folded straight into the digest.
pub async fn hash_block(
    client: &Object,
    meta: &TableMeta,
    block: &Block,
    filter: Option<&str>,
    node: &str,
) -> Result<BlockHash, AceError> {
    let (sql, params) = hash_sql(meta, block, filter);
    let param_refs: Vec<&(dyn ToSql + Sync)> =
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

    let rows = client
        .query(&sql, &param_refs)
        .await
        .map_err(|e| AceError::from_pg(e, node))?;

    let column_names: Vec<String> = meta.columns.iter().map(|c| c.name.clone()).collect();
    let encoded = rows.iter().map(|row| {
        (0..meta.columns.len()).map(move |i| {
            row.get::<_, Option<String>>(i)
                .map(|s| s.into_bytes())
        })
    });

    Ok(digest_rows(
        &meta.table.display(),
        &column_names,
        encoded,
    ))
}
