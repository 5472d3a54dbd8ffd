// src/core/diff/planner.rs

//! Partitions a table's key space into fixed-row-count blocks.
//!
//! Block boundaries are chosen on one reference node and reused verbatim on
//! every other node, so all nodes hash the same key ranges.

use crate::core::diff::hasher::canon_expr;
use crate::core::diff::{Block, ColumnInfo, TableMeta, TableName, quote_ident};
use crate::core::errors::AceError;
use deadpool_postgres::Object;
use tracing::debug;

const COLUMNS_SQL: &str = "SELECT column_name, data_type, ordinal_position::int4 \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2 \
     ORDER BY ordinal_position";

const PRIMARY_KEY_SQL: &str = "SELECT a.attname, format_type(a.atttypid, a.atttypmod) \
     FROM pg_index i \
     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
     WHERE i.indrelid = to_regclass($1) AND i.indisprimary \
     ORDER BY array_position(i.indkey, a.attnum)";

// Fallback for tables without a declared primary key: the unique index
// chosen as the table's replica identity.
const REPLIDENT_KEY_SQL: &str = "SELECT a.attname, format_type(a.atttypid, a.atttypmod) \
     FROM pg_index i \
     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
     WHERE i.indrelid = to_regclass($1) AND i.indisunique AND i.indisreplident \
     ORDER BY array_position(i.indkey, a.attnum)";

/// Resolves the column list and key columns for a table on one node.
/// Fails with `NoKey` when neither a primary key nor a replica-identity
/// unique key is declared.
pub async fn resolve_table_meta(
    client: &Object,
    table: &TableName,
    node: &str,
) -> Result<TableMeta, AceError> {
    let rows = client
        .query(COLUMNS_SQL, &[&table.schema, &table.name])
        .await
        .map_err(|e| AceError::from_pg(e, node))?;

    if rows.is_empty() {
        return Err(AceError::Validation(format!(
            "table '{}' does not exist on node '{node}'",
            table.display()
        )));
    }

    let columns: Vec<ColumnInfo> = rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.get(0),
            data_type: row.get(1),
            position: row.get(2),
        })
        .collect();

    let regclass = table.display();
    let mut key_rows = client
        .query(PRIMARY_KEY_SQL, &[&regclass])
        .await
        .map_err(|e| AceError::from_pg(e, node))?;
    if key_rows.is_empty() {
        key_rows = client
            .query(REPLIDENT_KEY_SQL, &[&regclass])
            .await
            .map_err(|e| AceError::from_pg(e, node))?;
    }
    if key_rows.is_empty() {
        return Err(AceError::NoKey(table.display()));
    }

    let key: Vec<ColumnInfo> = key_rows
        .iter()
        .map(|row| {
            let name: String = row.get(0);
            let data_type: String = row.get(1);
            let position = columns
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.position)
                .unwrap_or_default();
            ColumnInfo {
                name,
                data_type,
                position,
            }
        })
        .collect();

    Ok(TableMeta {
        table: table.clone(),
        columns,
        key,
    })
}

/// The planning query: every `block_rows`-th key in ascending order, in the
/// canonical text encoding used for range binding.
fn boundary_sql(meta: &TableMeta, block_rows: u64, filter: Option<&str>) -> String {
    let key_idents: Vec<String> = meta.key.iter().map(|c| quote_ident(&c.name)).collect();
    let canon: Vec<String> = meta
        .key
        .iter()
        .map(|c| format!("{} AS {}", canon_expr(&c.name, &c.data_type), quote_ident(&c.name)))
        .collect();
    let predicate = filter.map(|f| format!(" WHERE {f}")).unwrap_or_default();

    // Boundaries sit on rows 1 + N * block_rows, so every block holds
    // exactly block_rows rows on the reference node.
    format!(
        "SELECT {} FROM (SELECT {}, row_number() OVER (ORDER BY {}) AS rn FROM {}{}) ranked \
         WHERE rn % {} = 1 AND rn > 1 ORDER BY {}",
        canon.join(", "),
        key_idents.join(", "),
        key_idents.join(", "),
        meta.table.qualified(),
        predicate,
        block_rows,
        key_idents.join(", ")
    )
}

/// Runs the planning query on the reference node and returns the ordered
/// block list covering the whole key space.
pub async fn plan_blocks(
    client: &Object,
    meta: &TableMeta,
    block_rows: u64,
    filter: Option<&str>,
    node: &str,
) -> Result<Vec<Block>, AceError> {
    let sql = boundary_sql(meta, block_rows, filter);
    let rows = client
        .query(&sql, &[])
        .await
        .map_err(|e| AceError::from_pg(e, node))?;

    let boundaries: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            (0..meta.key.len())
                .map(|i| row.get::<_, Option<String>>(i).unwrap_or_default())
                .collect()
        })
        .collect();

    let blocks = blocks_from_boundaries(boundaries);
    debug!(
        "Planned {} block(s) of ~{} rows for {} on node '{}'.",
        blocks.len(),
        block_rows,
        meta.table.display(),
        node
    );
    Ok(blocks)
}

/// Turns an ascending boundary list into half-open blocks:
/// `[(-inf, b0), (b0, b1), …, (bn-1, +inf)]`. With no boundaries the whole
/// key space is one block.
pub fn blocks_from_boundaries(boundaries: Vec<Vec<String>>) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(boundaries.len() + 1);
    let mut lo: Option<Vec<String>> = None;
    for boundary in boundaries {
        blocks.push(Block {
            lo: lo.clone(),
            hi: Some(boundary.clone()),
        });
        lo = Some(boundary);
    }
    blocks.push(Block { lo, hi: None });
    blocks
}
