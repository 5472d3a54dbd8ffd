// src/core/cluster.rs

//! Cluster descriptors: named sets of nodes with database-level credentials.
//!
//! A descriptor is loaded once from `<cluster_dir>/<name>.json` and is
//! immutable afterwards. Resolution combines the selected database section
//! with each node record into the connection parameters a task uses.

use crate::core::errors::AceError;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Database-level section of a descriptor: the credentials shared by every
/// node for one replicated database.
#[derive(Deserialize, Clone)]
pub struct DatabaseSpec {
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
}

// Passwords must never reach logs, so Debug is written by hand.
impl fmt::Debug for DatabaseSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSpec")
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .finish()
    }
}

/// Per-node overrides: where the node lives and what it is called.
#[derive(Deserialize, Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    /// Hostname or IP the node is reachable at.
    #[serde(alias = "public_ip")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
}

fn default_pg_port() -> u16 {
    5432
}
fn default_is_active() -> bool {
    true
}

/// A fully loaded cluster descriptor.
#[derive(Deserialize, Debug, Clone)]
pub struct ClusterSpec {
    pub cluster_name: String,
    pub databases: Vec<DatabaseSpec>,
    pub nodes: Vec<NodeSpec>,
}

/// Connection parameters for one node, produced by combining a database
/// section with a node record.
#[derive(Clone)]
pub struct ResolvedNode {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for ResolvedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedNode")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ClusterSpec {
    fn descriptor_path(cluster_dir: &str, name: &str) -> PathBuf {
        Path::new(cluster_dir).join(format!("{name}.json"))
    }

    /// Whether a descriptor file exists for the given cluster name.
    pub fn exists(cluster_dir: &str, name: &str) -> bool {
        Self::descriptor_path(cluster_dir, name).is_file()
    }

    /// Loads and validates a cluster descriptor. Performs no network I/O.
    pub fn load(cluster_dir: &str, name: &str) -> Result<Self, AceError> {
        let path = Self::descriptor_path(cluster_dir, name);
        let contents = std::fs::read_to_string(&path)
            .map_err(|_| AceError::ClusterNotFound(name.to_string()))?;

        let spec: ClusterSpec = serde_json::from_str(&contents).map_err(|e| {
            AceError::InvalidClusterSpec(format!("'{}': {e}", path.display()))
        })?;

        if spec.databases.is_empty() {
            return Err(AceError::InvalidClusterSpec(format!(
                "cluster '{name}' declares no databases"
            )));
        }
        if spec.nodes.is_empty() {
            return Err(AceError::InvalidClusterSpec(format!(
                "cluster '{name}' declares no nodes"
            )));
        }
        for db in &spec.databases {
            if db.db_name.trim().is_empty() || db.db_user.trim().is_empty() {
                return Err(AceError::InvalidClusterSpec(format!(
                    "cluster '{name}' has a database entry without db_name or db_user"
                )));
            }
        }
        for node in &spec.nodes {
            if node.name.trim().is_empty() || node.host.trim().is_empty() {
                return Err(AceError::InvalidClusterSpec(format!(
                    "cluster '{name}' has a node entry without name or host"
                )));
            }
        }

        Ok(spec)
    }

    /// Picks the database section to use: the named one, or the first
    /// declared database when no name is given.
    pub fn database(&self, dbname: Option<&str>) -> Result<&DatabaseSpec, AceError> {
        match dbname {
            None => Ok(&self.databases[0]),
            Some(name) => self
                .databases
                .iter()
                .find(|db| db.db_name == name)
                .ok_or_else(|| {
                    AceError::Validation(format!(
                        "database '{name}' not found in cluster '{}'",
                        self.cluster_name
                    ))
                }),
        }
    }

    /// Combines the selected database section with every active node,
    /// optionally restricted to a node-name filter ("all" or a
    /// comma-separated list). Node order follows the descriptor.
    pub fn resolve(
        &self,
        dbname: Option<&str>,
        nodes: &str,
    ) -> Result<Vec<ResolvedNode>, AceError> {
        let db = self.database(dbname)?;

        let wanted: Option<Vec<&str>> = if nodes.trim().eq_ignore_ascii_case("all") {
            None
        } else {
            Some(nodes.split(',').map(str::trim).collect())
        };

        if let Some(names) = &wanted {
            for name in names {
                if !self.nodes.iter().any(|n| n.name == *name) {
                    return Err(AceError::Validation(format!(
                        "node '{name}' not found in cluster '{}'",
                        self.cluster_name
                    )));
                }
            }
        }

        let resolved: Vec<ResolvedNode> = self
            .nodes
            .iter()
            .filter(|n| n.is_active)
            .filter(|n| {
                wanted
                    .as_ref()
                    .is_none_or(|names| names.contains(&n.name.as_str()))
            })
            .map(|n| ResolvedNode {
                name: n.name.clone(),
                host: n.host.clone(),
                port: n.port,
                dbname: db.db_name.clone(),
                user: db.db_user.clone(),
                password: db.db_password.clone(),
            })
            .collect();

        if resolved.len() < 2 {
            return Err(AceError::Validation(format!(
                "cluster '{}' resolves to fewer than two active nodes",
                self.cluster_name
            )));
        }

        Ok(resolved)
    }

    /// Like [`resolve`](Self::resolve) but without the two-node floor, for
    /// operations that legitimately target a single node.
    pub fn resolve_one(&self, dbname: Option<&str>, node: &str) -> Result<ResolvedNode, AceError> {
        let db = self.database(dbname)?;
        self.nodes
            .iter()
            .find(|n| n.name == node)
            .map(|n| ResolvedNode {
                name: n.name.clone(),
                host: n.host.clone(),
                port: n.port,
                dbname: db.db_name.clone(),
                user: db.db_user.clone(),
                password: db.db_password.clone(),
            })
            .ok_or_else(|| {
                AceError::Validation(format!(
                    "node '{node}' not found in cluster '{}'",
                    self.cluster_name
                ))
            })
    }
}
