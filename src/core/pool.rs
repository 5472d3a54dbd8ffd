// src/core/pool.rs

//! Per-task connection pools.
//!
//! Every task builds its own [`ClusterPools`]: one bounded pool per node,
//! sized to the task's fan-out. Sessions carry `statement_timeout` from
//! configuration and are returned to the pool on every exit path. Pools are
//! dropped with the task; there is no cross-task connection reuse.

use crate::core::cluster::ResolvedNode;
use crate::core::errors::AceError;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod};
use std::collections::HashMap;
use std::time::Duration;
use tokio_postgres::NoTls;

pub struct ClusterPools {
    /// Node order follows the resolved cluster descriptor.
    names: Vec<String>,
    pools: HashMap<String, Pool>,
}

impl ClusterPools {
    /// Builds one pool per node. `max_per_node` bounds the concurrency a
    /// single task can put on any one node.
    pub fn build(
        nodes: &[ResolvedNode],
        statement_timeout_ms: u64,
        max_per_node: usize,
    ) -> Result<Self, AceError> {
        let mut names = Vec::with_capacity(nodes.len());
        let mut pools = HashMap::with_capacity(nodes.len());

        for node in nodes {
            let mut cfg = tokio_postgres::Config::new();
            cfg.host(&node.host)
                .port(node.port)
                .dbname(&node.dbname)
                .user(&node.user)
                .password(&node.password)
                .application_name("ace")
                .connect_timeout(Duration::from_secs(10))
                .options(&format!("-c statement_timeout={statement_timeout_ms}"));

            let manager = Manager::from_config(
                cfg,
                NoTls,
                ManagerConfig {
                    recycling_method: RecyclingMethod::Fast,
                },
            );
            let pool = Pool::builder(manager)
                .max_size(max_per_node.max(1))
                .build()
                .map_err(|e| AceError::Internal(format!("pool build failed: {e}")))?;

            names.push(node.name.clone());
            pools.insert(node.name.clone(), pool);
        }

        Ok(Self { names, pools })
    }

    /// Node names in descriptor order.
    pub fn node_names(&self) -> &[String] {
        &self.names
    }

    /// The reference node used for planning queries.
    pub fn reference_node(&self) -> &str {
        &self.names[0]
    }

    /// Acquires a session on the given node.
    pub async fn client(&self, node: &str) -> Result<Object, AceError> {
        let pool = self
            .pools
            .get(node)
            .ok_or_else(|| AceError::Internal(format!("no pool for node '{node}'")))?;

        pool.get().await.map_err(|e| match e {
            PoolError::Backend(pg) => AceError::from_pg(pg, node),
            other => AceError::ConnectRefused {
                node: node.to_string(),
                detail: other.to_string(),
            },
        })
    }
}
