// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod connection_loop;
mod context;
pub mod gateway;
mod initialization;
mod spawner;

pub use context::AppState;
pub use gateway::{ClientIdentity, router};

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Initialize state, task store, TLS, and the listener.
    let (mut server_context, worker_driver) = initialization::setup(config).await?;

    // 2. Spawn all background tasks: the worker pool, recurring diff
    //    schedules, and the auto-repair loop.
    spawner::spawn_all(&mut server_context, worker_driver)?;

    // 3. Start the accept loop. This runs until shutdown.
    connection_loop::run(server_context).await;

    Ok(())
}
