// src/server/context.rs

use crate::config::Config;
use crate::core::runner::TaskRunner;
use crate::core::scheduler::WorkerPool;
use crate::core::taskstore::TaskStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

/// Shared state handed to the API gateway and the recurring jobs.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<TaskStore>,
    pub workers: WorkerPool,
    pub runner: Arc<TaskRunner>,
}

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub state: Arc<AppState>,
    pub listener: TcpListener,
    pub acceptor: TlsAcceptor,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
