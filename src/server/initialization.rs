// src/server/initialization.rs

//! Handles the complete server initialization process: configuration
//! cross-checks, task store recovery, and the mutual-TLS listener.

use super::context::{AppState, ServerContext};
use crate::config::Config;
use crate::core::cluster::ClusterSpec;
use crate::core::runner::TaskRunner;
use crate::core::scheduler::{WorkerPool, WorkerPoolDriver};
use crate::core::taskstore::TaskStore;
use anyhow::{Result, anyhow};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::info;

/// Initializes all server components before starting the main loop.
pub async fn setup(config: Config) -> Result<(ServerContext, WorkerPoolDriver)> {
    let config = Arc::new(config);
    let (shutdown_tx, _) = broadcast::channel(1);

    // Descriptor references in the config must resolve before anything
    // binds; a daemon with a dangling cluster name is a misconfiguration.
    if config.auto_repair.enabled {
        ClusterSpec::load(&config.cluster_dir, &config.auto_repair.cluster_name)
            .map_err(|e| anyhow!("auto_repair config: {e}"))?;
    }
    for job in &config.schedule.jobs {
        ClusterSpec::load(&config.cluster_dir, &job.cluster_name)
            .map_err(|e| anyhow!("schedule job '{}': {e}", job.name))?;
    }

    let acceptor = setup_tls(&config)?;

    tokio::fs::create_dir_all(&config.diff_dir).await?;
    let store = Arc::new(TaskStore::open(&config.task_dir).await?);
    info!("Task store ready at '{}'.", config.task_dir);

    let (workers, driver) = WorkerPool::new(config.worker_pool_size);
    let runner = Arc::new(TaskRunner::new(config.clone(), store.clone()));

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!(
        "ACE API listening on {}:{} (mutual TLS required).",
        config.host, config.port
    );

    let state = Arc::new(AppState {
        config,
        store,
        workers,
        runner,
    });

    Ok((
        ServerContext {
            state,
            listener,
            acceptor,
            shutdown_tx,
            background_tasks: JoinSet::new(),
        },
        driver,
    ))
}

/// Builds the TLS acceptor. Client certificates are mandatory and are
/// verified against the configured CA.
fn setup_tls(config: &Config) -> Result<TlsAcceptor> {
    info!("Loading TLS material (cert, key, client CA).");
    let certs = load_certs(&config.tls.cert_path)?;
    let key = load_key(&config.tls.key_path)?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(&config.tls.ca_path)? {
        roots
            .add(cert)
            .map_err(|e| anyhow!("Invalid CA certificate in '{}': {e}", config.tls.ca_path))?;
    }

    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| anyhow!("Cannot build client verifier: {e}"))?;

    let server_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Reads every certificate from a PEM file; at least one is required.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| anyhow!("Cannot open certificate file '{path}': {e}"))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("'{path}' contains no certificates"));
    }
    Ok(certs)
}

/// Reads the private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| anyhow!("Cannot open private key file '{path}': {e}"))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?
        .ok_or_else(|| anyhow!("'{path}' contains no private key"))
}
