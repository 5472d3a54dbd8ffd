// src/server/connection_loop.rs

//! The accept loop: TLS handshake with mandatory client certificates, CN
//! extraction, and per-connection HTTP serving. Also owns graceful
//! shutdown.

use super::context::ServerContext;
use super::gateway::{self, ClientIdentity};
use axum::Extension;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Resolves once the process has been asked to stop: SIGINT or SIGTERM on
/// Unix, Ctrl+C elsewhere.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut interrupt = signal(SignalKind::interrupt()).expect("cannot install SIGINT handler");
        let mut terminate =
            signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
        let which = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!("{which} received; draining connections before exit.");
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("cannot install Ctrl+C handler");
        info!("Ctrl+C received; draining connections before exit.");
    }
}

/// Pulls the subject CN out of the client's leaf certificate.
fn extract_cn(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(|cn| cn.to_string())
}

/// The main server loop that accepts connections and handles graceful
/// shutdown.
pub async fn run(mut ctx: ServerContext) {
    let router = gateway::router(ctx.state.clone());
    let mut client_tasks = JoinSet::new();

    loop {
        tokio::select! {
            // Shutdown wins over pending accepts.
            biased;

            _ = await_shutdown_signal() => {
                break;
            },

            // A background task exiting cleanly is normal (disabled
            // features return early); an error or panic takes the daemon
            // down with it.
            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => debug!("A background task ran to completion."),
                    Ok(Err(e)) => { error!("Background task error: {e}; stopping the daemon."); break; }
                    Err(e) => { error!("Background task panic: {e:?}; stopping the daemon."); break; }
                }
            },

            res = ctx.listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        debug!("Connection accepted from {addr}.");
                        let acceptor = ctx.acceptor.clone();
                        let router = router.clone();
                        client_tasks.spawn(async move {
                            // A connection without a valid client cert never
                            // gets past the handshake; that IS the rejection.
                            match acceptor.accept(socket).await {
                                Ok(tls_stream) => {
                                    let cn = {
                                        let (_, conn) = tls_stream.get_ref();
                                        conn.peer_certificates()
                                            .and_then(|certs| certs.first())
                                            .and_then(|cert| extract_cn(cert.as_ref()))
                                    };
                                    let service = TowerToHyperService::new(
                                        router.layer(Extension(ClientIdentity { cn })),
                                    );
                                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                                        .serve_connection(TokioIo::new(tls_stream), service)
                                        .await
                                    {
                                        debug!("Connection from {} ended: {}", addr, e);
                                    }
                                }
                                Err(e) => {
                                    warn!("TLS handshake with {addr} failed: {e}");
                                }
                            }
                        });
                    }
                    Err(e) => error!("Accept failed: {e}"),
                }
            },

            // Reap finished connection handlers.
            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A connection handler panicked: {e:?}");
                }
            },
        }
    }

    // Graceful shutdown: tell every background task to stop, drop the
    // open connections, then give in-flight work a bounded grace period.
    info!("Shutdown starting; signalling background tasks.");
    if ctx.shutdown_tx.send(()).is_err() {
        error!("No receivers for the shutdown signal; some tasks may linger.");
    }

    client_tasks.shutdown().await;
    info!("Client connections drained.");

    if tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Background tasks did not stop within the grace period.");
    };
    info!("ACE daemon stopped.");
}
