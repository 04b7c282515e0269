use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use agent::credentials::CredentialCache;
use agent::gcp::Gcp;
use agent::ops::{Ops, UnconfiguredProvisioner};
use agent::proxy::{self, ProxyContext};
use agent::{config, state, status, telemetry};
use tokio::net::TcpListener;
use tokio::{signal, sync::watch};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cfg = config::load()?;
    let metrics_handle = telemetry::init_metrics_recorder();
    let metrics_addr: SocketAddr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid metrics bind address: {}", err))?;

    let gcp = Arc::new(Gcp::new(&cfg)?);
    let credentials = CredentialCache::new(cfg.certs_dir()?);
    let state = state::new_state(cfg, gcp, credentials);

    info!(
        project = %state.cfg.project_id,
        zone = %state.cfg.zone,
        vm = %state.cfg.vm_name,
        model = %state.cfg.default_model,
        "agent starting"
    );

    // Bind before spawning anything so a port clash is a clean fatal error.
    let listen_addr = format!("{}:{}", state.cfg.listen_addr, state.cfg.listen_port);
    let listener = TcpListener::bind(&listen_addr).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            anyhow::anyhow!(
                "port {} already in use on {} (stop any local Ollama first)",
                state.cfg.listen_port,
                state.cfg.listen_addr
            )
        } else {
            anyhow::anyhow!("bind {listen_addr}: {err}")
        }
    })?;
    info!(%listen_addr, "proxy listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(err) = telemetry::serve_metrics(metrics_handle, metrics_addr).await {
            error!(?err, "metrics server exited with error");
        }
    });

    let (ops, ops_channels) = Ops::new(state.clone(), Arc::new(UnconfiguredProvisioner));
    let ops_handle = {
        let ops = ops.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = ops.run(ops_channels, shutdown).await {
                error!(?err, "ops loop terminated with error");
            }
        })
    };

    let status_handle = {
        let status_state = state.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = status::status_loop(status_state, shutdown).await {
                error!(?err, "status loop terminated with error");
            }
        })
    };

    let router = proxy::router(ProxyContext {
        state: state.clone(),
        ops: ops.clone(),
    });

    // The listener is dropped the moment the interrupt fires; in-flight
    // streams are cut rather than holding up firewall cleanup.
    tokio::select! {
        res = axum::serve(listener, router).into_future() => {
            res?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping agent");
        }
    }

    let _ = shutdown_tx.send(true);
    state.gate.close();
    ops.remove_firewall().await;

    let _ = ops_handle.await;
    let _ = status_handle.await;

    info!("agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
