use std::fmt;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::credentials::upstream_client;
use crate::state::SharedState;
use crate::SERVER_NAME;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider lifecycle of the remote VM, refined locally with `Booting`
/// between RUNNING and the first successful health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Unknown,
    NotFound,
    Stopped,
    Transitional,
    Running,
    Booting,
    AuthError,
}

impl RemoteState {
    pub fn label(&self) -> &'static str {
        match self {
            RemoteState::Unknown => "UNKNOWN",
            RemoteState::NotFound => "NOT FOUND",
            RemoteState::Stopped => "STOPPED",
            RemoteState::Transitional => "PENDING",
            RemoteState::Running => "RUNNING",
            RemoteState::Booting => "BOOTING",
            RemoteState::AuthError => "AUTH ERROR",
        }
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn classify(provider_status: &str) -> RemoteState {
    match provider_status {
        "RUNNING" => RemoteState::Running,
        "TERMINATED" | "STOPPED" | "SUSPENDED" => RemoteState::Stopped,
        "PROVISIONING" | "STAGING" | "STOPPING" | "SUSPENDING" | "REPAIRING" => {
            RemoteState::Transitional
        }
        _ => RemoteState::Unknown,
    }
}

/// Observed remote state plus the provider's own label for display. API
/// failures that mean "gone" or "re-authenticate" become states rather than
/// errors so the status surface can render them.
pub async fn get_status(state: &SharedState) -> anyhow::Result<(RemoteState, String)> {
    let cfg = &state.cfg;
    match state
        .gcp
        .get_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
        .await
    {
        Ok(instance) => {
            if let Some(ip) = instance.external_ip() {
                state.set_vm_ip(ip);
            }
            let remote = classify(&instance.status);
            let label = if instance.status.is_empty() {
                remote.label().to_string()
            } else {
                instance.status
            };
            Ok((remote, label))
        }
        Err(err) if err.is_not_found() => Ok((RemoteState::NotFound, "NOT FOUND".to_string())),
        Err(err) if err.is_auth_error() => {
            warn!(%err, "provider auth failure while checking VM status");
            Ok((RemoteState::AuthError, "AUTH ERROR".to_string()))
        }
        Err(err) => Err(err).context("get VM status"),
    }
}

pub async fn is_vm_stopped(state: &SharedState) -> anyhow::Result<bool> {
    let cfg = &state.cfg;
    let instance = state
        .gcp
        .get_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
        .await
        .context("get instance")?;
    Ok(classify(&instance.status) == RemoteState::Stopped)
}

/// Starts the VM when stopped and waits until it is RUNNING with an
/// external IP and the model server answers the health probe. Returns the
/// external IP. Poll loops are bounded by `poll_max_attempts`.
pub async fn ensure_vm_running(state: &SharedState) -> anyhow::Result<String> {
    let cfg = &state.cfg;
    info!(
        project = %cfg.project_id,
        zone = %cfg.zone,
        vm = %cfg.vm_name,
        "ensuring VM is running"
    );

    let mut instance = state
        .gcp
        .get_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
        .await
        .context("get instance")?;
    let mut remote = classify(&instance.status);

    let mut waited = 0;
    while remote == RemoteState::Transitional {
        if waited >= cfg.poll_max_attempts {
            anyhow::bail!("timeout waiting out transitional state {}", instance.status);
        }
        info!(status = %instance.status, "VM in transitional state, waiting");
        tokio::time::sleep(Duration::from_secs(cfg.poll_interval_secs)).await;
        instance = state
            .gcp
            .get_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
            .await
            .context("get instance")?;
        remote = classify(&instance.status);
        waited += 1;
    }

    match remote {
        RemoteState::Running => {
            let ip = instance
                .external_ip()
                .context("VM running but has no external IP")?;
            state.set_vm_ip(ip.clone());
            info!(%ip, "VM already running, probing model server");
            wait_for_ollama(state, &ip).await?;
            Ok(ip)
        }
        RemoteState::Stopped => {
            info!("starting VM");
            state
                .gcp
                .start_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
                .await
                .context("start instance")?;

            let mut ip = None;
            for _ in 0..cfg.poll_max_attempts {
                tokio::time::sleep(Duration::from_secs(cfg.poll_interval_secs)).await;
                let Ok(instance) = state
                    .gcp
                    .get_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
                    .await
                else {
                    continue;
                };
                if classify(&instance.status) == RemoteState::Running {
                    match instance.external_ip() {
                        Some(found) => {
                            ip = Some(found);
                            break;
                        }
                        None => debug!("RUNNING but no external IP yet"),
                    }
                }
            }

            let ip = ip.context("VM started but no external IP was assigned")?;
            state.set_vm_ip(ip.clone());
            info!(%ip, "VM started, probing model server");
            wait_for_ollama(state, &ip).await?;
            Ok(ip)
        }
        other => anyhow::bail!("VM in unexpected state: {other}"),
    }
}

/// Stops the VM and waits for a terminal stopped state.
pub async fn stop_vm(state: &SharedState) -> anyhow::Result<()> {
    let cfg = &state.cfg;
    let instance = state
        .gcp
        .get_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
        .await
        .context("get instance")?;

    if classify(&instance.status) == RemoteState::Stopped {
        info!(status = %instance.status, "VM already stopped");
        return Ok(());
    }

    info!(status = %instance.status, "stopping VM");
    state
        .gcp
        .stop_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
        .await
        .context("stop instance")?;

    for _ in 0..cfg.poll_max_attempts {
        tokio::time::sleep(Duration::from_secs(cfg.poll_interval_secs)).await;
        let Ok(instance) = state
            .gcp
            .get_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
            .await
        else {
            continue;
        };
        if classify(&instance.status) == RemoteState::Stopped {
            info!("VM stopped");
            return Ok(());
        }
        debug!(status = %instance.status, "waiting for VM to stop");
    }
    anyhow::bail!("timeout waiting for VM to stop")
}

/// Deletes the VM and waits until the provider reports it gone.
pub async fn delete_vm(state: &SharedState) -> anyhow::Result<()> {
    let cfg = &state.cfg;
    info!(vm = %cfg.vm_name, "deleting VM");
    state
        .gcp
        .delete_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
        .await
        .context("delete instance")?;

    for _ in 0..cfg.poll_max_attempts {
        tokio::time::sleep(Duration::from_secs(cfg.poll_interval_secs)).await;
        match state
            .gcp
            .get_instance(&cfg.project_id, &cfg.zone, &cfg.vm_name)
            .await
        {
            Err(err) if err.is_not_found() => {
                info!("VM deleted");
                return Ok(());
            }
            Err(err) => debug!(%err, "deletion status check failed, retrying"),
            Ok(_) => debug!("waiting for VM deletion"),
        }
    }
    anyhow::bail!("timeout waiting for VM deletion")
}

/// Polls the model server's tags endpoint over mTLS until it answers.
/// Any HTTP response counts; the probe only proves the TLS path and the
/// reverse proxy are up.
async fn wait_for_ollama(state: &SharedState, ip: &str) -> anyhow::Result<()> {
    let cfg = &state.cfg;
    let (tls, token) = state
        .credentials
        .get()
        .await
        .context("load credentials for health probe")?;
    let client = upstream_client(tls, ip, HEALTH_PROBE_TIMEOUT)?;
    let endpoint = format!(
        "https://{SERVER_NAME}:{}/api/tags",
        cfg.upstream_port
    );
    info!(%endpoint, "waiting for model server");

    for attempt in 1..=cfg.health_probe_attempts {
        match client
            .get(&endpoint)
            .bearer_auth(&token)
            .send()
            .await
        {
            Ok(res) => {
                info!(attempt, status = %res.status(), "model server is answering");
                return Ok(());
            }
            Err(err) => debug!(attempt, %err, "health probe failed"),
        }
        tokio::time::sleep(Duration::from_secs(cfg.health_probe_delay_secs)).await;
    }
    anyhow::bail!("timeout waiting for model server")
}

/// Single probe used by the status surface to tell BOOTING from RUNNING.
pub async fn probe_ollama(state: &SharedState, ip: &str) -> bool {
    let Ok((tls, token)) = state.credentials.get().await else {
        return false;
    };
    let Ok(client) = upstream_client(tls, ip, HEALTH_PROBE_TIMEOUT) else {
        return false;
    };
    let endpoint = format!(
        "https://{SERVER_NAME}:{}/api/tags",
        state.cfg.upstream_port
    );
    client.get(&endpoint).bearer_auth(&token).send().await.is_ok()
}
