use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::api::AgentEvent;
use crate::config::AgentConfig;
use crate::state::SharedState;
use crate::{firewall, rotation, telemetry, vm};

const ACTION_CHANNEL_CAPACITY: usize = 16;

/// Remote-state mutations the dashboard can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpsAction {
    RestartVm,
    ResetVm,
    StopVm,
    StartVm,
}

impl OpsAction {
    fn label(&self) -> &'static str {
        match self {
            OpsAction::RestartVm => "restart",
            OpsAction::ResetVm => "reset",
            OpsAction::StopVm => "stop",
            OpsAction::StartVm => "start",
        }
    }
}

/// Seam to the one-shot infrastructure provisioner, which recreates the VM
/// and its network from scratch after a delete.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn recreate(&self, cfg: &AgentConfig) -> anyhow::Result<()>;
}

/// The daemon itself ships without a provisioner; resetting the VM is then
/// an explicit error pointing at the infra CLI.
pub struct UnconfiguredProvisioner;

#[async_trait]
impl Provisioner for UnconfiguredProvisioner {
    async fn recreate(&self, _cfg: &AgentConfig) -> anyhow::Result<()> {
        anyhow::bail!("re-provisioning requires the infrastructure CLI; run 'private-llm up'")
    }
}

/// Serializes every transition of remote compute state through a single
/// worker. The proxy never mutates remote state directly; it reads caches
/// and signals this loop through the handle.
pub struct Ops {
    state: SharedState,
    provisioner: Arc<dyn Provisioner>,
    /// Held for the full duration of every event, including the shutdown
    /// cleanup that runs outside the worker.
    mutex: Mutex<()>,
    recovery_tx: mpsc::Sender<()>,
    actions_tx: mpsc::Sender<OpsAction>,
}

pub struct OpsChannels {
    recovery_rx: mpsc::Receiver<()>,
    actions_rx: mpsc::Receiver<OpsAction>,
}

impl Ops {
    pub fn new(state: SharedState, provisioner: Arc<dyn Provisioner>) -> (Arc<Self>, OpsChannels) {
        // Capacity 1: concurrent recovery signals coalesce into one pass.
        let (recovery_tx, recovery_rx) = mpsc::channel(1);
        let (actions_tx, actions_rx) = mpsc::channel(ACTION_CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                state,
                provisioner,
                mutex: Mutex::new(()),
                recovery_tx,
                actions_tx,
            }),
            OpsChannels {
                recovery_rx,
                actions_rx,
            },
        )
    }

    /// Signals the loop to run setup if the gate is closed. No-op when the
    /// remote is already verified ready. Called on every inbound request so
    /// the VM boots lazily on first use.
    pub fn ensure_setup(&self) {
        if self.state.gate.is_open() {
            return;
        }
        let _ = self.recovery_tx.try_send(());
    }

    /// Closes the gate immediately and signals recovery. Safe to call from
    /// any number of tasks; the buffered channel deduplicates.
    pub fn request_recovery(&self) {
        self.state.gate.close();
        let _ = self.recovery_tx.try_send(());
    }

    /// Queues a dashboard action for the worker.
    pub async fn dispatch(&self, action: OpsAction) -> anyhow::Result<()> {
        self.actions_tx
            .send(action)
            .await
            .map_err(|_| anyhow::anyhow!("ops loop is gone"))
    }

    /// Shutdown-path firewall cleanup, serialized with any in-flight action.
    pub async fn remove_firewall(&self) {
        let _guard = self.mutex.lock().await;
        firewall::remove_firewall(&self.state).await;
    }

    /// The ops event loop. Must run on exactly one task.
    pub async fn run(
        self: Arc<Self>,
        mut channels: OpsChannels,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = channels.recovery_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    let _guard = self.mutex.lock().await;
                    self.do_setup().await;
                }
                action = channels.actions_rx.recv() => {
                    let Some(action) = action else { break };
                    let _guard = self.mutex.lock().await;
                    self.handle_action(action).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_action(&self, action: OpsAction) {
        info!(action = action.label(), "ops action starting");
        let result = match action {
            OpsAction::StopVm => self.do_stop_vm().await,
            OpsAction::StartVm => self.do_start_vm().await,
            OpsAction::RestartVm => self.do_restart_vm().await,
            OpsAction::ResetVm => self.do_reset_vm().await,
        };

        match result {
            Ok(()) => {
                telemetry::record_ops_action(action.label(), "success");
                // Stop leaves the gate closed on purpose; everything else
                // re-runs setup to bring the proxy back to ready.
                if action != OpsAction::StopVm {
                    self.do_setup().await;
                }
            }
            Err(err) => {
                telemetry::record_ops_action(action.label(), "failure");
                error!(action = action.label(), %err, "ops action failed");
                self.state.publish(AgentEvent::ActionError {
                    action: action.label().to_string(),
                    message: format!("{err:#}"),
                });
            }
        }
    }

    /// Verifies the VM is serving; when it is not, drives the full cold
    /// start: firewall, one rotation per cycle, VM start, health probe, and
    /// finally the gate. Any failure leaves the gate closed for the next
    /// recovery signal to retry from scratch.
    async fn do_setup(&self) {
        let state = &self.state;

        if state.cached_vm_ip().is_some() {
            match vm::is_vm_stopped(state).await {
                Err(err) => {
                    warn!(%err, "VM status check failed, trusting cached address");
                    state.gate.open();
                    return;
                }
                Ok(false) => {
                    state.gate.open();
                    return;
                }
                Ok(true) => {
                    info!("VM stopped since last contact, rerunning setup");
                    state.reset_proxy_state().await;
                }
            }
        }

        if let Err(err) = firewall::ensure_firewall_open(state).await {
            self.setup_failed("firewall", err);
            return;
        }

        let needs_start = match vm::is_vm_stopped(state).await {
            Ok(stopped) => stopped,
            Err(err) => {
                self.setup_failed("status check", err);
                return;
            }
        };

        // Rotate only when the VM is about to boot; it reads the secret
        // store exactly once, at startup.
        if needs_start && !state.rotated_this_cycle() {
            info!("rotating certificates before VM start");
            if let Err(err) = rotation::rotate_certs(state).await {
                telemetry::record_rotation("failure");
                self.setup_failed("rotation", err);
                return;
            }
            state.set_rotated_this_cycle();
        }

        let ip = match vm::ensure_vm_running(state).await {
            Ok(ip) => ip,
            Err(err) => {
                self.setup_failed("VM start", err);
                return;
            }
        };

        state.set_vm_ip(ip);
        state.set_proxy_ready(true);
        state.gate.open();
        telemetry::record_ops_action("setup", "success");
        info!("setup complete, gate open");
    }

    fn setup_failed(&self, step: &str, err: anyhow::Error) {
        telemetry::record_ops_action("setup", "failure");
        error!(step, %err, "setup failed, gate stays closed");
        self.state.publish(AgentEvent::ActionError {
            action: "setup".to_string(),
            message: format!("{step}: {err:#}"),
        });
    }

    async fn do_stop_vm(&self) -> anyhow::Result<()> {
        self.state.gate.close();
        vm::stop_vm(&self.state).await?;
        self.state.reset_proxy_state().await;
        firewall::remove_firewall(&self.state).await;
        Ok(())
    }

    async fn do_start_vm(&self) -> anyhow::Result<()> {
        firewall::ensure_firewall_open(&self.state)
            .await
            .map_err(|err| err.context("firewall"))?;
        vm::ensure_vm_running(&self.state)
            .await
            .map_err(|err| err.context("start"))?;
        self.state.reset_proxy_state().await;
        Ok(())
    }

    async fn do_restart_vm(&self) -> anyhow::Result<()> {
        self.state.gate.close();
        vm::stop_vm(&self.state)
            .await
            .map_err(|err| err.context("stop"))?;
        rotation::rotate_certs(&self.state)
            .await
            .map_err(|err| err.context("rotate certs"))?;
        firewall::ensure_firewall_open(&self.state)
            .await
            .map_err(|err| err.context("firewall"))?;
        vm::ensure_vm_running(&self.state)
            .await
            .map_err(|err| err.context("start"))?;
        self.state.reset_proxy_state().await;
        Ok(())
    }

    async fn do_reset_vm(&self) -> anyhow::Result<()> {
        self.state.gate.close();
        vm::delete_vm(&self.state)
            .await
            .map_err(|err| err.context("delete"))?;
        rotation::rotate_certs(&self.state)
            .await
            .map_err(|err| err.context("rotate certs"))?;
        self.provisioner
            .recreate(&self.state.cfg)
            .await
            .map_err(|err| err.context("recreate"))?;
        self.state.reset_proxy_state().await;
        Ok(())
    }
}
