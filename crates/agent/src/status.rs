use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::{AgentEvent, StatusSnapshot};
use crate::credentials::client_cert_not_before;
use crate::state::SharedState;
use crate::vm::{self, RemoteState};
use crate::telemetry;

/// Publishes a status snapshot every few seconds and mirrors the remote
/// state into the local status file for external consumers.
pub async fn status_loop(
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(state.cfg.status_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                publish_status(&state).await;
            }
        }
    }
    Ok(())
}

/// One snapshot pass: observe the remote, refine RUNNING into BOOTING until
/// the first successful probe, and fan the result out to the event channel,
/// the metrics registry, and the status file.
pub async fn publish_status(state: &SharedState) -> StatusSnapshot {
    let (remote, provider_label) = match vm::get_status(state).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(%err, "status poll failed");
            (RemoteState::Unknown, RemoteState::Unknown.label().to_string())
        }
    };

    let mut display = provider_label;
    if remote == RemoteState::Running {
        if !state.proxy_ready() {
            // The VM may have been started by another controller while this
            // process was away; one probe tells BOOTING apart from serving.
            let probed = match state.cached_vm_ip() {
                Some(ip) => vm::probe_ollama(state, &ip).await,
                None => false,
            };
            if probed {
                state.set_proxy_ready(true);
            } else {
                display = RemoteState::Booting.label().to_string();
            }
        }
    } else {
        state.set_proxy_ready(false);
    }

    let cert_created = state
        .cfg
        .certs_dir()
        .ok()
        .and_then(|dir| client_cert_not_before(&dir));

    let idle_secs = state
        .last_request_at()
        .map(|at| (Utc::now() - at).num_seconds().max(0) as u64);

    let (input_tokens, output_tokens) = state.counters.totals();
    telemetry::record_remote_state(&display);
    telemetry::record_token_totals(input_tokens, output_tokens);

    let snapshot = StatusSnapshot {
        remote_state: display.clone(),
        external_ip: state.cached_vm_ip(),
        firewall_active: state.firewall_active(),
        source_ip: state.cached_public_ip(),
        cert_created,
        // The bearer token is minted in the same rotation as the cert.
        token_created: cert_created,
        idle_secs,
        idle_timeout_secs: state.cfg.idle_timeout,
        input_tokens,
        output_tokens,
    };

    if let Err(err) = write_status_file(state, &display) {
        debug!(%err, "failed to write status file");
    }

    state.publish(AgentEvent::Status(snapshot.clone()));
    snapshot
}

fn write_status_file(state: &SharedState, label: &str) -> anyhow::Result<()> {
    let path = state.cfg.status_file()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(&path, format!("{label}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation;
    use crate::test_support::{state_for_tests, test_config};
    use httpmock::{Method::GET, MockServer};

    const INSTANCE_PATH: &str = "/projects/test-project/zones/test-zone/instances/test-vm";

    #[tokio::test]
    async fn stopped_remote_is_reported_and_written_to_the_status_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path(INSTANCE_PATH);
            then.status(200)
                .json_body(serde_json::json!({"status": "TERMINATED"}));
        });

        let state = state_for_tests(test_config(&server, dir.path()));
        state.set_proxy_ready(true);

        let snapshot = publish_status(&state).await;
        assert_eq!(snapshot.remote_state, "TERMINATED");
        assert!(!state.proxy_ready(), "non-running remote clears readiness");

        let written =
            std::fs::read_to_string(state.cfg.status_file().expect("path")).expect("status file");
        assert_eq!(written, "TERMINATED\n");
    }

    #[tokio::test]
    async fn running_but_unprobed_remote_shows_booting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path(INSTANCE_PATH);
            then.status(200).json_body(serde_json::json!({
                "status": "RUNNING",
                "networkInterfaces": [{"accessConfigs": [{"natIP": "127.0.0.1"}]}]
            }));
        });

        let state = state_for_tests(test_config(&server, dir.path()));
        // No credentials on disk, so the probe cannot succeed.
        let snapshot = publish_status(&state).await;
        assert_eq!(snapshot.remote_state, "BOOTING");
        assert_eq!(snapshot.external_ip.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn ready_remote_keeps_the_provider_label() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path(INSTANCE_PATH);
            then.status(200)
                .json_body(serde_json::json!({"status": "RUNNING"}));
        });

        let state = state_for_tests(test_config(&server, dir.path()));
        state.set_proxy_ready(true);

        let snapshot = publish_status(&state).await;
        assert_eq!(snapshot.remote_state, "RUNNING");
        assert!(state.proxy_ready());
    }

    #[tokio::test]
    async fn snapshot_carries_idle_time_and_cert_age() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path(INSTANCE_PATH);
            then.status(200)
                .json_body(serde_json::json!({"status": "TERMINATED"}));
        });

        let state = state_for_tests(test_config(&server, dir.path()));
        state.touch_last_request();
        rotation::rotate_materials(dir.path(), &state).expect("materials");

        let snapshot = publish_status(&state).await;
        assert!(snapshot.idle_secs.is_some());
        assert!(snapshot.cert_created.is_some());
        assert_eq!(snapshot.cert_created, snapshot.token_created);
        assert_eq!(snapshot.idle_timeout_secs, state.cfg.idle_timeout);
    }
}
