use std::path::Path;
use std::sync::Arc;

use httpmock::MockServer;

use crate::config::AgentConfig;
use crate::credentials::CredentialCache;
use crate::gcp::Gcp;
use crate::state::{new_state, SharedState};

/// Config with every endpoint pointed at the mock server and every poll
/// interval collapsed so tests run fast.
pub fn test_config(server: &MockServer, dir: &Path) -> AgentConfig {
    AgentConfig {
        project_id: "test-project".into(),
        zone: "test-zone".into(),
        region: "test-region".into(),
        vm_name: "test-vm".into(),
        network: "test-net".into(),
        subnet: "test-subnet".into(),
        subnet_cidr: "10.10.0.0/24".into(),
        machine_type: "g2-standard-4".into(),
        default_model: "test-model".into(),
        context_length: 4_096,
        idle_timeout: 300,
        disable_hsm: false,
        listen_addr: "127.0.0.1".into(),
        listen_port: 0,
        firewall_allow_all: false,
        upstream_port: 8_080,
        poll_interval_secs: 0,
        poll_max_attempts: 3,
        health_probe_attempts: 1,
        health_probe_delay_secs: 0,
        upstream_retry_attempts: 3,
        upstream_retry_delay_secs: 0,
        upstream_timeout_secs: 5,
        status_interval_secs: 1,
        metrics_host: "127.0.0.1".into(),
        metrics_port: 0,
        compute_endpoint: server.url(""),
        secretmanager_endpoint: server.url(""),
        ip_echo_endpoint: server.url("/ip"),
        oauth_token_endpoint: server.url("/token"),
        certs_dir: Some(dir.to_string_lossy().into_owned()),
        status_file: Some(dir.join("status").to_string_lossy().into_owned()),
    }
}

pub fn state_for_tests(cfg: AgentConfig) -> SharedState {
    let gcp = Arc::new(Gcp::with_static_token(
        &cfg.compute_endpoint,
        &cfg.secretmanager_endpoint,
        "test-token",
    ));
    let certs_dir = cfg.certs_dir().expect("certs dir");
    let credentials = CredentialCache::new(certs_dir);
    new_state(cfg, gcp, credentials)
}
