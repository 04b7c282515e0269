use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::gcp::compute::{Firewall, FirewallAllowed};
use crate::state::SharedState;
use crate::telemetry;
use crate::TARGET_TAG;

pub const FIREWALL_RULE_NAME: &str = "private-llm-agent";
const RULE_PRIORITY: i32 = 900;
const IP_ECHO_TIMEOUT: Duration = Duration::from_secs(10);

/// The caller's current public IP, from the configured echo service.
pub async fn detect_public_ip(state: &SharedState) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(IP_ECHO_TIMEOUT)
        .build()
        .context("build IP echo client")?;

    let body = client
        .get(&state.cfg.ip_echo_endpoint)
        .send()
        .await
        .context("detect public IP")?
        .error_for_status()
        .context("IP echo service error")?
        .text()
        .await
        .context("read IP echo response")?;

    let ip = body.trim().to_string();
    if ip.is_empty() {
        anyhow::bail!("empty IP echo response");
    }
    Ok(ip)
}

/// Creates or patches the rule so the caller's current /32 (or everyone,
/// with `firewall_allow_all`) can reach tcp/8080 on tagged hosts. A rule
/// that already carries the right source is left untouched.
pub async fn ensure_firewall_open(state: &SharedState) -> anyhow::Result<()> {
    let source_range = if state.cfg.firewall_allow_all {
        info!("firewall allowing all source addresses");
        "0.0.0.0/0".to_string()
    } else {
        let public_ip = detect_public_ip(state).await?;
        info!(%public_ip, "detected caller public IP");
        state.set_public_ip(public_ip.clone());
        format!("{public_ip}/32")
    };

    let project = &state.cfg.project_id;
    match state.gcp.get_firewall(project, FIREWALL_RULE_NAME).await {
        Ok(existing) => {
            if existing.source_ranges == vec![source_range.clone()] {
                info!(source = %source_range, "firewall rule already matches");
                state.set_firewall_active(true);
                return Ok(());
            }

            info!(source = %source_range, "updating firewall rule source");
            let patch = Firewall {
                source_ranges: vec![source_range],
                ..Firewall::default()
            };
            state
                .gcp
                .patch_firewall(project, FIREWALL_RULE_NAME, &patch)
                .await
                .context("patch firewall rule")?;
            telemetry::record_firewall_mutation("patch");
            state.set_firewall_active(true);
            Ok(())
        }
        Err(err) if err.is_not_found() => create_firewall_rule(state, source_range).await,
        Err(err) => Err(err).context("get firewall rule"),
    }
}

async fn create_firewall_rule(state: &SharedState, source_range: String) -> anyhow::Result<()> {
    info!(rule = FIREWALL_RULE_NAME, source = %source_range, "creating firewall rule");

    let rule = Firewall {
        name: Some(FIREWALL_RULE_NAME.to_string()),
        network: Some(format!(
            "projects/{}/global/networks/{}",
            state.cfg.project_id, state.cfg.network
        )),
        direction: Some("INGRESS".to_string()),
        priority: Some(RULE_PRIORITY),
        source_ranges: vec![source_range],
        allowed: vec![FirewallAllowed {
            ip_protocol: "tcp".to_string(),
            ports: vec![state.cfg.upstream_port.to_string()],
        }],
        target_tags: vec![TARGET_TAG.to_string()],
    };

    state
        .gcp
        .insert_firewall(&state.cfg.project_id, &rule)
        .await
        .context("create firewall rule")?;
    telemetry::record_firewall_mutation("create");
    state.set_firewall_active(true);
    Ok(())
}

/// Deletes the rule. Absence is success; other failures are logged, not
/// surfaced, since this runs on cleanup paths.
pub async fn remove_firewall(state: &SharedState) {
    info!(rule = FIREWALL_RULE_NAME, "removing firewall rule");
    let project = &state.cfg.project_id;

    match state.gcp.get_firewall(project, FIREWALL_RULE_NAME).await {
        Err(err) if err.is_not_found() => {
            info!("firewall rule already absent");
            state.set_firewall_active(false);
            return;
        }
        Err(err) => {
            warn!(%err, "failed to check firewall rule before removal");
            return;
        }
        Ok(_) => {}
    }

    match state.gcp.delete_firewall(project, FIREWALL_RULE_NAME).await {
        Ok(_) => {
            telemetry::record_firewall_mutation("delete");
            info!("firewall rule deleted");
        }
        Err(err) if err.is_not_found() => info!("firewall rule already absent"),
        Err(err) => warn!(%err, "failed to delete firewall rule"),
    }
    state.set_firewall_active(false);
}
