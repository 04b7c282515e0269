use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Router};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn record_proxy_request(status: u16, duration: Duration) {
    counter!(
        "private_llm_proxy_requests_total",
        "status" => status.to_string()
    )
    .increment(1);

    histogram!("private_llm_proxy_request_duration_ms").record(duration.as_secs_f64() * 1000.0);
}

pub fn record_upstream_retry(reason: &str) {
    counter!(
        "private_llm_upstream_retries_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_ops_action(action: &str, result: &str) {
    counter!(
        "private_llm_ops_actions_total",
        "action" => action.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_rotation(result: &str) {
    counter!(
        "private_llm_rotations_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_firewall_mutation(kind: &str) {
    counter!(
        "private_llm_firewall_mutations_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_gate_state(open: bool) {
    gauge!("private_llm_gate_open").set(if open { 1.0 } else { 0.0 });
}

pub fn record_remote_state(state: &str) {
    gauge!(
        "private_llm_remote_state",
        "state" => state.to_string()
    )
    .set(1.0);
}

pub fn record_token_totals(input: i64, output: i64) {
    gauge!("private_llm_input_tokens_total").set(input as f64);
    gauge!("private_llm_output_tokens_total").set(output as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_into_prometheus_payload() {
        let handle = init_metrics_recorder();

        record_proxy_request(200, Duration::from_millis(12));
        record_upstream_retry("bad_gateway");
        record_ops_action("setup", "success");
        record_rotation("success");
        record_firewall_mutation("create");
        record_gate_state(true);
        record_remote_state("RUNNING");
        record_token_totals(7, 3);

        let rendered = handle.render();
        assert!(
            rendered.contains("private_llm_proxy_requests_total"),
            "proxy counter missing: {rendered}"
        );
        assert!(
            rendered.contains("private_llm_upstream_retries_total"),
            "retry counter missing: {rendered}"
        );
        assert!(
            rendered.contains("private_llm_gate_open"),
            "gate gauge missing: {rendered}"
        );
        assert!(
            rendered.contains("private_llm_rotations_total"),
            "rotation counter missing: {rendered}"
        );
    }
}
