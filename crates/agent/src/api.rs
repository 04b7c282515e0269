use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events published on the agent's broadcast channel. The terminal dashboard
/// (a separate process surface) subscribes to these; the agent itself also
/// mirrors them into logs and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Status(StatusSnapshot),
    Request(RequestEvent),
    StreamingRate { output_tok_per_sec: f64 },
    ActionError { action: String, message: String },
}

/// Periodic aggregate of remote, firewall, credential, and usage state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Provider lifecycle label, locally refined to BOOTING between RUNNING
    /// and the first successful health probe.
    pub remote_state: String,
    pub external_ip: Option<String>,
    pub firewall_active: bool,
    pub source_ip: Option<String>,
    /// NotBefore of the client certificate; the bearer token is minted in
    /// the same rotation, so it doubles as the token creation time.
    pub cert_created: Option<DateTime<Utc>>,
    pub token_created: Option<DateTime<Utc>>,
    pub idle_secs: Option<u64>,
    pub idle_timeout_secs: u64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// One completed proxy request, published after the stream has drained so
/// token counts are final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub model: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
    pub encrypted: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub input_tok_per_sec: f64,
    pub output_tok_per_sec: f64,
}
