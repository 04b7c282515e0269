use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

pub const ENV_PREFIX: &str = "PRIVATE_LLM";

/// Agent configuration, loaded from `agent.json` in the user config
/// directory and overridable through `PRIVATE_LLM_*` environment variables.
///
/// `project_id` and `zone` are required; every other field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub project_id: String,
    pub zone: String,
    pub region: String,
    pub vm_name: String,
    pub network: String,
    pub subnet: String,
    pub subnet_cidr: String,
    pub machine_type: String,
    pub default_model: String,
    pub context_length: u64,
    /// Idle shutdown window enforced by the VM itself; the agent only
    /// surfaces it next to the observed idle time.
    pub idle_timeout: u64,
    pub disable_hsm: bool,
    pub listen_addr: String,
    pub listen_port: u16,
    /// Open the firewall to 0.0.0.0/0 instead of the caller's /32.
    pub firewall_allow_all: bool,
    /// Port the remote reverse proxy serves mTLS traffic on.
    pub upstream_port: u16,

    pub poll_interval_secs: u64,
    pub poll_max_attempts: u32,
    pub health_probe_attempts: u32,
    pub health_probe_delay_secs: u64,
    pub upstream_retry_attempts: u32,
    pub upstream_retry_delay_secs: u64,
    pub upstream_timeout_secs: u64,
    pub status_interval_secs: u64,

    pub metrics_host: String,
    pub metrics_port: u16,

    /// API endpoints, overridable so tests can point at a local mock.
    pub compute_endpoint: String,
    pub secretmanager_endpoint: String,
    pub ip_echo_endpoint: String,
    pub oauth_token_endpoint: String,

    #[serde(default)]
    pub certs_dir: Option<String>,
    #[serde(default)]
    pub status_file: Option<String>,
}

impl AgentConfig {
    pub fn certs_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.certs_dir {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => Ok(config_dir()?.join("certs")),
        }
    }

    pub fn status_file(&self) -> anyhow::Result<PathBuf> {
        match &self.status_file {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(config_dir()?.join("status")),
        }
    }
}

/// `~/.config/private-llm` (platform equivalent), shared with the infra CLI.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let base = directories::BaseDirs::new().context("cannot resolve home directory")?;
    Ok(base.config_dir().join("private-llm"))
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("agent.json"))
}

pub fn load() -> anyhow::Result<AgentConfig> {
    let path = match env::var(format!("{ENV_PREFIX}_CONFIG")) {
        Ok(p) => PathBuf::from(p),
        Err(_) => default_config_path()?,
    };
    load_from(&path)
}

// (ENV_NAME, config_key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("PRIVATE_LLM_PROJECT_ID", "project_id"),
    ("PRIVATE_LLM_ZONE", "zone"),
    ("PRIVATE_LLM_REGION", "region"),
    ("PRIVATE_LLM_VM_NAME", "vm_name"),
    ("PRIVATE_LLM_NETWORK", "network"),
    ("PRIVATE_LLM_SUBNET", "subnet"),
    ("PRIVATE_LLM_SUBNET_CIDR", "subnet_cidr"),
    ("PRIVATE_LLM_MACHINE_TYPE", "machine_type"),
    ("PRIVATE_LLM_DEFAULT_MODEL", "default_model"),
    ("PRIVATE_LLM_CONTEXT_LENGTH", "context_length"),
    ("PRIVATE_LLM_IDLE_TIMEOUT", "idle_timeout"),
    ("PRIVATE_LLM_DISABLE_HSM", "disable_hsm"),
    ("PRIVATE_LLM_LISTEN_ADDR", "listen_addr"),
    ("PRIVATE_LLM_LISTEN_PORT", "listen_port"),
    ("PRIVATE_LLM_FIREWALL_ALLOW_ALL", "firewall_allow_all"),
    ("PRIVATE_LLM_METRICS_HOST", "metrics_host"),
    ("PRIVATE_LLM_METRICS_PORT", "metrics_port"),
    ("PRIVATE_LLM_CERTS_DIR", "certs_dir"),
    ("PRIVATE_LLM_STATUS_FILE", "status_file"),
];

pub fn load_from(path: &Path) -> anyhow::Result<AgentConfig> {
    if !path.exists() {
        anyhow::bail!(
            "config not found: {}\nrun 'private-llm up' to provision infrastructure first",
            path.display()
        );
    }

    let mut builder = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Json))
        .set_default("project_id", "")?
        .set_default("zone", "us-central1-a")?
        .set_default("region", "")?
        .set_default("vm_name", "private-llm-vm")?
        .set_default("network", "private-llm")?
        .set_default("subnet", "private-llm-subnet")?
        .set_default("subnet_cidr", "10.10.0.0/24")?
        .set_default("machine_type", "g4-standard-48")?
        .set_default("default_model", "qwen3-coder-next:q8_0")?
        .set_default("context_length", 262_144)?
        .set_default("idle_timeout", 300)?
        .set_default("disable_hsm", false)?
        .set_default("listen_addr", "127.0.0.1")?
        .set_default("listen_port", 11_434)?
        .set_default("firewall_allow_all", false)?
        .set_default("upstream_port", 8_080)?
        .set_default("poll_interval_secs", 5)?
        .set_default("poll_max_attempts", 60)?
        .set_default("health_probe_attempts", 60)?
        .set_default("health_probe_delay_secs", 5)?
        .set_default("upstream_retry_attempts", 12)?
        .set_default("upstream_retry_delay_secs", 5)?
        .set_default("upstream_timeout_secs", 600)?
        .set_default("status_interval_secs", 5)?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9_464)?
        .set_default(
            "compute_endpoint",
            "https://compute.googleapis.com/compute/v1",
        )?
        .set_default(
            "secretmanager_endpoint",
            "https://secretmanager.googleapis.com/v1",
        )?
        .set_default("ip_echo_endpoint", "https://api.ipify.org")?
        .set_default("oauth_token_endpoint", "https://oauth2.googleapis.com/token")?;

    for (env_key, cfg_key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            builder = builder.set_override(*cfg_key, value)?;
        }
    }

    let mut cfg: AgentConfig = builder
        .build()
        .context("assemble configuration")?
        .try_deserialize()
        .context("parse configuration")?;

    if cfg.region.is_empty() {
        cfg.region = region_from_zone(&cfg.zone);
    }

    if cfg.project_id.trim().is_empty() || cfg.zone.trim().is_empty() {
        anyhow::bail!("config must include project_id and zone");
    }

    Ok(cfg)
}

/// `us-central1-a` → `us-central1`. Zones without a recognisable suffix fall
/// back to the default region.
fn region_from_zone(zone: &str) -> String {
    let parts: Vec<&str> = zone.split('-').collect();
    if parts.len() >= 3 {
        parts[..parts.len() - 1].join("-")
    } else {
        "us-central1".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("temp config");
        file.write_all(json.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn load_applies_defaults() {
        let file = write_config(r#"{"project_id": "proj-1"}"#);
        let cfg = load_from(file.path()).expect("config loads");

        assert_eq!(cfg.project_id, "proj-1");
        assert_eq!(cfg.zone, "us-central1-a");
        assert_eq!(cfg.region, "us-central1");
        assert_eq!(cfg.vm_name, "private-llm-vm");
        assert_eq!(cfg.network, "private-llm");
        assert_eq!(cfg.listen_port, 11_434);
        assert_eq!(cfg.idle_timeout, 300);
        assert_eq!(cfg.upstream_retry_attempts, 12);
        assert!(!cfg.firewall_allow_all);
    }

    #[test]
    fn region_derived_from_zone() {
        let file = write_config(r#"{"project_id": "p", "zone": "europe-west4-b"}"#);
        let cfg = load_from(file.path()).expect("config loads");
        assert_eq!(cfg.region, "europe-west4");
    }

    #[test]
    fn explicit_region_wins() {
        let file =
            write_config(r#"{"project_id": "p", "zone": "us-east1-b", "region": "us-east4"}"#);
        let cfg = load_from(file.path()).expect("config loads");
        assert_eq!(cfg.region, "us-east4");
    }

    #[test]
    fn missing_project_id_is_rejected() {
        let file = write_config(r#"{"zone": "us-central1-a"}"#);
        let err = load_from(file.path()).expect_err("project_id required");
        assert!(err.to_string().contains("project_id"), "got: {err}");
    }

    #[test]
    fn missing_file_names_the_setup_command() {
        let err = load_from(Path::new("/no/such/agent.json")).expect_err("missing file");
        assert!(err.to_string().contains("private-llm up"), "got: {err}");
    }
}
