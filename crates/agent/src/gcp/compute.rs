use serde::{Deserialize, Serialize};

use crate::gcp::{Gcp, GcpError};

/// Subset of the Compute `Instance` resource the agent reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    #[serde(default, rename = "natIP")]
    pub nat_ip: Option<String>,
}

impl Instance {
    /// External (NAT) IP of the first interface, when one is assigned.
    pub fn external_ip(&self) -> Option<String> {
        self.network_interfaces
            .first()?
            .access_configs
            .first()?
            .nat_ip
            .clone()
            .filter(|ip| !ip.is_empty())
    }
}

/// Zonal/global operations are polled by status elsewhere; the agent only
/// needs acknowledgement that the mutation was accepted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Firewall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default)]
    pub source_ranges: Vec<String>,
    #[serde(default)]
    pub allowed: Vec<FirewallAllowed>,
    #[serde(default)]
    pub target_tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallAllowed {
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    #[serde(default)]
    pub ports: Vec<String>,
}

impl Gcp {
    pub async fn get_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Instance, GcpError> {
        let url = self.compute_url(&format!("/projects/{project}/zones/{zone}/instances/{name}"));
        self.get_json(&url).await
    }

    pub async fn start_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, GcpError> {
        let url = self.compute_url(&format!(
            "/projects/{project}/zones/{zone}/instances/{name}/start"
        ));
        self.post_json::<(), _>(&url, None).await
    }

    pub async fn stop_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, GcpError> {
        let url = self.compute_url(&format!(
            "/projects/{project}/zones/{zone}/instances/{name}/stop"
        ));
        self.post_json::<(), _>(&url, None).await
    }

    pub async fn delete_instance(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<Operation, GcpError> {
        let url = self.compute_url(&format!("/projects/{project}/zones/{zone}/instances/{name}"));
        self.delete_json(&url).await
    }

    pub async fn get_firewall(&self, project: &str, name: &str) -> Result<Firewall, GcpError> {
        let url = self.compute_url(&format!("/projects/{project}/global/firewalls/{name}"));
        self.get_json(&url).await
    }

    pub async fn insert_firewall(
        &self,
        project: &str,
        firewall: &Firewall,
    ) -> Result<Operation, GcpError> {
        let url = self.compute_url(&format!("/projects/{project}/global/firewalls"));
        self.post_json(&url, Some(firewall)).await
    }

    pub async fn patch_firewall(
        &self,
        project: &str,
        name: &str,
        firewall: &Firewall,
    ) -> Result<Operation, GcpError> {
        let url = self.compute_url(&format!("/projects/{project}/global/firewalls/{name}"));
        self.patch_json(&url, firewall).await
    }

    pub async fn delete_firewall(&self, project: &str, name: &str) -> Result<Operation, GcpError> {
        let url = self.compute_url(&format!("/projects/{project}/global/firewalls/{name}"));
        self.delete_json(&url).await
    }
}
