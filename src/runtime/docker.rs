use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerSummary;
use bollard::Docker;
use log::debug;

use super::ContainerRuntime;
use crate::types::Workload;

/// Label selecting containers for load balancing.
pub const ENABLE_LABEL: &str = "lb.enable=Y";

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using default settings.
    /// This handles unix socket on Linux.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_enabled(&self) -> Result<Vec<Workload>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![ENABLE_LABEL.to_string()]);

        let opts = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        debug!("Inventory query returned {} containers", containers.len());

        Ok(containers.into_iter().filter_map(into_workload).collect())
    }
}

fn into_workload(summary: ContainerSummary) -> Option<Workload> {
    let name = summary
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .or_else(|| summary.id.clone())?;

    let labels = summary.labels.unwrap_or_default();

    let mut addresses = BTreeMap::new();
    if let Some(networks) = summary.network_settings.and_then(|s| s.networks) {
        for (network, endpoint) in networks {
            if let Some(ip) = pick_address(&endpoint) {
                addresses.insert(network, ip);
            }
        }
    }

    Some(Workload {
        name,
        labels,
        addresses,
    })
}

/// Prefers the IPv4 address, falling back to the global IPv6 one.
fn pick_address(endpoint: &bollard::models::EndpointSettings) -> Option<String> {
    if let Some(ipv4) = &endpoint.ip_address {
        if !ipv4.is_empty() {
            return Some(ipv4.clone());
        }
    }
    if let Some(ipv6) = &endpoint.global_ipv6_address {
        if !ipv6.is_empty() {
            return Some(ipv6.clone());
        }
    }
    None
}
