use anyhow::Result;
use async_trait::async_trait;

use crate::types::Workload;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime {
    /// Take one snapshot of the containers enabled for load balancing.
    /// Query failures are fatal to the controller; there is no safe
    /// partial state to reconcile against.
    async fn list_enabled(&self) -> Result<Vec<Workload>>;
}
