//! Server description and teardown helpers for the Scaleway driver.

use std::net::IpAddr;
use std::str::FromStr;

use reqwest::Method;

use crate::driver::{MachineHandle, MachineNetworking};
use crate::scaleway::types::Action;

use super::super::{ScalewayDriver, ScalewayDriverError};
use super::{InstanceSnapshot, volume_ids};

/// How a server is torn down.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(in crate::scaleway) enum InstanceRemoval {
    /// The `terminate` action releases the server with its volumes and IP.
    Terminate,
    /// Delete the server record, then each volume it held.
    Delete { volume_ids: Vec<String> },
}

impl ScalewayDriver {
    pub(in crate::scaleway) async fn fetch_instance(
        &self,
        handle: &MachineHandle,
    ) -> Result<Option<InstanceSnapshot>, ScalewayDriverError> {
        let mut servers = self
            .api
            .list_instances(&handle.zone)
            .servers(&handle.id)
            .per_page(1)
            .run_async()
            .await?;

        Ok(servers.pop().map(|server| InstanceSnapshot {
            id: server.id.into(),
            state: server.state.into(),
            allowed_actions: server
                .allowed_actions
                .into_iter()
                .map(Action::from)
                .collect(),
            public_ip: server.public_ip.map(|ip| ip.address),
            volume_ids: volume_ids(server.volumes),
        }))
    }

    pub(in crate::scaleway) async fn networking(
        &self,
        handle: &MachineHandle,
    ) -> Result<MachineNetworking, ScalewayDriverError> {
        let server = self
            .fetch_instance(handle)
            .await?
            .ok_or_else(|| ScalewayDriverError::NotFound {
                resource: format!("instance {}", handle.id),
            })?;
        Self::networking_from(&server, self.ssh_port)
    }

    pub(in crate::scaleway) fn networking_from(
        server: &InstanceSnapshot,
        ssh_port: u16,
    ) -> Result<MachineNetworking, ScalewayDriverError> {
        server
            .public_ip
            .as_deref()
            .and_then(|ip| IpAddr::from_str(ip).ok())
            .map(|public_ip| MachineNetworking {
                public_ip,
                ssh_port,
            })
            .ok_or_else(|| ScalewayDriverError::MissingPublicIp {
                instance_id: server.id.as_str().to_owned(),
            })
    }

    /// Removes the server and its volumes.
    ///
    /// A powered-on server is terminated. A stopped server does not offer
    /// `terminate`, so it is deleted and its volumes are deleted after it.
    pub(in crate::scaleway) async fn remove_instance(
        &self,
        handle: &MachineHandle,
    ) -> Result<(), ScalewayDriverError> {
        let Some(server) = self.fetch_instance(handle).await? else {
            return Ok(());
        };
        match Self::removal_for(&server) {
            InstanceRemoval::Terminate => {
                self.api
                    .perform_instance_action_async(&handle.zone, &handle.id, "terminate")
                    .await?;
            }
            InstanceRemoval::Delete { volume_ids } => {
                self.api
                    .delete_instance_async(&handle.zone, &handle.id)
                    .await?;
                for volume_id in &volume_ids {
                    self.remove_volume(&handle.zone, volume_id).await?;
                }
            }
        }
        Ok(())
    }

    pub(in crate::scaleway) fn removal_for(server: &InstanceSnapshot) -> InstanceRemoval {
        if Self::can_terminate(server) {
            InstanceRemoval::Terminate
        } else {
            InstanceRemoval::Delete {
                volume_ids: server.volume_ids.clone(),
            }
        }
    }

    pub(in crate::scaleway) fn can_terminate(server: &InstanceSnapshot) -> bool {
        server
            .allowed_actions
            .iter()
            .any(|action| action.as_str() == "terminate")
    }

    async fn remove_volume(&self, zone: &str, volume_id: &str) -> Result<(), ScalewayDriverError> {
        let path = format!("/zones/{zone}/volumes/{volume_id}");
        if self.call_api(Method::DELETE, &path, None).await?.is_none() {
            tracing::debug!(volume = volume_id, "volume already gone");
        } else {
            tracing::debug!(volume = volume_id, "volume deleted");
        }
        Ok(())
    }
}
