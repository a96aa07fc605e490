//! Server creation helpers for the Scaleway driver.
//!
//! Scaleway creates servers powered off, so creation is followed by a
//! `poweron` action when the provider allows it.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::driver::MachineRequest;
use crate::scaleway::types::Action;

use super::super::{ScalewayDriver, ScalewayDriverError};
use super::{HTTP_CLIENT, InstanceSnapshot, SCALEWAY_INSTANCE_API_BASE, volume_ids};

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: scaleway_rs::ScalewayInstance,
}

impl ScalewayDriver {
    pub(in crate::scaleway) fn is_instance_type_error(
        api_err: &scaleway_rs::ScalewayApiError,
        request: &MachineRequest,
    ) -> bool {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err
                .resource_id
                .as_deref()
                .is_some_and(|id| id == request.instance_type)
            || (api_err.etype == "invalid_arguments"
                && api_err
                    .message
                    .to_ascii_lowercase()
                    .contains("commercial_type"))
    }

    pub(in crate::scaleway) async fn power_on_if_needed(
        &self,
        zone: &str,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), ScalewayDriverError> {
        if snapshot.state.as_str() == "running" || snapshot.state.as_str() == "starting" {
            return Ok(());
        }

        if snapshot
            .allowed_actions
            .iter()
            .any(|action| action.as_str() == "poweron")
        {
            self.api
                .perform_instance_action_async(zone, snapshot.id.as_str(), "poweron")
                .await?;
            return Ok(());
        }

        Err(ScalewayDriverError::PowerOnNotAllowed {
            instance_id: snapshot.id.as_str().to_owned(),
            state: snapshot.state.as_str().to_owned(),
        })
    }

    /// Runs `power_on` and, when it fails, runs `release` so the new server
    /// does not outlive the failed creation.
    ///
    /// The power-on error is returned. A release failure is only logged.
    pub(in crate::scaleway) async fn power_on_or_release<P, PFut, R, RFut>(
        snapshot: &InstanceSnapshot,
        power_on: P,
        release: R,
    ) -> Result<(), ScalewayDriverError>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<(), ScalewayDriverError>>,
        R: FnOnce() -> RFut,
        RFut: Future<Output = Result<(), ScalewayDriverError>>,
    {
        let Err(err) = power_on().await else {
            return Ok(());
        };
        tracing::debug!(
            server = snapshot.id.as_str(),
            error = %err,
            "power-on failed, removing server"
        );
        if let Err(release_err) = release().await {
            tracing::warn!(
                server = snapshot.id.as_str(),
                error = %release_err,
                "failed to remove server after power-on failure"
            );
        }
        Err(err)
    }

    /// Creates a server for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayDriverError`] when the API request fails or the
    /// provider rejects the requested instance type.
    pub(in crate::scaleway) async fn create_server(
        &self,
        request: &MachineRequest,
    ) -> Result<InstanceSnapshot, ScalewayDriverError> {
        let url = format!("{SCALEWAY_INSTANCE_API_BASE}/zones/{}/servers", request.zone);
        let payload = CreateServerRequest {
            name: &request.name,
            commercial_type: &request.instance_type,
            image: &request.image_id,
            project: &request.project_id,
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: &request.tags,
            organization: request.organisation_id.as_deref(),
        };

        let response = HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            let parsed: CreateServerResponse = super::parse(&body)?;
            let server = parsed.server;
            tracing::debug!(server = %server.id, state = %server.state, "server created");
            return Ok(InstanceSnapshot {
                id: server.id.into(),
                state: server.state.into(),
                allowed_actions: server
                    .allowed_actions
                    .into_iter()
                    .map(Action::from)
                    .collect(),
                public_ip: server.public_ip.map(|ip| ip.address),
                volume_ids: volume_ids(server.volumes),
            });
        }

        if let Ok(api_err) = serde_json::from_slice::<scaleway_rs::ScalewayApiError>(&body)
            && Self::is_instance_type_error(&api_err, request)
        {
            return Err(ScalewayDriverError::InstanceTypeUnavailable {
                instance_type: request.instance_type.clone(),
                zone: request.zone.clone(),
            });
        }

        Err(ScalewayDriverError::Provider {
            message: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
