//! Lifecycle helpers for the Scaleway driver.
//!
//! Server listing and power actions go through `scaleway_rs`. Calls the SDK
//! does not cover (server creation, backups, image updates) use a shared
//! `reqwest` client against the Instances API.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, StatusCode};

mod create;
mod image;
mod instance;
mod snapshot;

use crate::scaleway::types::{Action, InstanceId, InstanceState};

use super::{ScalewayDriver, ScalewayDriverError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSnapshot {
    pub(crate) id: InstanceId,
    pub(crate) state: InstanceState,
    pub(crate) allowed_actions: Vec<Action>,
    pub(crate) public_ip: Option<String>,
    pub(crate) volume_ids: Vec<String>,
}

/// Collects the ids of a server's attached volumes in a stable order.
pub(in crate::scaleway) fn volume_ids(
    volumes: scaleway_rs::ScalewayImageExtraVolumes,
) -> Vec<String> {
    let mut ids: Vec<String> = volumes
        .volumes
        .into_values()
        .map(|volume| volume.id)
        .collect();
    ids.sort();
    ids
}

impl ScalewayDriver {
    /// Sends an authenticated request to the Instances API.
    ///
    /// Returns `None` for `404 Not Found` and the raw body otherwise.
    pub(in crate::scaleway) async fn call_api(
        &self,
        method: Method,
        path: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<Option<Vec<u8>>, ScalewayDriverError> {
        let url = format!("{SCALEWAY_INSTANCE_API_BASE}{path}");
        let mut request = HTTP_CLIENT
            .request(method.clone(), &url)
            .header("X-Auth-Token", &self.secret_key);
        if let Some(body) = payload {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        tracing::trace!(%method, path, %status, "instance API call");

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            return Ok(Some(body));
        }
        Err(ScalewayDriverError::Provider {
            message: format!(
                "{method} {path} returned {status}: {}",
                String::from_utf8_lossy(&body)
            ),
        })
    }
}

pub(in crate::scaleway) fn parse<T: serde::de::DeserializeOwned>(
    body: &[u8],
) -> Result<T, ScalewayDriverError> {
    serde_json::from_slice(body).map_err(|err| ScalewayDriverError::UnexpectedResponse {
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests;
