//! Image capture and management through the Instances API.
//!
//! Images are captured with the server `backup` action, which snapshots every
//! attached volume and registers an image. The action returns a task whose
//! `href_result` points at the new image.

use std::collections::HashMap;

use reqwest::Method;
use serde::Deserialize;
use serde_json::json;

use crate::driver::{ImageHandle, MachineHandle};

use super::super::{ScalewayDriver, ScalewayDriverError};
use super::parse;

#[derive(Deserialize)]
struct TaskResponse {
    task: Task,
}

#[derive(Deserialize)]
struct Task {
    href_result: Option<String>,
}

#[derive(Deserialize)]
struct ImageResponse {
    image: ImageDetails,
}

/// Fields of an image the driver needs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(in crate::scaleway) struct ImageDetails {
    pub(in crate::scaleway) id: String,
    pub(in crate::scaleway) state: String,
    pub(in crate::scaleway) root_volume: Option<VolumeSnapshot>,
    #[serde(default)]
    pub(in crate::scaleway) extra_volumes: HashMap<String, VolumeSnapshot>,
}

/// Snapshot backing one of an image's volumes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(in crate::scaleway) struct VolumeSnapshot {
    pub(in crate::scaleway) id: String,
}

impl ImageDetails {
    /// Ids of every snapshot backing the image, root volume first.
    pub(in crate::scaleway) fn snapshot_ids(&self) -> Vec<&str> {
        let mut extra: Vec<(&String, &VolumeSnapshot)> = self.extra_volumes.iter().collect();
        extra.sort_by(|left, right| left.0.cmp(right.0));
        self.root_volume
            .iter()
            .chain(extra.into_iter().map(|(_, volume)| volume))
            .map(|volume| volume.id.as_str())
            .collect()
    }
}

impl ScalewayDriver {
    pub(in crate::scaleway) async fn backup_server(
        &self,
        handle: &MachineHandle,
        name: &str,
    ) -> Result<String, ScalewayDriverError> {
        let path = format!("/zones/{}/servers/{}/action", handle.zone, handle.id);
        let payload = json!({ "action": "backup", "name": name });
        let body = self
            .call_api(Method::POST, &path, Some(&payload))
            .await?
            .ok_or_else(|| ScalewayDriverError::NotFound {
                resource: format!("instance {}", handle.id),
            })?;
        let response: TaskResponse = parse(&body)?;
        Self::image_id_from_href(response.task.href_result.as_deref())
    }

    pub(in crate::scaleway) fn image_id_from_href(
        href: Option<&str>,
    ) -> Result<String, ScalewayDriverError> {
        href.and_then(|value| value.strip_prefix("/images/"))
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| ScalewayDriverError::UnexpectedResponse {
                message: format!("backup task returned no image reference: {href:?}"),
            })
    }

    pub(in crate::scaleway) async fn fetch_image(
        &self,
        image: &ImageHandle,
    ) -> Result<Option<ImageDetails>, ScalewayDriverError> {
        let path = format!("/zones/{}/images/{}", image.zone, image.id);
        let Some(body) = self.call_api(Method::GET, &path, None).await? else {
            return Ok(None);
        };
        let response: ImageResponse = parse(&body)?;
        Ok(Some(response.image))
    }

    pub(in crate::scaleway) async fn update_image_tags(
        &self,
        image: &ImageHandle,
        tags: &[String],
    ) -> Result<(), ScalewayDriverError> {
        let path = format!("/zones/{}/images/{}", image.zone, image.id);
        let payload = json!({ "tags": tags });
        self.call_api(Method::PATCH, &path, Some(&payload))
            .await?
            .map(|_| ())
            .ok_or_else(|| ScalewayDriverError::NotFound {
                resource: format!("image {}", image.id),
            })
    }

    /// Deletes the image and every snapshot backing its volumes.
    pub(in crate::scaleway) async fn remove_image(
        &self,
        image: &ImageHandle,
    ) -> Result<(), ScalewayDriverError> {
        let Some(details) = self.fetch_image(image).await? else {
            return Ok(());
        };
        let path = format!("/zones/{}/images/{}", image.zone, details.id);
        self.call_api(Method::DELETE, &path, None).await?;

        for snapshot_id in details.snapshot_ids() {
            let snapshot_path = format!("/zones/{}/snapshots/{snapshot_id}", image.zone);
            self.call_api(Method::DELETE, &snapshot_path, None).await?;
            tracing::debug!(image = %image.id, snapshot = snapshot_id, "image snapshot deleted");
        }
        Ok(())
    }
}
