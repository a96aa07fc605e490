//! Source image resolution for the Scaleway driver.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use crate::driver::{ImageMetadata, SourceImageQuery};

use super::super::{ScalewayDriver, ScalewayDriverError};

impl ScalewayDriver {
    /// Resolves `query` to the newest available image, preferring images
    /// owned by the project over public ones.
    pub(in crate::scaleway) async fn resolve_image(
        &self,
        query: &SourceImageQuery,
    ) -> Result<ImageMetadata, ScalewayDriverError> {
        self.resolve_image_with(
            query,
            || async move {
                if query.project_id.is_empty() {
                    return Ok(Vec::new());
                }
                let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api.clone(), &query.zone)
                    .public(false)
                    .project(&query.project_id)
                    .name(&query.label)
                    .arch(&query.architecture);
                if let Some(org) = &query.organisation_id {
                    scoped = scoped.organization(org);
                }
                scoped.run_async().await.map_err(ScalewayDriverError::from)
            },
            || async move {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), &query.zone)
                    .public(true)
                    .name(&query.label)
                    .arch(&query.architecture)
                    .run_async()
                    .await
                    .map_err(ScalewayDriverError::from)
            },
        )
        .await
    }

    pub(in crate::scaleway) async fn resolve_image_with<FutA, FutB, FetchA, FetchB>(
        &self,
        query: &SourceImageQuery,
        project_fetch: FetchA,
        public_fetch: FetchB,
    ) -> Result<ImageMetadata, ScalewayDriverError>
    where
        FetchA: FnOnce() -> FutA,
        FetchB: FnOnce() -> FutB,
        FutA: Future<Output = Result<Vec<ScalewayImage>, ScalewayDriverError>>,
        FutB: Future<Output = Result<Vec<ScalewayImage>, ScalewayDriverError>>,
    {
        let project_images = Self::filter_images(project_fetch().await?, query);
        let candidates = if project_images.is_empty() {
            Self::filter_images(public_fetch().await?, query)
        } else {
            project_images
        };
        Self::select_image(candidates, query)
    }

    pub(in crate::scaleway) fn select_image(
        candidates: Vec<ScalewayImage>,
        query: &SourceImageQuery,
    ) -> Result<ImageMetadata, ScalewayDriverError> {
        candidates
            .into_iter()
            .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
            .map(|image| ImageMetadata {
                id: image.id,
                name: image.name,
                architecture: image.arch,
                creation_date: image.creation_date,
            })
            .ok_or_else(|| ScalewayDriverError::ImageNotFound {
                label: query.label.clone(),
                arch: query.architecture.clone(),
                zone: query.zone.clone(),
            })
    }

    pub(in crate::scaleway) fn filter_images(
        images: Vec<ScalewayImage>,
        query: &SourceImageQuery,
    ) -> Vec<ScalewayImage> {
        images
            .into_iter()
            .filter(|image| image.arch == query.architecture)
            .filter(|image| image.state == "available")
            .collect()
    }
}
