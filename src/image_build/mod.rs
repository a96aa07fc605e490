//! Wires the canonical image build together and runs it.
//!
//! An [`ImageBuild`] owns the validated settings and the injected
//! collaborators. Each call to [`ImageBuild::run`] creates a fresh state bag,
//! runs the step sequence and maps the outcome onto an [`Artifact`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::BuildSettings;
use crate::driver::{Driver, ImageHandle};
use crate::hook::{Hook, NoopHook};
use crate::runner::{AskPause, RunStatus, Runner};
use crate::state::{StateBag, keys};
use crate::step::{Step, StepError};
use crate::steps::{
    IMAGE, StepConnect, StepCreateImage, StepCreateMachine, StepProvision, StepSourceImage,
    StepStopMachine, StepTagImage, StepWaitForRunning,
};
use crate::ui::Ui;

/// Image produced by a successful build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Artifact {
    /// Provider identifier of the image.
    pub image_id: String,
    /// Name the image was registered under.
    pub image_name: String,
    /// Zone holding the image.
    pub zone: String,
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{} ({}) in {}",
            self.image_name, self.image_id, self.zone
        )
    }
}

/// Reasons a build produced no artifact.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
    /// A step recorded an error.
    #[error("build failed: {0}")]
    Failed(#[source] StepError),
    /// The cancellation token fired before the build finished.
    #[error("build cancelled")]
    Cancelled,
    /// A step stopped the build without recording an error.
    #[error("build halted")]
    Halted,
    /// The run completed but no image was published.
    #[error("build completed without producing an image")]
    MissingArtifact,
}

/// Canonical Scaleway image build.
pub struct ImageBuild {
    settings: BuildSettings,
    driver: Arc<dyn Driver>,
    hook: Arc<dyn Hook>,
    ui: Arc<dyn Ui>,
    debug: bool,
    connect: StepConnect,
}

impl ImageBuild {
    /// Creates a build that runs no provisioners.
    #[must_use]
    pub fn new(settings: BuildSettings, driver: Arc<dyn Driver>, ui: Arc<dyn Ui>) -> Self {
        Self {
            settings,
            driver,
            hook: Arc::new(NoopHook),
            ui,
            debug: false,
            connect: StepConnect::new(),
        }
    }

    /// Replaces the hook invoked by the provisioning step.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hook = hook;
        self
    }

    /// Pauses for confirmation after every run and cleanup.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Overrides the pause between SSH connection attempts.
    #[must_use]
    pub const fn with_connect_retry(mut self, retry_interval: Duration) -> Self {
        self.connect = self.connect.with_retry_interval(retry_interval);
        self
    }

    /// Settings the build runs with.
    #[must_use]
    pub const fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Step sequence in execution order.
    #[must_use]
    pub fn steps(&self) -> Vec<Box<dyn Step>> {
        vec![
            Box::new(StepSourceImage),
            Box::new(StepCreateMachine),
            Box::new(StepWaitForRunning),
            Box::new(self.connect),
            Box::new(StepProvision),
            Box::new(StepStopMachine),
            Box::new(StepCreateImage),
            Box::new(StepTagImage),
        ]
    }

    /// Creates a state bag seeded with the settings and collaborators.
    #[must_use]
    pub fn state(&self) -> StateBag {
        let state = StateBag::new();
        state.put(keys::CONFIG, self.settings.clone());
        state.put_driver(Arc::clone(&self.driver));
        state.put_hook(Arc::clone(&self.hook));
        state.put_ui(Arc::clone(&self.ui));
        state
    }

    /// Runs the build to completion.
    ///
    /// Every machine and unfinished image created along the way is released
    /// before this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] when the run fails, is cancelled or halts.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<Artifact, BuildError> {
        let mut runner = Runner::new(self.steps());
        if self.debug {
            runner = runner.with_pause(Arc::new(AskPause));
        }
        let state = self.state();
        tracing::info!(image = %self.settings.image.name, "starting image build");
        let outcome = runner.run(&state, cancel).await;

        match outcome.status {
            RunStatus::Failed => {
                let error = outcome.error.ok_or(BuildError::Halted)?;
                self.ui.error(&format!("Build failed: {error}"));
                Err(BuildError::Failed(error))
            }
            RunStatus::Halted if state.is_cancelled() || cancel.is_cancelled() => {
                self.ui.error("Build cancelled.");
                Err(BuildError::Cancelled)
            }
            RunStatus::Halted => {
                self.ui.error("Build halted.");
                Err(BuildError::Halted)
            }
            RunStatus::Completed => {
                let image: ImageHandle = state
                    .get(IMAGE)
                    .ok_or(BuildError::MissingArtifact)?;
                let artifact = Artifact {
                    image_id: image.id,
                    image_name: self.settings.image.name.clone(),
                    zone: image.zone,
                };
                self.ui.say(&format!("Build finished: {artifact}"));
                self.ui
                    .machine("artifact", &[&artifact.image_id, &artifact.zone]);
                tracing::info!(image = %artifact.image_id, zone = %artifact.zone, "image build finished");
                Ok(artifact)
            }
        }
    }
}

impl std::fmt::Debug for ImageBuild {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ImageBuild")
            .field("settings", &self.settings)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}
