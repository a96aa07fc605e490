//! Core library for the Kiln image builder.
//!
//! A build is an ordered list of steps sharing a state bag. The runner walks
//! the steps forward until one halts, records an error or the build is
//! cancelled, then unwinds every entered step in reverse so the cloud
//! resources a build creates are always released. The crate ships a
//! Scaleway driver and the canonical "boot, provision, snapshot" sequence.

pub mod config;
pub mod driver;
pub mod hook;
pub mod image_build;
pub mod remote;
pub mod runner;
pub mod scaleway;
pub mod state;
pub mod step;
pub mod steps;
pub mod test_support;
pub mod ui;

pub use config::{BuildConfig, BuildSettings, Communicator, ConfigError, ScalewayConfig};
pub use driver::{
    Driver, DriverError, ImageHandle, ImageMetadata, ImageRequest, ImageState, MachineHandle,
    MachineNetworking, MachineRequest, MachineRequestBuilder, MachineState, SourceImageQuery,
};
pub use hook::{DispatchHook, Hook, HookError, NoopHook};
pub use image_build::{Artifact, BuildError, ImageBuild};
pub use remote::{Connection, RemoteShellHook};
pub use runner::{AskPause, Pause, PausePoint, RunOutcome, RunStatus, Runner, RunnerPhase};
pub use scaleway::{ScalewayDriver, ScalewayDriverError};
pub use state::{StateBag, StateError};
pub use step::{Step, StepAction, StepError};
pub use ui::{BasicUi, MachineReadableUi, PrefixedUi, Ui, UiError};
