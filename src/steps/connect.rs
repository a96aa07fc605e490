//! Waits until the build machine accepts SSH connections.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::{CONNECTION, MACHINE_NETWORKING, message, say};
use crate::config::{BuildSettings, Communicator};
use crate::driver::{MachineNetworking, deadline_after, deadline_passed};
use crate::remote::Connection;
use crate::state::StateBag;
use crate::step::{Step, StepAction, StepError, StepFuture, halt_with};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Probes the SSH port and publishes a [`Connection`].
///
/// Skipped entirely when the communicator is `none`.
#[derive(Clone, Copy, Debug)]
pub struct StepConnect {
    retry_interval: Duration,
}

impl Default for StepConnect {
    fn default() -> Self {
        Self::new()
    }
}

impl StepConnect {
    const NAME: &'static str = "connect";

    /// Creates the step with the default retry interval.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Overrides the pause between two connection attempts.
    #[must_use]
    pub const fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    async fn probe(
        &self,
        connection: &Connection,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, StepError> {
        let address = connection.address();
        let deadline = deadline_after(limit);
        let mut last_error = String::from("no attempt made");

        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            let attempt = deadline.map_or(ATTEMPT_TIMEOUT, |at| {
                ATTEMPT_TIMEOUT.min(at.saturating_duration_since(Instant::now()))
            });
            match timeout(attempt, TcpStream::connect(address)).await {
                Ok(Ok(_stream)) => return Ok(true),
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = String::from("connection attempt timed out"),
            }
            tracing::debug!(%address, error = %last_error, "ssh not reachable yet");

            if deadline_passed(deadline) {
                return Err(StepError::Connect {
                    step: Self::NAME.to_owned(),
                    address: address.to_string(),
                    message: last_error,
                });
            }
            tokio::select! {
                () = cancel.cancelled() => return Ok(false),
                () = sleep(self.retry_interval) => {}
            }
        }
    }
}

impl Step for StepConnect {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn run<'a>(
        &'a self,
        state: &'a StateBag,
        cancel: &'a CancellationToken,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let settings: BuildSettings = match state.config() {
                Ok(settings) => settings,
                Err(err) => return halt_with(state, StepError::state(Self::NAME, err)),
            };
            if settings.communicator == Communicator::None {
                message(state, "Communicator disabled; not connecting.");
                return StepAction::Continue;
            }
            let networking: MachineNetworking = match state.require(MACHINE_NETWORKING) {
                Ok(networking) => networking,
                Err(err) => return halt_with(state, StepError::state(Self::NAME, err)),
            };

            let connection = Connection {
                host: networking.public_ip,
                port: settings.ssh_port,
                user: settings.ssh_user.clone(),
                identity_file: settings.ssh_identity_file.clone(),
            };
            say(state, "Waiting for SSH to become available...");
            match self.probe(&connection, settings.timeouts.ssh, cancel).await {
                Ok(true) => {
                    message(state, &format!("Connected to {}", connection.address()));
                    state.put(CONNECTION, connection);
                    StepAction::Continue
                }
                Ok(false) => {
                    tracing::info!(step = Self::NAME, "connection wait cancelled");
                    StepAction::Halt
                }
                Err(err) => halt_with(state, err),
            }
        })
    }

    fn cleanup<'a>(&'a self, state: &'a StateBag) -> StepFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            state.delete(CONNECTION);
            Ok(())
        })
    }
}
