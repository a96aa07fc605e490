//! Error types for the Scaleway driver.

use scaleway_rs::ScalewayError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::driver::DriverError;

/// Errors raised by the Scaleway driver.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayDriverError {
    /// Raised when the provider configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the requested image label cannot be resolved.
    #[error("image '{label}' (arch {arch}) not found in zone {zone}")]
    ImageNotFound {
        /// Image label passed by the caller.
        label: String,
        /// Architecture requested by the caller.
        arch: String,
        /// Zone used for the lookup.
        zone: String,
    },
    /// Raised when the server type is not available in the selected zone.
    #[error("instance type '{instance_type}' not available in zone {zone}")]
    InstanceTypeUnavailable {
        /// Requested commercial type.
        instance_type: String,
        /// Target zone.
        zone: String,
    },
    /// Raised when a running instance has no usable public address.
    #[error("instance {instance_id} missing public IPv4 address")]
    MissingPublicIp {
        /// Provider instance identifier.
        instance_id: String,
    },
    /// Raised when an instance cannot be powered on.
    #[error("instance {instance_id} in state {state} cannot be powered on")]
    PowerOnNotAllowed {
        /// Provider instance identifier.
        instance_id: String,
        /// Current state reported by the provider.
        state: String,
    },
    /// Raised when a resource is gone.
    #[error("{resource} not found")]
    NotFound {
        /// Resource description.
        resource: String,
    },
    /// Raised when a response body does not have the expected shape.
    #[error("unexpected API response: {message}")]
    UnexpectedResponse {
        /// What was wrong with the response.
        message: String,
    },
    /// Wrapper for provider level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider SDK or API.
        message: String,
    },
}

impl From<ScalewayError> for ScalewayDriverError {
    fn from(value: ScalewayError) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<reqwest::Error> for ScalewayDriverError {
    fn from(value: reqwest::Error) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<ConfigError> for ScalewayDriverError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<ScalewayDriverError> for DriverError {
    fn from(value: ScalewayDriverError) -> Self {
        match value {
            ScalewayDriverError::NotFound { resource } => Self::NotFound { resource },
            ScalewayDriverError::ImageNotFound { .. } => Self::NotFound {
                resource: value.to_string(),
            },
            ScalewayDriverError::Config(message) => Self::Validation(message),
            other => Self::Provider {
                message: other.to_string(),
            },
        }
    }
}
