//! Configuration loading via `ortho-config`.
//!
//! Two layers feed a build. [`ScalewayConfig`] carries provider credentials
//! and defaults under the `SCW_` prefix shared with the Scaleway CLI, and
//! [`BuildConfig`] carries image and communicator settings under `KILN_`.
//! [`BuildSettings::from_config`] validates both and produces the value the
//! steps read from the state bag.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::driver::{DriverError, ImageRequest, MachineRequest, SourceImageQuery};

/// Tag applied to every machine a build creates.
pub const MACHINE_TAG: &str = "kiln";

/// Scaleway specific configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application. Not needed for API
    /// calls.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Preferred availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for build machines. Defaults to `DEV1-S`.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Label of the image builds start from.
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

/// Image and communicator settings for one build.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KILN",
    discovery(
        app_name = "kiln",
        env_var = "KILN_CONFIG_PATH",
        config_file_name = "kiln.toml",
        dotfile_name = ".kiln.toml",
        project_file_name = "kiln.toml"
    )
)]
pub struct BuildConfig {
    /// Name of the image to produce. Required.
    pub image_name: Option<String>,
    /// Comma separated tags applied to the finished image.
    pub image_tags: Option<String>,
    /// How the build machine is reached: `ssh` or `none`.
    #[ortho_config(default = "ssh".to_owned())]
    pub communicator: String,
    /// Remote user for SSH.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// SSH port on the build machine.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key passed to `ssh -i`. Supports `~/` expansion.
    pub ssh_identity_file: Option<String>,
    /// Seconds to wait for the SSH port to accept connections.
    #[ortho_config(default = 300)]
    pub ssh_timeout_secs: u64,
    /// Seconds to wait for a machine state transition.
    #[ortho_config(default = 600)]
    pub state_timeout_secs: u64,
    /// Seconds to wait for the image snapshot to complete.
    #[ortho_config(default = 1800)]
    pub image_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in kiln.toml",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_image,
            &FieldMetadata::new("source image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
        )?;
        require_field(
            &self.default_instance_type,
            &FieldMetadata::new(
                "instance type",
                "SCW_DEFAULT_INSTANCE_TYPE",
                "default_instance_type",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_architecture,
            &FieldMetadata::new(
                "CPU architecture",
                "SCW_DEFAULT_ARCHITECTURE",
                "default_architecture",
                "scaleway",
            ),
        )?;
        Ok(())
    }
}

impl BuildConfig {
    /// Loads configuration from defaults, configuration files and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Tags parsed from [`BuildConfig::image_tags`], trimmed, blanks dropped.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        self.image_tags
            .as_deref()
            .map(split_tags)
            .unwrap_or_default()
    }

    /// Checks required fields and ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the field to fix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            self.image_name.as_deref().unwrap_or_default(),
            &FieldMetadata::new("image name", "KILN_IMAGE_NAME", "image_name", "build"),
        )?;
        self.communicator.parse::<Communicator>()?;
        require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH user", "KILN_SSH_USER", "ssh_user", "build"),
        )?;
        if let Some(identity) = &self.ssh_identity_file {
            require_field(
                identity,
                &FieldMetadata::new(
                    "SSH identity file",
                    "KILN_SSH_IDENTITY_FILE",
                    "ssh_identity_file",
                    "build",
                ),
            )?;
        }
        if self.ssh_port == 0 {
            return Err(ConfigError::Invalid {
                field: "ssh_port",
                message: String::from("port must be between 1 and 65535"),
            });
        }
        for (field, value) in [
            ("ssh_timeout_secs", self.ssh_timeout_secs),
            ("state_timeout_secs", self.state_timeout_secs),
            ("image_timeout_secs", self.image_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: String::from("timeout must be at least one second"),
                });
            }
        }
        Ok(())
    }
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_owned)
        .collect()
}

/// How steps reach the build machine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Communicator {
    /// Probe the SSH port and run provisioners over `ssh`.
    #[default]
    Ssh,
    /// Skip connectivity; provisioners that need a connection fail.
    None,
}

impl FromStr for Communicator {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "none" => Ok(Self::None),
            other => Err(ConfigError::Invalid {
                field: "communicator",
                message: format!("unknown communicator '{other}', expected 'ssh' or 'none'"),
            }),
        }
    }
}

impl fmt::Display for Communicator {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssh => formatter.write_str("ssh"),
            Self::None => formatter.write_str("none"),
        }
    }
}

/// Upper bounds for the build's waits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeouts {
    /// SSH reachability.
    pub ssh: Duration,
    /// Machine state transitions.
    pub machine_state: Duration,
    /// Image snapshot completion.
    pub image: Duration,
}

/// Validated build parameters stored in the state bag under `config`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildSettings {
    /// Query resolving the image the machine boots from.
    pub source: SourceImageQuery,
    /// Name given to the build machine.
    pub machine_name: String,
    /// Commercial type of the build machine.
    pub instance_type: String,
    /// Image produced by the build.
    pub image: ImageRequest,
    /// How the machine is reached.
    pub communicator: Communicator,
    /// Remote user for SSH.
    pub ssh_user: String,
    /// SSH port.
    pub ssh_port: u16,
    /// Private key passed to `ssh -i`.
    pub ssh_identity_file: Option<String>,
    /// Wait bounds.
    pub timeouts: Timeouts,
}

impl BuildSettings {
    /// Validates both configuration layers and combines them.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] raised by either layer.
    pub fn from_config(scaleway: &ScalewayConfig, build: &BuildConfig) -> Result<Self, ConfigError> {
        scaleway.validate()?;
        build.validate()?;
        let image_name = build
            .image_name
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_owned();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let short = suffix.get(..8).unwrap_or(&suffix);

        Ok(Self {
            source: SourceImageQuery {
                label: scaleway.default_image.trim().to_owned(),
                architecture: scaleway.default_architecture.trim().to_owned(),
                zone: scaleway.default_zone.trim().to_owned(),
                project_id: scaleway.default_project_id.trim().to_owned(),
                organisation_id: scaleway.default_organization_id.clone(),
            },
            machine_name: format!("kiln-{short}"),
            instance_type: scaleway.default_instance_type.trim().to_owned(),
            image: ImageRequest {
                name: image_name,
                tags: build.tags(),
            },
            communicator: build.communicator.parse()?,
            ssh_user: build.ssh_user.trim().to_owned(),
            ssh_port: build.ssh_port,
            ssh_identity_file: build.ssh_identity_file.clone(),
            timeouts: Timeouts {
                ssh: Duration::from_secs(build.ssh_timeout_secs),
                machine_state: Duration::from_secs(build.state_timeout_secs),
                image: Duration::from_secs(build.image_timeout_secs),
            },
        })
    }

    /// Builds the machine request for the resolved source image.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Validation`] when a required field is blank.
    pub fn machine_request(&self, image_id: &str) -> Result<MachineRequest, DriverError> {
        MachineRequest::builder()
            .name(&self.machine_name)
            .image_id(image_id)
            .instance_type(&self.instance_type)
            .zone(&self.source.zone)
            .project_id(&self.source.project_id)
            .organisation_id(self.source.organisation_id.clone())
            .tags(vec![String::from(MACHINE_TAG), self.machine_name.clone()])
            .build()
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds an unusable value.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Configuration key.
        field: &'static str,
        /// What is wrong with the value.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
