//! Newtypes for Scaleway lifecycle values to avoid stringly-typed code.

use std::ops::Deref;

use crate::driver::{ImageState, MachineState};

macro_rules! newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub(crate) struct $name(String);

        impl $name {
            pub(crate) const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }
    };
}

newtype!(InstanceId);
newtype!(InstanceState);
newtype!(Action);

impl InstanceState {
    /// Maps the provider's server state onto the driver vocabulary.
    pub(crate) fn to_machine_state(&self) -> MachineState {
        match self.as_str() {
            "running" => MachineState::Running,
            "stopped" | "stopped in place" => MachineState::Stopped,
            "starting" => MachineState::Starting,
            "stopping" => MachineState::Stopping,
            "locked" => MachineState::Locked,
            other => MachineState::Other(other.to_owned()),
        }
    }
}

/// Maps the provider's image state onto the driver vocabulary.
pub(crate) fn image_state(state: &str) -> ImageState {
    match state {
        "available" => ImageState::Available,
        "creating" => ImageState::Creating,
        "error" => ImageState::Error,
        other => ImageState::Other(other.to_owned()),
    }
}
