//! Run-scoped key/value store shared by every step of a build.
//!
//! The bag is the only channel through which steps exchange data. Values are
//! stored type-erased behind a single mutex and cloned out on read, so no lock
//! is ever held across an `.await`.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::driver::Driver;
use crate::hook::Hook;
use crate::step::StepError;
use crate::ui::Ui;

/// Reserved keys written by the entry point and the runner.
pub mod keys {
    /// Most recent forward step failure ([`crate::step::StepError`]).
    pub const ERROR: &str = "error";
    /// Set to `true` when forward progress stopped early.
    pub const HALTED: &str = "halted";
    /// Set to `true` when the runner observed cancellation.
    pub const CANCELLED: &str = "cancelled";
    /// Injected [`crate::hook::Hook`].
    pub const HOOK: &str = "hook";
    /// Injected [`crate::ui::Ui`].
    pub const UI: &str = "ui";
    /// Injected [`crate::driver::Driver`].
    pub const DRIVER: &str = "driver";
    /// Validated build configuration.
    pub const CONFIG: &str = "config";
}

/// Errors raised when a required value cannot be read from the bag.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StateError {
    /// Raised when the key has never been written or was deleted.
    #[error("state key '{key}' is not present")]
    Missing {
        /// Key that was looked up.
        key: String,
    },
    /// Raised when the stored value has a different type than requested.
    #[error("state key '{key}' does not hold a value of type {expected}")]
    TypeMismatch {
        /// Key that was looked up.
        key: String,
        /// Type requested by the caller.
        expected: &'static str,
    },
}

type Value = Arc<dyn Any + Send + Sync>;

/// Concurrency-safe map from string keys to arbitrary typed values.
#[derive(Default)]
pub struct StateBag {
    values: Mutex<HashMap<String, Value>>,
}

impl StateBag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.values.lock().insert(key.into(), Arc::new(value));
    }

    /// Returns a clone of the value under `key`.
    ///
    /// Absence and type mismatches both yield `None`; use
    /// [`StateBag::require`] when the distinction matters.
    #[must_use]
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Clone,
    {
        self.require(key).ok()
    }

    /// Returns a clone of the value under `key` or a descriptive error.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Missing`] when the key is absent and
    /// [`StateError::TypeMismatch`] when it holds another type.
    pub fn require<T>(&self, key: &str) -> Result<T, StateError>
    where
        T: Any + Clone,
    {
        let value = self
            .values
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StateError::Missing {
                key: key.to_owned(),
            })?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| StateError::TypeMismatch {
                key: key.to_owned(),
                expected: type_name::<T>(),
            })
    }

    /// Reports whether any value is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    /// Removes `key`, returning `true` when a value was present.
    pub fn delete(&self, key: &str) -> bool {
        self.values.lock().remove(key).is_some()
    }

    /// Returns the keys currently stored, sorted for stable output.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Injects the UI under [`keys::UI`].
    pub fn put_ui(&self, ui: Arc<dyn Ui>) {
        self.put(keys::UI, ui);
    }

    /// Injects the driver under [`keys::DRIVER`].
    pub fn put_driver(&self, driver: Arc<dyn Driver>) {
        self.put(keys::DRIVER, driver);
    }

    /// Injects the hook under [`keys::HOOK`].
    pub fn put_hook(&self, hook: Arc<dyn Hook>) {
        self.put(keys::HOOK, hook);
    }

    /// Returns the injected UI.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when no UI was injected.
    pub fn ui(&self) -> Result<Arc<dyn Ui>, StateError> {
        self.require(keys::UI)
    }

    /// Returns the injected driver.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when no driver was injected.
    pub fn driver(&self) -> Result<Arc<dyn Driver>, StateError> {
        self.require(keys::DRIVER)
    }

    /// Returns the injected hook.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when no hook was injected.
    pub fn hook(&self) -> Result<Arc<dyn Hook>, StateError> {
        self.require(keys::HOOK)
    }

    /// Returns the injected configuration object.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when no configuration of type `T` was injected.
    pub fn config<T>(&self) -> Result<T, StateError>
    where
        T: Any + Clone,
    {
        self.require(keys::CONFIG)
    }

    /// Returns the recorded step failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<StepError> {
        self.get(keys::ERROR)
    }

    /// Records `error` as the run's most recent step failure.
    pub fn record_error(&self, error: StepError) {
        tracing::debug!(%error, "recording step error");
        self.put(keys::ERROR, error);
    }

    /// Reports whether forward progress was halted.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.flag(keys::HALTED)
    }

    /// Reports whether the runner observed cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag(keys::CANCELLED)
    }

    fn flag(&self, key: &str) -> bool {
        self.get::<bool>(key).unwrap_or(false)
    }
}

impl fmt::Debug for StateBag {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StateBag")
            .field("keys", &self.keys())
            .finish()
    }
}
