//! Named extension points invoked by the provisioning step.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::state::StateBag;

/// Runs before the provisioners.
pub const HOOK_PRE_PROVISION: &str = "pre_provision";
/// Runs the provisioners.
pub const HOOK_PROVISION: &str = "provision";
/// Runs after the provisioners.
pub const HOOK_POST_PROVISION: &str = "post_provision";

/// Errors raised by hooks.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum HookError {
    /// Raised when a hook observes cancellation at a safe point.
    #[error("hook '{hook}' cancelled")]
    Cancelled {
        /// Hook name.
        hook: String,
    },
    /// Raised when a hook's work fails.
    #[error("hook '{hook}' failed: {message}")]
    Failed {
        /// Hook name.
        hook: String,
        /// Description of the failure.
        message: String,
    },
}

impl HookError {
    /// Reports whether the error represents cancellation rather than failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Future returned by [`Hook::run`].
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HookError>> + Send + 'a>>;

/// Extension point invoked by name.
pub trait Hook: Send + Sync {
    /// Runs the work registered for `name`.
    ///
    /// Implementations must poll `cancel` between units of work and return
    /// [`HookError::Cancelled`] when it is set.
    fn run<'a>(
        &'a self,
        name: &'a str,
        state: &'a StateBag,
        cancel: &'a CancellationToken,
    ) -> HookFuture<'a>;
}

/// Hook that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHook;

impl Hook for NoopHook {
    fn run<'a>(
        &'a self,
        _name: &'a str,
        _state: &'a StateBag,
        _cancel: &'a CancellationToken,
    ) -> HookFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Routes each hook name to an ordered list of hooks.
#[derive(Clone, Default)]
pub struct DispatchHook {
    mapping: HashMap<String, Vec<Arc<dyn Hook>>>,
}

impl DispatchHook {
    /// Creates a dispatcher with no registrations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `hook` to the list run for `name`.
    #[must_use]
    pub fn register(mut self, name: impl Into<String>, hook: Arc<dyn Hook>) -> Self {
        self.mapping.entry(name.into()).or_default().push(hook);
        self
    }

    /// Number of hooks registered for `name`.
    #[must_use]
    pub fn registered(&self, name: &str) -> usize {
        self.mapping.get(name).map_or(0, Vec::len)
    }
}

impl Hook for DispatchHook {
    fn run<'a>(
        &'a self,
        name: &'a str,
        state: &'a StateBag,
        cancel: &'a CancellationToken,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            let Some(hooks) = self.mapping.get(name) else {
                return Ok(());
            };
            for (index, hook) in hooks.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(HookError::Cancelled {
                        hook: name.to_owned(),
                    });
                }
                tracing::debug!(hook = name, index, "dispatching hook");
                hook.run(name, state, cancel).await?;
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for DispatchHook {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.mapping.keys().collect();
        names.sort();
        formatter
            .debug_struct("DispatchHook")
            .field("hooks", &names)
            .finish()
    }
}
