//! Remote shell provisioning over the system `ssh` client.
//!
//! [`RemoteShellHook`] runs inline commands on the build machine using the
//! [`Connection`] published by the connect step. Commands run one at a time
//! and the cancellation token is checked between them; a command that is
//! already running is left to finish.

use std::ffi::OsString;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use shell_escape::unix::escape;
use tokio_util::sync::CancellationToken;

use crate::hook::{Hook, HookError, HookFuture};
use crate::state::StateBag;
use crate::steps::CONNECTION;

mod command;

pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};

/// Default SSH client binary.
pub const DEFAULT_SSH_BIN: &str = "ssh";

/// How to reach the build machine over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Connection {
    /// Address of the machine.
    pub host: IpAddr,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key passed with `-i`, if any.
    pub identity_file: Option<String>,
}

impl Connection {
    /// Socket address probed by the connect step.
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is not set.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Hook running inline shell commands on the machine.
#[derive(Clone)]
pub struct RemoteShellHook {
    commands: Vec<String>,
    env: Vec<(String, String)>,
    ssh_bin: String,
    runner: Arc<dyn CommandRunner>,
}

impl RemoteShellHook {
    /// Creates a hook running `commands` through the process runner.
    #[must_use]
    pub fn new(commands: Vec<String>) -> Self {
        Self {
            commands,
            env: Vec::new(),
            ssh_bin: String::from(DEFAULT_SSH_BIN),
            runner: Arc::new(ProcessCommandRunner),
        }
    }

    /// Exports `key=value` to every command.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Replaces the command runner.
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replaces the SSH client binary.
    #[must_use]
    pub fn with_ssh_bin(mut self, ssh_bin: impl Into<String>) -> Self {
        self.ssh_bin = ssh_bin.into();
        self
    }

    /// Commands run by the hook, in order.
    #[must_use]
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Prefixes `command` with the configured environment assignments.
    #[must_use]
    pub fn render_command(&self, command: &str) -> String {
        let mut rendered = String::new();
        for (key, value) in &self.env {
            rendered.push_str(key);
            rendered.push('=');
            rendered.push_str(escape(value.as_str().into()).as_ref());
            rendered.push(' ');
        }
        rendered.push_str(command);
        rendered
    }

    /// Arguments passed to the SSH client for `remote_command`.
    #[must_use]
    pub fn ssh_args(connection: &Connection, remote_command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(connection.port.to_string()),
        ];
        if let Some(identity_file) = &connection.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }
        for option in [
            "BatchMode=yes",
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from(format!(
            "{}@{}",
            connection.user, connection.host
        )));
        args.push(OsString::from(remote_command));
        args
    }

    async fn run_one(
        &self,
        hook: &str,
        connection: &Connection,
        command: &str,
    ) -> Result<CommandOutput, HookError> {
        let args = Self::ssh_args(connection, &self.render_command(command));
        let runner = Arc::clone(&self.runner);
        let program = self.ssh_bin.clone();
        let failed = |message: String| HookError::Failed {
            hook: hook.to_owned(),
            message,
        };

        tokio::task::spawn_blocking(move || runner.run(&program, &args))
            .await
            .map_err(|err| failed(err.to_string()))?
            .map_err(|err| failed(err.to_string()))
    }
}

impl Hook for RemoteShellHook {
    fn run<'a>(
        &'a self,
        name: &'a str,
        state: &'a StateBag,
        cancel: &'a CancellationToken,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            let connection: Connection =
                state.require(CONNECTION).map_err(|err| HookError::Failed {
                    hook: name.to_owned(),
                    message: err.to_string(),
                })?;
            let ui = state.ui().ok();

            for command in &self.commands {
                if cancel.is_cancelled() {
                    return Err(HookError::Cancelled {
                        hook: name.to_owned(),
                    });
                }
                if let Some(ui) = &ui {
                    ui.say(&format!("Provisioning with shell: {command}"));
                }
                tracing::debug!(hook = name, command = command.as_str(), "running remote command");

                let output = self.run_one(name, &connection, command).await?;
                if let Some(ui) = &ui {
                    for line in output.stdout.lines() {
                        ui.message(line);
                    }
                }
                if !output.is_success() {
                    return Err(HookError::Failed {
                        hook: name.to_owned(),
                        message: format!(
                            "`{command}` exited with status {}: {}",
                            output.status_text(),
                            output.stderr.trim()
                        ),
                    });
                }
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for RemoteShellHook {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteShellHook")
            .field("commands", &self.commands)
            .field("env", &self.env)
            .field("ssh_bin", &self.ssh_bin)
            .finish_non_exhaustive()
    }
}
