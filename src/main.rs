//! Binary entry point for the Kiln CLI.

use std::env;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kiln::hook::HOOK_PROVISION;
use kiln::test_support::FakeDriver;
use kiln::{
    Artifact, BasicUi, BuildConfig, BuildError, BuildSettings, ConfigError, DispatchHook, Driver,
    ImageBuild, MachineReadableUi, PrefixedUi, RemoteShellHook, ScalewayConfig, ScalewayDriver,
    ScalewayDriverError, Ui,
};

mod cli;

use cli::{BuildCommand, Cli};

const LOG_ENV: &str = "KILN_LOG";
const FAKE_DRIVER_ENV: &str = "KILN_FAKE_DRIVER";
const MACHINE_READABLE_TARGET: &str = "kiln";
const EXIT_FAILURE: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("driver error: {0}")]
    Driver(#[from] ScalewayDriverError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("invalid provision command: {0}")]
    InvalidCommand(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            EXIT_FAILURE
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Build(command) => build_command(command).await,
    }
}

async fn build_command(args: BuildCommand) -> Result<i32, CliError> {
    validate_command_args(&args.provision)?;

    let mut scaleway = ScalewayConfig::load_without_cli_args()?;
    let mut build = BuildConfig::load_without_cli_args()?;
    apply_overrides(&args, &mut scaleway, &mut build);
    let settings = BuildSettings::from_config(&scaleway, &build)?;

    let driver: Arc<dyn Driver> = if fake_driver_requested() {
        tracing::warn!("using the in-memory fake driver");
        Arc::new(FakeDriver::new())
    } else {
        Arc::new(ScalewayDriver::new(&scaleway)?)
    };
    let ui: Arc<dyn Ui> = if args.machine_readable {
        Arc::new(MachineReadableUi::new(MACHINE_READABLE_TARGET, io::stdout()))
    } else {
        Arc::new(PrefixedUi::new(
            settings.image.name.clone(),
            Arc::new(BasicUi::stdio()),
        ))
    };

    let mut image_build = ImageBuild::new(settings, driver, ui).with_debug(args.debug);
    if !args.provision.is_empty() {
        let shell = RemoteShellHook::new(vec![render_remote_command(&args.provision)]);
        let hook = DispatchHook::new().register(HOOK_PROVISION, Arc::new(shell));
        image_build = image_build.with_hook(Arc::new(hook));
    }

    let cancel = CancellationToken::new();
    let listener = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling build");
            listener.cancel();
        }
    });

    exit_code(image_build.run(&cancel).await)
}

fn apply_overrides(args: &BuildCommand, scaleway: &mut ScalewayConfig, build: &mut BuildConfig) {
    if let Some(instance_type) = &args.instance_type {
        scaleway.default_instance_type.clone_from(instance_type);
    }
    if let Some(image) = &args.image {
        scaleway.default_image.clone_from(image);
    }
    if let Some(name) = &args.name {
        build.image_name = Some(name.clone());
    }
    if !args.tags.is_empty() {
        build.image_tags = Some(args.tags.join(","));
    }
    if let Some(communicator) = &args.communicator {
        build.communicator.clone_from(communicator);
    }
}

fn fake_driver_requested() -> bool {
    env::var(FAKE_DRIVER_ENV).is_ok_and(|value| value.trim() == "1")
}

fn exit_code(result: Result<Artifact, BuildError>) -> Result<i32, CliError> {
    match result {
        Ok(_) => Ok(0),
        Err(BuildError::Cancelled) => Ok(EXIT_CANCELLED),
        Err(err) => Err(err.into()),
    }
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    if args.iter().any(|arg| arg.chars().any(char::is_control)) {
        return Err(CliError::InvalidCommand(String::from(concat!(
            "command arguments must not contain control characters (ASCII ",
            "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
        ))));
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
