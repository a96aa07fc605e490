//! Command-line interface definitions for the `kiln` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `kiln` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    about = "Build Scaleway machine images from a temporary build server",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Boot a build server, provision it and capture an image.
    #[command(name = "build", about = "Boot a build server, provision it and capture an image")]
    Build(BuildCommand),
}

/// Arguments for the `kiln build` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct BuildCommand {
    /// Name of the image to produce. Overrides `KILN_IMAGE_NAME`.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) name: Option<String>,
    /// Override the Scaleway instance type (commercial type) of the build
    /// server.
    #[arg(long, value_name = "TYPE")]
    pub(crate) instance_type: Option<String>,
    /// Override the label of the image the build server boots from.
    ///
    /// The label is resolved to the newest available image for the
    /// configured architecture and zone.
    #[arg(long, value_name = "LABEL")]
    pub(crate) image: Option<String>,
    /// Tag applied to the finished image. Repeat for several tags.
    #[arg(long = "tag", value_name = "TAG")]
    pub(crate) tags: Vec<String>,
    /// How the build server is reached: `ssh` or `none`.
    #[arg(long, value_name = "COMMUNICATOR")]
    pub(crate) communicator: Option<String>,
    /// Pause for confirmation after every step and every cleanup.
    #[arg(long)]
    pub(crate) debug: bool,
    /// Emit machine-readable events instead of human-readable output.
    #[arg(long)]
    pub(crate) machine_readable: bool,
    /// Shell command run on the build server during provisioning (use -- to
    /// separate flags).
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub(crate) provision: Vec<String>,
}
