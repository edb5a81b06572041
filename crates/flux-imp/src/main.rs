//! flux-imp - the independent minister of privilege.
//!
//! Setuid helper that lets an unprivileged scheduling daemon launch job
//! shells as arbitrary unprivileged users, provided the launch request
//! carries a cryptographically attested authorization token naming the
//! intended user. See the `imp-core` crate for the token format.
//!
//! The binary never continues past a security-relevant failure: fatal
//! paths log one line to stderr and exit nonzero.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cgroup;
mod error;
mod exec;
mod input;
#[cfg(feature = "pam")]
mod pam;
mod privsep;
mod signals;
mod user;

/// flux-imp - privileged job shell launcher
#[derive(Parser, Debug)]
#[command(name = "flux-imp")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a job shell as the user attested by the signed request
    Exec {
        /// Absolute path to the job shell
        shell_path: PathBuf,

        /// Arguments passed to the job shell
        #[arg(required = true, trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Print version and exit
    Version,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Version => {
            println!("flux-imp {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Commands::Exec { shell_path, args } => match exec::run(&shell_path, &args) {
            Ok(code) => code,
            Err(err) => {
                tracing::error!("exec: {err}");
                ExitCode::FAILURE
            }
        },
    }
}
