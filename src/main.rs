//! The `forgegate` binary.
//!
//! Its only subcommand is `serv`, the login shell the external OpenSSH
//! daemon invokes through `command=` in the managed authorized_keys file.
//! The Git command line itself arrives via `SSH_ORIGINAL_COMMAND`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use forgegate::ssh::ServeShim;

#[derive(Parser, Debug)]
#[command(name = "forgegate", about = "Key-authenticated SSH gateway for Git hosting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Proxy-account shell: re-originate the connection to the in-process
    /// server.  Only meant to be invoked by the OpenSSH daemon.
    Serv {
        /// Address of the in-process SSH server.
        host: String,
        /// Private key matching the server's host key.
        internal_key_file: PathBuf,
        /// Verified fingerprint of the connecting user's key.
        fingerprint: String,
    },
}

#[tokio::main]
async fn main() {
    // stdout/stderr belong to the Git protocol; keep tracing quiet unless
    // explicitly raised via RUST_LOG.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serv {
            host,
            internal_key_file,
            fingerprint,
        } => {
            let command = std::env::var("SSH_ORIGINAL_COMMAND").unwrap_or_default();
            let shim = ServeShim {
                internal_key_file,
                fingerprint,
                host,
                command,
            };
            let code = shim
                .run(
                    &mut tokio::io::stdin(),
                    &mut tokio::io::stdout(),
                    &mut tokio::io::stderr(),
                )
                .await;
            std::process::exit(code as i32);
        }
    }
}
