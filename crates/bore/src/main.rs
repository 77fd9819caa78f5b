mod bore;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::bore::app::{Invocation, LocalArgs, Role, ServerArgs};

#[derive(Debug, Parser)]
#[command(
    name = "bore",
    version,
    about = "bore - expose a local TCP port through a remote relay"
)]
struct Cli {
    /// Path to a bore config file (.toml/.yaml/.yml). If omitted, uses BORE_CONFIG; then
    /// auto-detects bore.toml > bore.yaml > bore.yml in the working directory; then the
    /// per-user config directory. Without any file, built-in defaults apply.
    #[arg(long, global = true, env = "BORE_CONFIG")]
    config: Option<PathBuf>,

    /// Serve health, metrics and pending-connection diagnostics over HTTP on this address.
    #[arg(long, global = true, env = "BORE_DEBUG_ADDR")]
    debug_addr: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the remote relay server.
    Server {
        /// Minimum TCP port number a client may request.
        #[arg(long)]
        min_port: Option<u16>,

        /// Optional secret for authentication.
        #[arg(short, long, env = "BORE_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Interface for the control port and leased ports.
        #[arg(long)]
        bind_addr: Option<String>,

        /// Control port, shared by control and data connections.
        #[arg(long)]
        control_port: Option<u16>,
    },

    /// Start a local proxy to the remote server.
    Local {
        /// The local port to expose.
        local_port: u16,

        /// Address of the remote server to expose local ports to.
        #[arg(short, long)]
        to: String,

        /// Optional port on the remote server to select.
        #[arg(short, long, default_value_t = 0)]
        port: u16,

        /// Local host the exposed service listens on.
        #[arg(short = 'l', long)]
        local_host: Option<String>,

        /// Optional secret for authentication.
        #[arg(short, long, env = "BORE_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Control port on the remote server.
        #[arg(long)]
        control_port: Option<u16>,
    },
}

impl From<Cli> for Invocation {
    fn from(cli: Cli) -> Self {
        let role = match cli.command {
            Command::Server {
                min_port,
                secret,
                bind_addr,
                control_port,
            } => Role::Server(ServerArgs {
                min_port,
                secret,
                bind_addr,
                control_port,
            }),
            Command::Local {
                local_port,
                to,
                port,
                local_host,
                secret,
                control_port,
            } => Role::Local(LocalArgs {
                local_port,
                to,
                port,
                local_host,
                secret,
                control_port,
            }),
        };
        Invocation {
            config_path: cli.config,
            debug_addr: cli.debug_addr,
            role,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    bore::run(cli.into()).await
}
