mod netroxy;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "netroxy",
    version,
    about = "Netroxy - expose local TCP services through a public server"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept client control connections and open the ports they map.
    Server {
        /// Path to the server config (.toml/.yaml/.yml/.json). If omitted, uses NETROXY_SERVER_CONFIG; then looks for netroxy-server.* in CWD.
        #[arg(long, env = "NETROXY_SERVER_CONFIG")]
        config: Option<std::path::PathBuf>,
    },
    /// Connect to a server and forward its tunnel requests to local services.
    Client {
        /// Path to the client config (.toml/.yaml/.yml/.json). If omitted, uses NETROXY_CLIENT_CONFIG; then looks for netroxy-client.* in CWD.
        #[arg(long, env = "NETROXY_CLIENT_CONFIG")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server { config } => netroxy::app::run_server(config).await,
        Command::Client { config } => netroxy::app::run_client(config).await,
    }
}
