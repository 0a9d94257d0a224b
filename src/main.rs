use clap::{Parser, Subcommand};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "driftstore")]
#[command(about = "Peer-to-peer content-addressed file replication", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a replication node
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        listen: SocketAddr,
        /// Directory content is materialized under
        #[arg(short, long, default_value = "driftstore_data")]
        root: PathBuf,
        /// Peer addresses to dial at startup (repeatable)
        #[arg(short, long)]
        bootstrap: Vec<SocketAddr>,
    },
    /// Run a three-node replication demonstration in one process
    Demo {
        /// Directory the demo nodes store under
        #[arg(short, long, default_value = "driftstore_demo")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve { listen, root, bootstrap } => {
            driftstore::commands::serve::run(listen, root, bootstrap).await?;
        }
        Commands::Demo { root } => {
            driftstore::commands::demo::run(root).await?;
        }
    }

    Ok(())
}
