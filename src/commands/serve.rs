use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::server::{Server, ServerConfig};

/// Run a single replication node until the process is interrupted.
///
/// The node listens on `listen`, materializes content under `root`, and
/// dials every address in `bootstrap` at startup (best effort). Values
/// stored by peers are held as opaque replicas under their owner's id.
pub async fn run(
    listen: SocketAddr,
    root: PathBuf,
    bootstrap: Vec<SocketAddr>,
) -> Result<(), Box<dyn Error>> {
    let config = ServerConfig {
        listen_addr: listen,
        storage_root: root,
        bootstrap_nodes: bootstrap,
        ..Default::default()
    };
    let server = Server::new(config);
    println!("node id: {}", server.id());

    server.start().await?;
    Ok(())
}
