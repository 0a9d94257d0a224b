use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::error;
use tokio::io::AsyncReadExt;

use crate::server::{Server, ServerConfig};

/// Run the canonical replication scenario with three in-process nodes:
/// two seeds and one node bootstrapping to both. The third node stores a
/// value, deletes its local copy, then gets it back from the mesh.
pub async fn run(root: PathBuf) -> Result<(), Box<dyn Error>> {
    let n1 = spawn_node(node_config(&root, "node1", Vec::new())).await;
    let n2 = spawn_node(node_config(&root, "node2", Vec::new())).await;
    let seeds = vec![n1.listen_addr().unwrap(), n2.listen_addr().unwrap()];
    let n3 = spawn_node(node_config(&root, "node3", seeds)).await;

    // let the bootstrap connections form
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!(
        "mesh up: node3 sees {} peers, node1 sees {}, node2 sees {}",
        n3.peer_count(),
        n1.peer_count(),
        n2.peer_count()
    );

    let key = "picture_0.png";
    let payload = b"my big data file here!";
    n3.store(key, &mut &payload[..]).await?;
    println!("node3 stored {:?} ({} bytes) and replicated it", key, payload.len());

    // let the replicas settle, then drop the local copy
    tokio::time::sleep(Duration::from_millis(500)).await;
    n3.store_ref().delete(n3.id(), key).await?;
    println!("node3 deleted its local copy");

    let (size, mut file) = n3.get(key).await?;
    let mut retrieved = Vec::new();
    file.read_to_end(&mut retrieved).await?;
    println!(
        "node3 fetched {:?} back from the mesh: {} bytes, {:?}",
        key,
        size,
        String::from_utf8_lossy(&retrieved)
    );

    n1.stop();
    n2.stop();
    n3.stop();
    Ok(())
}

fn node_config(root: &Path, name: &str, bootstrap: Vec<SocketAddr>) -> ServerConfig {
    ServerConfig {
        storage_root: root.join(name),
        bootstrap_nodes: bootstrap,
        ..Default::default()
    }
}

async fn spawn_node(config: ServerConfig) -> Arc<Server> {
    let server = Arc::new(Server::new(config));
    let runner = server.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.start().await {
            error!("node terminated: {}", e);
        }
    });

    // the listen address appears once the transport is bound
    while server.listen_addr().is_none() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server
}
