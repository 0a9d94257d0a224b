use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use crate::bytes::{FanoutWriter, TeeReader};
use crate::cryptography::{generate_id, net_digest, new_encryption_key, encrypt_copy};
use crate::messages::{decode_message, encode_message, Message, STREAM_TAG};
use crate::networking::{HandshakeFn, Peer, TcpTransport, TransportConfig};
use crate::storage::{PathTransform, Store};
use crate::{Error, Result, KEY_SIZE, NONCE_SIZE};

// lag between the announce broadcast and the ciphertext stream, so every
// receiver's dispatch loop has parked on the announced stream
const ANNOUNCE_SETTLE: Duration = Duration::from_millis(5);
// window in which peers may respond to a broadcast fetch
const RETRIEVAL_WAIT: Duration = Duration::from_millis(500);
// bound on waiting for an announced stream to start arriving
const STREAM_START_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServerConfig {
    /// Hex-encoded 32-byte node identity.
    pub id: String,
    /// This node's private symmetric key; never leaves the process.
    pub enc_key: [u8; KEY_SIZE],
    pub listen_addr: SocketAddr,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    /// Remote addresses dialed (best effort) at startup.
    pub bootstrap_nodes: Vec<SocketAddr>,
    /// Optional per-connection validator; `None` accepts everyone.
    pub handshake: Option<HandshakeFn>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: generate_id(),
            enc_key: new_encryption_key(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            storage_root: PathBuf::from("driftstore_data"),
            path_transform: PathTransform::default(),
            bootstrap_nodes: Vec::new(),
            handshake: None,
        }
    }
}

/// One replication node: owns the peer set, persists values locally,
/// eagerly replicates them encrypted to every connected peer, and fetches
/// missing values by broadcasting a request and consuming the first
/// response.
pub struct Server {
    id: String,
    tag: String,
    enc_key: [u8; KEY_SIZE],
    bootstrap_nodes: Vec<SocketAddr>,
    store: Store,
    transport: Arc<TcpTransport>,
    peers: Arc<RwLock<HashMap<SocketAddr, Arc<Peer>>>>,
    quit: watch::Sender<bool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let peers: Arc<RwLock<HashMap<SocketAddr, Arc<Peer>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let tag = short(&config.id).to_string();

        let mut transport_config = TransportConfig::new(config.listen_addr);
        if let Some(handshake) = config.handshake {
            transport_config.handshake = handshake;
        }
        let hook_peers = peers.clone();
        let hook_tag = tag.clone();
        transport_config.on_peer = Some(Arc::new(move |peer: Arc<Peer>| {
            let direction = if peer.is_outbound() { "outbound" } else { "inbound" };
            info!("[{}] connected with remote {} ({})", hook_tag, peer.addr(), direction);
            hook_peers.write().unwrap().insert(peer.addr(), peer);
            Ok(())
        }));
        let closed_peers = peers.clone();
        let closed_tag = tag.clone();
        transport_config.on_peer_closed = Some(Arc::new(move |addr| {
            if closed_peers.write().unwrap().remove(&addr).is_some() {
                info!("[{}] peer {} removed", closed_tag, addr);
            }
        }));

        let (quit, _) = watch::channel(false);
        Self {
            id: config.id,
            tag,
            enc_key: config.enc_key,
            bootstrap_nodes: config.bootstrap_nodes,
            store: Store::new(config.storage_root, config.path_transform),
            transport: TcpTransport::new(transport_config),
            peers,
            quit,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address the transport is bound to, once `start` is listening.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn store_ref(&self) -> &Store {
        &self.store
    }

    /// Listen, dial the bootstrap nodes, then dispatch inbound frames
    /// until `stop` is called or the transport goes away.
    pub async fn start(&self) -> Result<()> {
        let addr = self.transport.listen_and_accept().await?;
        info!("[{}] node up on {}", self.tag, addr);

        for addr in &self.bootstrap_nodes {
            let addr = *addr;
            let transport = self.transport.clone();
            let tag = self.tag.clone();
            info!("[{}] attempting to connect with remote {}", tag, addr);
            tokio::spawn(async move {
                if let Err(e) = transport.dial(addr).await {
                    warn!("[{}] dial {} failed: {}", tag, addr, e);
                }
            });
        }

        self.dispatch().await
    }

    /// Ask the dispatch loop to shut the node down.
    pub fn stop(&self) {
        self.quit.send_replace(true);
    }

    async fn dispatch(&self) -> Result<()> {
        let mut frames = self.transport.consume()?;
        let mut quit = self.quit.subscribe();

        loop {
            tokio::select! {
                _ = async { while !*quit.borrow() { if quit.changed().await.is_err() { break; } } } => {
                    info!("[{}] stopping", self.tag);
                    self.transport.close();
                    return Ok(());
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else { return Ok(()) };
                    // stream markers carry no message; the body is taken
                    // by whichever handler is expecting it
                    if frame.stream {
                        continue;
                    }
                    let msg = match decode_message(&frame.payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("[{}] undecodable message from {}: {}", self.tag, frame.from, e);
                            self.drop_peer(frame.from);
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_message(frame.from, msg).await {
                        warn!("[{}] handling frame from {} failed: {}", self.tag, frame.from, e);
                        self.drop_peer(frame.from);
                    }
                }
            }
        }
    }

    /// Persist (key, data) locally in plaintext and replicate an
    /// encrypted copy to every connected peer.
    pub async fn store<R>(&self, key: &str, data: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        // single pass: to disk and into the replication buffer
        let mut tee = TeeReader::new(data);
        let size = self.store.write(&self.id, key, &mut tee).await?;
        let buffer = tee.into_copied();
        info!("[{}] stored {} bytes for key {:?}", self.tag, size, key);

        let mut peers = self.peer_snapshot();
        if peers.is_empty() {
            return Ok(());
        }
        // stable lock order across concurrent store calls
        peers.sort_by_key(|peer| peer.addr());

        let announce = encode_message(&Message::StoreAnnounce {
            owner: self.id.clone(),
            net_key: net_digest(key),
            size: size as i64 + NONCE_SIZE as i64,
        })?;

        // hold every writer across the (announce, stream) pair so nothing
        // else interleaves on these connections
        let mut guards = Vec::with_capacity(peers.len());
        for peer in &peers {
            guards.push(peer.writer_lock().await);
        }
        for (peer, guard) in peers.iter().zip(guards.iter_mut()) {
            if let Err(e) = guard.write_all(&announce).await {
                warn!("[{}] announce to {} failed: {}", self.tag, peer.addr(), e);
            }
        }

        tokio::time::sleep(ANNOUNCE_SETTLE).await;

        let sinks: Vec<_> = guards.iter_mut().map(|guard| &mut **guard).collect();
        let mut fan = FanoutWriter::new(sinks);
        fan.write_all(&[STREAM_TAG]).await?;
        let sent = encrypt_copy(&self.enc_key, &mut &buffer[..], &mut fan).await?;
        debug!(
            "[{}] replicated {} bytes to {} of {} peers",
            self.tag,
            sent,
            fan.live_count(),
            peers.len()
        );
        Ok(())
    }

    /// Return (size, reader) for the value under `key`, fetching it from
    /// the peer set if it is not held locally.
    pub async fn get(&self, key: &str) -> Result<(u64, tokio::fs::File)> {
        if self.store.has(&self.id, key) {
            info!("[{}] serving {:?} from local storage", self.tag, key);
            return self.store.read(&self.id, key).await;
        }

        info!("[{}] {:?} not found locally, fetching from the network", self.tag, key);
        self.broadcast(&Message::GetRequest {
            owner: self.id.clone(),
            net_key: net_digest(key),
        })
        .await?;

        tokio::time::sleep(RETRIEVAL_WAIT).await;

        let mut fetched = false;
        for peer in self.peer_snapshot() {
            if !peer.has_pending_stream() {
                continue;
            }
            match self.consume_response(&peer, key, fetched).await {
                Ok(received) => fetched = fetched || received,
                Err(e) => {
                    warn!("[{}] response from {} failed: {}", self.tag, peer.addr(), e);
                    peer.close();
                }
            }
        }

        if !fetched {
            return Err(Error::NotFound(key.to_string()));
        }
        self.store.read(&self.id, key).await
    }

    // Read one fetch response from a peer whose read loop is parked on a
    // pending stream. The first response is decrypted into local storage;
    // later ones are drained and discarded so their connections stay
    // correctly framed.
    async fn consume_response(&self, peer: &Arc<Peer>, key: &str, already_fetched: bool) -> Result<bool> {
        let mut reader = peer.reader_lock().await;
        let file_size = reader.read_i64_le().await?;
        if file_size < 0 {
            return Err(Error::Protocol("negative response size"));
        }

        let mut body = (&mut *reader).take(file_size as u64);
        let received = if already_fetched {
            tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            false
        } else {
            let written = self
                .store
                .write_decrypt(&self.enc_key, &self.id, key, &mut body)
                .await?;
            debug!("[{}] received {} bytes over the network from {}", self.tag, written, peer.addr());
            true
        };
        if body.limit() > 0 {
            return Err(Error::StreamTruncated {
                expected: file_size as u64,
                got: file_size as u64 - body.limit(),
            });
        }

        drop(reader);
        peer.close_stream();
        Ok(received)
    }

    async fn handle_message(&self, from: SocketAddr, msg: Message) -> Result<()> {
        match msg {
            Message::StoreAnnounce { owner, net_key, size } => {
                self.handle_store_announce(from, owner, net_key, size).await
            }
            Message::GetRequest { owner, net_key } => {
                self.handle_get_request(from, owner, net_key).await
            }
        }
    }

    // A peer is about to stream `size` bytes of ciphertext it wants us to
    // hold. Persist them verbatim: without the owner's key the replica is
    // opaque, and returning the exact bytes later is the whole contract.
    async fn handle_store_announce(
        &self,
        from: SocketAddr,
        owner: String,
        net_key: String,
        size: i64,
    ) -> Result<()> {
        if size < 0 {
            return Err(Error::Protocol("negative announced size"));
        }
        let peer = self.peer(from).ok_or(Error::UnknownPeer(from))?;

        peer.wait_for_stream(STREAM_START_TIMEOUT).await?;
        let mut reader = peer.reader_lock().await;
        let mut body = (&mut *reader).take(size as u64);
        let written = self.store.write(&owner, &net_key, &mut body).await?;
        if written < size as u64 {
            return Err(Error::StreamTruncated {
                expected: size as u64,
                got: written,
            });
        }
        drop(reader);
        peer.close_stream();

        info!(
            "[{}] holding {} replica bytes of {} for owner {}",
            self.tag,
            written,
            net_key,
            short(&owner)
        );
        Ok(())
    }

    // A peer is looking for a value. Stay silent unless we hold it;
    // otherwise stream the stored bytes back, ciphertext or not.
    async fn handle_get_request(&self, from: SocketAddr, owner: String, net_key: String) -> Result<()> {
        if !self.store.has(&owner, &net_key) {
            debug!("[{}] no copy of {} for {}, staying silent", self.tag, net_key, from);
            return Ok(());
        }

        let (size, mut file) = self.store.read(&owner, &net_key).await?;
        let peer = self.peer(from).ok_or(Error::UnknownPeer(from))?;

        let mut writer = peer.writer_lock().await;
        writer.write_u8(STREAM_TAG).await?;
        writer.write_i64_le(size as i64).await?;
        let sent = tokio::io::copy(&mut file, &mut *writer).await?;
        writer.flush().await?;

        info!("[{}] served {} bytes of {} to {}", self.tag, sent, net_key, from);
        Ok(())
    }

    async fn broadcast(&self, msg: &Message) -> Result<()> {
        let frame = encode_message(msg)?;
        for peer in self.peer_snapshot() {
            if let Err(e) = peer.send(&frame).await {
                warn!("[{}] broadcast to {} failed: {}", self.tag, peer.addr(), e);
            }
        }
        Ok(())
    }

    fn peer(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(&addr).cloned()
    }

    fn peer_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    fn drop_peer(&self, addr: SocketAddr) {
        if let Some(peer) = self.peer(addr) {
            peer.close();
        }
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_self_contained() {
        let config = ServerConfig::default();
        assert_eq!(config.id.len(), 64);
        assert_eq!(config.listen_addr.port(), 0);
        assert!(config.bootstrap_nodes.is_empty());
    }

    #[test]
    fn test_distinct_defaults_per_node() {
        let a = ServerConfig::default();
        let b = ServerConfig::default();
        assert_ne!(a.id, b.id);
        assert_ne!(a.enc_key, b.enc_key);
    }
}
