use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard, Notify};

use crate::messages::{MSG_TAG, STREAM_TAG};
use crate::{Error, Result, MAX_MESSAGE_SIZE};

/// Per-connection validator run before the peer is handed to the owner.
/// An error drops the connection.
pub type HandshakeFn = Arc<dyn Fn(&Peer) -> Result<()> + Send + Sync>;
/// Hook invoked once a connection passed the handshake; typically inserts
/// the peer into the owner's peer set. An error drops the connection.
pub type OnPeerFn = Arc<dyn Fn(Arc<Peer>) -> Result<()> + Send + Sync>;
/// Hook invoked when a connection's read loop exits for any reason, so
/// the owner can remove the peer from its set.
pub type OnPeerClosedFn = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// A decoded inbound frame. Message frames carry the encoded payload;
/// stream frames carry none and only signal that the sending peer's next
/// bytes are an opaque body which some handler must consume.
#[derive(Debug)]
pub struct Frame {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
    pub stream: bool,
}

enum RawFrame {
    Message(Vec<u8>),
    Stream,
}

/// One live connection. The read half belongs to the connection's read
/// loop except while a stream body is pending, when the consuming handler
/// borrows it; the write half is shared behind a mutex so concurrent
/// senders never interleave bytes.
pub struct Peer {
    addr: SocketAddr,
    outbound: bool,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    // parks the read loop while a stream body is being consumed
    stream_gate: Notify,
    // true from stream-frame decode until close_stream
    stream_state: watch::Sender<bool>,
    closed: Notify,
}

impl Peer {
    fn new(addr: SocketAddr, outbound: bool, reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Self {
        let (stream_state, _) = watch::channel(false);
        Self {
            addr,
            outbound,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            stream_gate: Notify::new(),
            stream_state,
            closed: Notify::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Write `bytes` as one unit with respect to other senders.
    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Exclusive access to the raw write side, for multi-write sequences
    /// (tag, size, body) that must not interleave with other senders.
    pub async fn writer_lock(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Exclusive access to the raw read side. Only meaningful while this
    /// peer has a pending stream, i.e. while its read loop is parked.
    pub async fn reader_lock(&self) -> MutexGuard<'_, OwnedReadHalf> {
        self.reader.lock().await
    }

    /// Whether the read loop is parked on an unconsumed stream body.
    pub fn has_pending_stream(&self) -> bool {
        *self.stream_state.borrow()
    }

    /// Wait until the read loop has parked on a stream body, so the
    /// caller can borrow the reader without racing the frame decoder.
    pub async fn wait_for_stream(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.stream_state.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|pending| *pending)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(Error::StreamWait(self.addr)),
        };
        result
    }

    /// Signal that the pending stream body has been fully consumed,
    /// releasing the read loop to decode the next frame.
    pub fn close_stream(&self) {
        self.stream_state.send_replace(false);
        self.stream_gate.notify_one();
    }

    /// Tear the connection down; the read loop exits on its next
    /// scheduling point.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    fn begin_stream(&self) {
        self.stream_state.send_replace(true);
    }
}

/// Transport configuration. The handshake defaults to a no-op; hooks are
/// optional so the transport can be exercised standalone.
pub struct TransportConfig {
    pub listen_addr: SocketAddr,
    pub handshake: HandshakeFn,
    pub on_peer: Option<OnPeerFn>,
    pub on_peer_closed: Option<OnPeerClosedFn>,
}

impl TransportConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            handshake: Arc::new(|_| Ok(())),
            on_peer: None,
            on_peer_closed: None,
        }
    }
}

/// TCP transport: accepts and dials connections, runs one read loop per
/// connection, and delivers every decoded frame from every peer on a
/// single inbound queue in per-peer arrival order.
pub struct TcpTransport {
    config: TransportConfig,
    frames_tx: mpsc::Sender<Frame>,
    frames_rx: StdMutex<Option<mpsc::Receiver<Frame>>>,
    shutdown: watch::Sender<bool>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        let (frames_tx, frames_rx) = mpsc::channel(1024);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            frames_tx,
            frames_rx: StdMutex::new(Some(frames_rx)),
            shutdown,
            local_addr: StdMutex::new(None),
        })
    }

    /// Bind the listener and start accepting connections concurrently.
    /// Returns the bound address once listening (the configured address
    /// may use port 0).
    pub async fn listen_and_accept(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(local);
        info!("listening on {}", local);

        let transport = self.clone();
        tokio::spawn(async move {
            let mut shutdown = transport.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!("[{}] accepted inbound connection", addr);
                            tokio::spawn(transport.clone().handle_conn(stream, false));
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    },
                }
            }
            debug!("accept loop stopped");
        });

        Ok(local)
    }

    /// Initiate an outbound connection; the resulting peer is handled
    /// exactly like an accepted one.
    pub async fn dial(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let stream = TcpStream::connect(addr).await?;
        debug!("[{}] dialed outbound connection", addr);
        tokio::spawn(self.clone().handle_conn(stream, true));
        Ok(())
    }

    /// Take the single receiver of inbound frames. Yields once.
    pub fn consume(&self) -> Result<mpsc::Receiver<Frame>> {
        self.frames_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::Transport("inbound queue already taken"))
    }

    /// Address actually bound, once `listen_and_accept` has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Stop accepting and terminate every read loop, closing the
    /// connections.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, outbound: bool) {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("connection lost before setup: {}", e);
                return;
            }
        };
        let (read_half, write_half) = stream.into_split();
        let peer = Arc::new(Peer::new(addr, outbound, read_half, write_half));

        if let Err(e) = (self.config.handshake)(&peer) {
            warn!("[{}] handshake failed, dropping connection: {}", addr, e);
            return;
        }
        if let Some(on_peer) = &self.config.on_peer {
            if let Err(e) = on_peer(peer.clone()) {
                warn!("[{}] peer rejected, dropping connection: {}", addr, e);
                return;
            }
        }

        self.read_loop(&peer).await;

        if let Some(on_closed) = &self.config.on_peer_closed {
            on_closed(addr);
        }
        debug!("[{}] connection closed", addr);
    }

    async fn read_loop(&self, peer: &Arc<Peer>) {
        let addr = peer.addr();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let frame = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = peer.closed.notified() => break,
                decoded = Self::read_frame(peer) => match decoded {
                    Ok(frame) => frame,
                    Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        debug!("[{}] peer closed the connection", addr);
                        break;
                    }
                    Err(e) => {
                        warn!("[{}] read loop terminating: {}", addr, e);
                        break;
                    }
                },
            };

            match frame {
                RawFrame::Message(payload) => {
                    let frame = Frame {
                        from: addr,
                        payload,
                        stream: false,
                    };
                    if self.frames_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                RawFrame::Stream => {
                    peer.begin_stream();
                    let frame = Frame {
                        from: addr,
                        payload: Vec::new(),
                        stream: true,
                    };
                    if self.frames_tx.send(frame).await.is_err() {
                        break;
                    }
                    debug!("[{}] incoming stream, read loop paused", addr);
                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => break,
                        _ = peer.closed.notified() => break,
                        _ = peer.stream_gate.notified() => {}
                    }
                    debug!("[{}] stream consumed, read loop resumed", addr);
                }
            }
        }
    }

    // Decode one frame. The reader lock is released on return, before the
    // read loop parks on the stream gate, so stream consumers can borrow
    // the reader.
    async fn read_frame(peer: &Peer) -> Result<RawFrame> {
        let mut reader = peer.reader.lock().await;

        let tag = reader.read_u8().await?;
        match tag {
            MSG_TAG => {
                let len = reader.read_u32().await? as usize;
                if len > MAX_MESSAGE_SIZE {
                    return Err(Error::MessageTooLarge(len));
                }
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                Ok(RawFrame::Message(payload))
            }
            STREAM_TAG => Ok(RawFrame::Stream),
            other => Err(Error::UnknownFrameTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{encode_message, Message};

    fn announce(size: i64) -> Vec<u8> {
        encode_message(&Message::StoreAnnounce {
            owner: "aa".repeat(32),
            net_key: "bb".repeat(16),
            size,
        })
        .unwrap()
    }

    fn test_transport() -> (Arc<TcpTransport>, Arc<StdMutex<Vec<Arc<Peer>>>>) {
        let peers: Arc<StdMutex<Vec<Arc<Peer>>>> = Arc::new(StdMutex::new(Vec::new()));
        let hook_peers = peers.clone();
        let mut config = TransportConfig::new("127.0.0.1:0".parse().unwrap());
        config.on_peer = Some(Arc::new(move |peer| {
            hook_peers.lock().unwrap().push(peer);
            Ok(())
        }));
        (TcpTransport::new(config), peers)
    }

    #[tokio::test]
    async fn test_message_frames_are_delivered_in_order() {
        let (transport, _) = test_transport();
        let addr = transport.listen_and_accept().await.unwrap();
        let mut frames = transport.consume().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&announce(1)).await.unwrap();
        client.write_all(&announce(2)).await.unwrap();
        client.flush().await.unwrap();

        for expected in [1i64, 2] {
            let frame = frames.recv().await.unwrap();
            assert!(!frame.stream);
            match crate::messages::decode_message(&frame.payload).unwrap() {
                Message::StoreAnnounce { size, .. } => assert_eq!(size, expected),
                other => panic!("unexpected message {:?}", other),
            }
        }

        transport.close();
    }

    #[tokio::test]
    async fn test_stream_frame_pauses_decoding_until_released() {
        let (transport, peers) = test_transport();
        let addr = transport.listen_and_accept().await.unwrap();
        let mut frames = transport.consume().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let body = vec![0x5Au8; 1024];
        client.write_all(&announce(1024)).await.unwrap();
        client.write_all(&[STREAM_TAG]).await.unwrap();
        client.write_all(&body).await.unwrap();
        // a message behind the stream body must not surface early
        client.write_all(&announce(7)).await.unwrap();
        client.flush().await.unwrap();

        let first = frames.recv().await.unwrap();
        assert!(!first.stream);
        let second = frames.recv().await.unwrap();
        assert!(second.stream);

        // decoding is suspended while the stream body sits unconsumed
        let early = tokio::time::timeout(Duration::from_millis(200), frames.recv()).await;
        assert!(early.is_err(), "frame decoded past an unconsumed stream");

        let peer = peers.lock().unwrap()[0].clone();
        assert!(peer.has_pending_stream());
        {
            let mut reader = peer.reader_lock().await;
            let mut consumed = vec![0u8; 1024];
            reader.read_exact(&mut consumed).await.unwrap();
            assert_eq!(consumed, body);
        }
        peer.close_stream();

        let third = frames.recv().await.unwrap();
        assert!(!third.stream);
        match crate::messages::decode_message(&third.payload).unwrap() {
            Message::StoreAnnounce { size, .. } => assert_eq!(size, 7),
            other => panic!("unexpected message {:?}", other),
        }

        transport.close();
    }

    #[tokio::test]
    async fn test_unknown_tag_closes_the_connection() {
        // no hooks, so nothing keeps the peer alive once its loop exits
        let transport = TcpTransport::new(TransportConfig::new("127.0.0.1:0".parse().unwrap()));
        let addr = transport.listen_and_accept().await.unwrap();
        let _frames = transport.consume().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x03]).await.unwrap();
        client.flush().await.unwrap();

        // the read loop terminates and drops its halves; the client
        // observes EOF
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("connection should close promptly")
            .unwrap();
        assert_eq!(n, 0);

        transport.close();
    }

    #[tokio::test]
    async fn test_on_peer_closed_fires_after_disconnect() {
        let closed: Arc<StdMutex<Vec<SocketAddr>>> = Arc::new(StdMutex::new(Vec::new()));
        let hook_closed = closed.clone();

        let mut config = TransportConfig::new("127.0.0.1:0".parse().unwrap());
        config.on_peer_closed = Some(Arc::new(move |addr| {
            hook_closed.lock().unwrap().push(addr);
        }));
        let transport = TcpTransport::new(config);
        let addr = transport.listen_and_accept().await.unwrap();
        let _frames = transport.consume().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        drop(client);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(closed.lock().unwrap().as_slice(), &[client_addr]);

        transport.close();
    }
}
