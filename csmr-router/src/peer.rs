//! TCP bridge between routers.
//!
//! A [`PeerLink`] is an endpoint that ships events to a remote router as
//! `Publish` frames and waits for the matching `Ack`. A [`RouterServer`]
//! accepts those connections and republishes what it receives on its local
//! router. Frames sent by a peer link carry the `RELAYED` flag, and the
//! server never forwards relayed events again, so an event crosses at most
//! one hop. Frames without the flag (external producers) are forwarded like
//! local publishes.

use crate::endpoint::{Delivery, Endpoint};
use crate::error::{DeliveryError, RouterError};
use crate::router::EventRouter;
use async_trait::async_trait;
use csmr_protocol::{Codec, ErrorCode, FrameDecoder, FrameFlags, JsonCodec, Message, ProtocolError, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

/// Read buffer size for peer sockets (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Peer link configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Remote router address (`host:port`).
    pub addr: String,
    /// Node id announced in the handshake.
    pub node_id: String,
    pub connect_timeout: Duration,
    /// How long to wait for the acknowledgement of one publish.
    pub ack_timeout: Duration,
}

impl PeerConfig {
    pub fn new(addr: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            node_id: node_id.into(),
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

struct PeerConnection {
    stream: TcpStream,
    decoder: FrameDecoder,
    codec: Arc<dyn Codec>,
}

impl PeerConnection {
    fn new(stream: TcpStream, codec: Arc<dyn Codec>) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(codec.clone()),
            codec,
        }
    }

    async fn send(&mut self, message: &Message, flags: FrameFlags) -> Result<(), ProtocolError> {
        let frame = self.codec.encode_frame(message, flags)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<(FrameFlags, Message), ProtocolError> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(decoded) = self.decoder.decode_message()? {
                return Ok(decoded);
            }
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
            self.decoder.extend(&buf[..n]);
        }
    }
}

/// Endpoint forwarding events to a remote router.
///
/// Connects lazily and reconnects after any transport error; the inbox's
/// retry policy decides how often that happens.
pub struct PeerLink {
    config: PeerConfig,
    codec: Arc<dyn Codec>,
    connection: Mutex<Option<PeerConnection>>,
}

impl PeerLink {
    pub fn new(config: PeerConfig) -> Self {
        Self {
            config,
            codec: Arc::new(JsonCodec),
            connection: Mutex::new(None),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    async fn connect(&self) -> Result<PeerConnection, DeliveryError> {
        tracing::debug!("connecting to peer {}", self.config.addr);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.config.addr))
            .await
            .map_err(|_| DeliveryError::Timeout)??;
        stream.set_nodelay(true)?;

        let mut conn = PeerConnection::new(stream, self.codec.clone());
        conn.send(&Message::hello(self.config.node_id.clone()), FrameFlags::new().with_crc())
            .await?;

        let reply = tokio::time::timeout(self.config.ack_timeout, conn.recv())
            .await
            .map_err(|_| DeliveryError::Timeout)??;
        match reply {
            (_, Message::Hello { node_id, .. }) => {
                tracing::info!("connected to peer {} ({})", node_id, self.config.addr);
                Ok(conn)
            }
            (_, Message::Nack { code, message, .. }) => Err(DeliveryError::Rejected { code, message }),
            (_, other) => Err(DeliveryError::Unavailable(format!(
                "unexpected {} during handshake",
                other.kind()
            ))),
        }
    }

    async fn exchange(&self, conn: &mut PeerConnection, delivery: &Delivery) -> Result<(), DeliveryError> {
        let message = Message::Publish {
            inbox_sequence: delivery.inbox_sequence,
            scope: delivery.scope.clone(),
            event: delivery.event.clone(),
        };
        conn.send(&message, FrameFlags::new().with_crc().with_relayed()).await?;

        let deadline = tokio::time::Instant::now() + self.config.ack_timeout;
        loop {
            let reply = tokio::time::timeout_at(deadline, conn.recv())
                .await
                .map_err(|_| DeliveryError::Timeout)??;
            match reply {
                (_, Message::Ack { inbox_sequence }) if inbox_sequence == delivery.inbox_sequence => return Ok(()),
                (_, Message::Nack {
                    inbox_sequence,
                    code,
                    message,
                }) if inbox_sequence == delivery.inbox_sequence => {
                    return Err(DeliveryError::Rejected { code, message })
                }
                // Late answers to an attempt that already timed out.
                (_, Message::Ack { .. }) | (_, Message::Nack { .. }) => continue,
                (_, other) => {
                    return Err(DeliveryError::Unavailable(format!("unexpected {} from peer", other.kind())))
                }
            }
        }
    }
}

#[async_trait]
impl Endpoint for PeerLink {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), DeliveryError> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(DeliveryError::Unavailable("not connected".into()));
        };

        let result = self.exchange(conn, delivery).await;
        if let Err(err) = &result {
            if !matches!(err, DeliveryError::Rejected { .. }) {
                tracing::debug!("dropping connection to {}: {}", self.config.addr, err);
                *guard = None;
            }
        }
        result
    }

    fn describe(&self) -> String {
        format!("peer:{}", self.config.addr)
    }
}

/// Router server configuration.
#[derive(Debug, Clone)]
pub struct RouterServerConfig {
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    pub max_connections: usize,
}

impl Default for RouterServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], csmr_protocol::DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 256,
        }
    }
}

impl RouterServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub publishes_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Accepts peer connections and republishes their events locally.
pub struct RouterServer {
    config: RouterServerConfig,
    router: Arc<EventRouter>,
    listener: TcpListener,
    codec: Arc<dyn Codec>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl RouterServer {
    /// Binds the listening socket.
    pub async fn bind(config: RouterServerConfig, router: Arc<EventRouter>) -> Result<Self, RouterError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            config,
            router,
            listener,
            codec: Arc::new(JsonCodec),
            stats: Arc::new(ServerStats::default()),
            shutdown,
            running: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RouterError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signals the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<(), RouterError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("router listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let router = self.router.clone();
                            let codec = self.codec.clone();
                            let stats = self.stats.clone();
                            let idle_timeout = self.config.idle_timeout;
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = handle_connection(
                                    stream,
                                    addr,
                                    router,
                                    codec,
                                    stats.clone(),
                                    idle_timeout,
                                    &mut conn_shutdown,
                                )
                                .await;
                                if let Err(e) = result {
                                    tracing::debug!("peer connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }
                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::debug!("peer disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("router server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<EventRouter>,
    codec: Arc<dyn Codec>,
    stats: Arc<ServerStats>,
    idle_timeout: Duration,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), RouterError> {
    stream.set_nodelay(true)?;
    let mut conn = PeerConnection::new(stream, codec);
    let mut greeted = false;

    loop {
        let received = tokio::select! {
            result = tokio::time::timeout(idle_timeout, conn.recv()) => result,
            _ = shutdown.recv() => return Ok(()),
        };
        let (flags, message) = match received {
            Ok(Ok(decoded)) => decoded,
            Ok(Err(ProtocolError::ConnectionClosed)) => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::debug!("[{}] idle timeout", addr);
                return Ok(());
            }
        };

        let reply = match message {
            Message::Hello { node_id, version } => {
                if version != PROTOCOL_VERSION {
                    let nack = Message::Nack {
                        inbox_sequence: 0,
                        code: ErrorCode::UnsupportedProtocol,
                        message: format!("protocol version {} not supported", version),
                    };
                    conn.send(&nack, FrameFlags::new().with_crc()).await?;
                    return Ok(());
                }
                tracing::info!("[{}] peer {} connected", addr, node_id);
                greeted = true;
                Message::hello(router.node_id().to_string())
            }
            Message::Publish {
                inbox_sequence,
                scope,
                event,
            } if greeted => {
                stats.publishes_total.fetch_add(1, Ordering::Relaxed);
                match router.route(event, scope, !flags.is_relayed()) {
                    Ok(_) => Message::Ack { inbox_sequence },
                    Err(err) => Message::Nack {
                        inbox_sequence,
                        code: err.wire_code(),
                        message: err.to_string(),
                    },
                }
            }
            Message::Publish { inbox_sequence, .. } => Message::Nack {
                inbox_sequence,
                code: ErrorCode::BadRequest,
                message: "hello required before publish".to_string(),
            },
            other => Message::Nack {
                inbox_sequence: 0,
                code: ErrorCode::BadRequest,
                message: format!("unexpected {}", other.kind()),
            },
        };
        conn.send(&reply, FrameFlags::new().with_crc()).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MailboxEndpoint;
    use crate::inbox::RetryPolicy;
    use crate::router::RouterConfig;
    use csmr_protocol::{TargetScope, WireEvent};
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn router(node: &str) -> Arc<EventRouter> {
        Arc::new(EventRouter::new(RouterConfig::new(node).with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        })))
    }

    async fn start_server(router: Arc<EventRouter>) -> (Arc<RouterServer>, SocketAddr) {
        let config = RouterServerConfig::new("127.0.0.1:0".parse().unwrap());
        let server = Arc::new(RouterServer::bind(config, router).await.unwrap());
        let addr = server.local_addr().unwrap();
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        (server, addr)
    }

    async fn recv(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("mailbox closed")
    }

    #[tokio::test]
    async fn test_events_cross_routers_in_order() {
        let node_a = router("a");
        let node_b = router("b");
        let (server, addr) = start_server(node_b.clone()).await;

        let (endpoint, mut b_rx) = MailboxEndpoint::channel("B", 16);
        node_b.attach("B", Arc::new(endpoint), None);
        node_b.subscribe("B", "ping").unwrap();

        node_a.add_peer(&addr.to_string(), Arc::new(PeerLink::new(PeerConfig::new(addr.to_string(), "a"))));

        let a = node_a.publisher("A", 0);
        for _ in 0..3 {
            a.publish("ping", Value::Null, TargetScope::Subscribers);
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let delivery = recv(&mut b_rx).await;
            assert_eq!(delivery.event.source_instance_id, "A");
            seen.push(delivery.event.sequence_number);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(server.stats().publishes_total.load(Ordering::Relaxed), 3);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_relayed_events_are_not_forwarded_again() {
        let node_a = router("a");
        let node_b = router("b");
        let (server, addr) = start_server(node_b.clone()).await;

        let (endpoint, mut b_rx) = MailboxEndpoint::channel("B", 16);
        node_b.attach("B", Arc::new(endpoint), None);
        node_b.subscribe("B", "ping").unwrap();
        let (onward, _onward_rx) = MailboxEndpoint::channel("c", 16);
        node_b.add_peer("c", Arc::new(onward));

        node_a.add_peer("b", Arc::new(PeerLink::new(PeerConfig::new(addr.to_string(), "a"))));
        node_a.publish(WireEvent::new("ping", "A", 1), TargetScope::Subscribers);

        recv(&mut b_rx).await;
        assert_eq!(node_b.stats().forwarded.load(Ordering::Relaxed), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_remote_instance_fails_without_retry() {
        let node_a = router("a");
        let node_b = router("b");
        let (server, addr) = start_server(node_b.clone()).await;

        let mut failures = node_a.delivery_failures();
        node_a.add_peer("b", Arc::new(PeerLink::new(PeerConfig::new(addr.to_string(), "a"))));
        node_a.publish(WireEvent::new("wake", "A", 1), TargetScope::instance("ghost"));

        let failure = tokio::time::timeout(Duration::from_secs(5), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.target, "peer:b");
        assert_eq!(failure.attempts, 1);
        assert!(failure.error.contains("UNKNOWN_INSTANCE"));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_external_producer_frames() {
        let node_b = router("b");
        let (server, addr) = start_server(node_b.clone()).await;
        let (endpoint, mut b_rx) = MailboxEndpoint::channel("B", 16);
        node_b.attach("B", Arc::new(endpoint), None);

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = PeerConnection::new(stream, Arc::new(JsonCodec));
        let flags = FrameFlags::new().with_crc();

        // Publishing before the handshake is refused.
        conn.send(
            &Message::Publish {
                inbox_sequence: 1,
                scope: TargetScope::instance("B"),
                event: WireEvent::new("wake", "ext", 1),
            },
            flags,
        )
        .await
        .unwrap();
        let (_, reply) = conn.recv().await.unwrap();
        assert!(matches!(reply, Message::Nack { code: ErrorCode::BadRequest, .. }));

        conn.send(&Message::hello("ext"), flags).await.unwrap();
        let (_, reply) = conn.recv().await.unwrap();
        assert!(matches!(reply, Message::Hello { ref node_id, .. } if node_id == "b"));

        conn.send(
            &Message::Publish {
                inbox_sequence: 2,
                scope: TargetScope::instance("B"),
                event: WireEvent::new("wake", "ext", 1),
            },
            flags,
        )
        .await
        .unwrap();
        let (_, reply) = conn.recv().await.unwrap();
        assert_eq!(reply, Message::Ack { inbox_sequence: 2 });
        assert_eq!(recv(&mut b_rx).await.event.name, "wake");
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_unavailable() {
        let link = PeerLink::new(
            PeerConfig::new("127.0.0.1:1", "a").with_connect_timeout(Duration::from_millis(200)),
        );
        let delivery = Delivery {
            inbox_sequence: 1,
            scope: TargetScope::Subscribers,
            event: WireEvent::new("ping", "A", 1),
        };
        let err = link.deliver(&delivery).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(link.describe(), "peer:127.0.0.1:1");
    }
}
