//! UDP connection pool with source-port rotation.
//!
//! All sockets in one generation share a single local port on platforms
//! with `SO_REUSEPORT`, so reads run in parallel across descriptors
//! without multiplying the visible source port. Every rotation interval
//! the whole generation is replaced: new traffic immediately uses fresh
//! sockets (and typically a fresh ephemeral port) while the old ones
//! stay readable for a grace period, which narrows the window in which
//! an off-path attacker could predict source port + transaction ID.

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stub_resolve_domain::{ResolveError, ResolverConfig};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fixed length of the DNS wire header.
const DNS_HEADER_LEN: usize = 12;

/// Receive buffer size; the largest message commonly advertised via EDNS(0).
const MAX_UDP_PAYLOAD: usize = 4096;

/// Write deadline for a single outbound datagram.
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
const PORT_SHARING: bool = true;
#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
const PORT_SHARING: bool = false;

/// A decoded inbound message paired with its source address.
#[derive(Debug)]
pub struct ResponseEnvelope {
    pub message: Message,
    pub source: SocketAddr,
}

struct SocketHandle {
    socket: Arc<UdpSocket>,
    done: CancellationToken,
}

struct PoolInner {
    /// `None` once the pool is closed; no further sockets are created.
    sockets: Option<Vec<SocketHandle>>,
    next_write: usize,
}

/// Pool of UDP sockets used to send queries and receive responses.
///
/// Decoded responses from every socket's read loop land on the shared
/// unbounded queue handed to [`ConnectionPool::new`]. The pool must be
/// shut down with [`ConnectionPool::close`]; the rotation task keeps it
/// alive until then.
pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    shutdown: CancellationToken,
    responses: mpsc::UnboundedSender<ResponseEnvelope>,
    size: usize,
    bind_address: SocketAddr,
    rotation_interval: Duration,
    grace_period: Duration,
}

impl ConnectionPool {
    /// Creates the pool with `config.pool_size` sockets and starts the
    /// rotation task.
    ///
    /// If any socket fails to bind, every already-created socket is
    /// closed and the whole construction fails.
    pub async fn new(
        config: &ResolverConfig,
        responses: mpsc::UnboundedSender<ResponseEnvelope>,
    ) -> Result<Arc<Self>, ResolveError> {
        let bind_address: SocketAddr = config.bind_address.parse().map_err(|e| {
            ResolveError::PoolConstruction(format!(
                "invalid bind address '{}': {}",
                config.bind_address, e
            ))
        })?;

        let pool = Arc::new(Self {
            inner: Mutex::new(PoolInner {
                sockets: Some(Vec::new()),
                next_write: 0,
            }),
            shutdown: CancellationToken::new(),
            responses,
            size: config.pool_size.max(1),
            bind_address,
            rotation_interval: config.rotation_interval(),
            grace_period: config.grace_period(),
        });

        let constructed = {
            let mut guard = pool.inner.lock();
            let inner = &mut *guard;
            let mut result = Ok(());
            for _ in 0..pool.size {
                if let Err(e) = pool.add(inner) {
                    result = Err(e);
                    break;
                }
            }
            result
        };
        if let Err(e) = constructed {
            pool.close();
            return Err(ResolveError::PoolConstruction(e.to_string()));
        }

        info!(
            sockets = pool.size,
            port_sharing = PORT_SHARING,
            "connection pool ready"
        );

        let rotation = Arc::clone(&pool);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(rotation.rotation_interval);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = rotation.shutdown.cancelled() => break,
                    _ = ticker.tick() => rotation.rotate(),
                }
            }
        });

        Ok(pool)
    }

    /// Binds one more socket, appends it to the current generation, and
    /// starts its read loop. Caller holds the pool lock.
    fn add(&self, inner: &mut PoolInner) -> Result<(), ResolveError> {
        let sockets = inner
            .sockets
            .as_mut()
            .ok_or(ResolveError::NoConnectionAvailable)?;

        // Within one generation every socket binds the first socket's
        // local address, sharing its port across descriptors.
        let shared = if PORT_SHARING {
            sockets.first().and_then(|h| h.socket.local_addr().ok())
        } else {
            None
        };

        let socket = bind_socket(self.bind_address, shared)
            .map_err(|e| ResolveError::Socket(e.to_string()))?;
        let handle = SocketHandle {
            socket: Arc::new(socket),
            done: CancellationToken::new(),
        };

        spawn_read_loop(
            Arc::clone(&handle.socket),
            handle.done.clone(),
            self.responses.clone(),
        );
        sockets.push(handle);
        Ok(())
    }

    /// Returns the socket at the round-robin cursor and advances it, or
    /// `None` when the pool is closed or empty. This is the only way to
    /// pick a socket to write through.
    pub fn next(&self) -> Option<Arc<UdpSocket>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let sockets = inner.sockets.as_ref()?;
        if sockets.is_empty() {
            return None;
        }
        let socket = Arc::clone(&sockets[inner.next_write % sockets.len()].socket);
        inner.next_write = (inner.next_write + 1) % sockets.len();
        Some(socket)
    }

    /// Encodes `message` and sends it to `server` through the next
    /// pooled socket. A short write is a hard failure; nothing here is
    /// retried.
    pub async fn write_msg(
        &self,
        message: &Message,
        server: SocketAddr,
    ) -> Result<(), ResolveError> {
        let out = serialize_message(message)?;
        let socket = self.next().ok_or(ResolveError::NoConnectionAvailable)?;

        let written = tokio::time::timeout(WRITE_TIMEOUT, socket.send_to(&out, server))
            .await
            .map_err(|_| ResolveError::SendTimeout {
                server: server.to_string(),
            })?
            .map_err(|e| ResolveError::Socket(format!("failed to send to {}: {}", server, e)))?;

        if written < out.len() {
            return Err(ResolveError::PartialWrite {
                written,
                expected: out.len(),
            });
        }
        debug!(server = %server, bytes_sent = written, "query sent");
        Ok(())
    }

    /// Replaces the entire socket generation. Each outgoing socket is
    /// closed only after the grace period, letting in-flight reads
    /// drain, while new traffic moves to fresh sockets immediately.
    fn rotate(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(sockets) = inner.sockets.as_mut() else {
            return;
        };

        let grace = self.grace_period;
        for handle in sockets.drain(..) {
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                handle.done.cancel();
            });
        }
        inner.next_write = 0;

        for _ in 0..self.size {
            if let Err(e) = self.add(inner) {
                warn!(error = %e, "failed to replace rotated socket");
            }
        }
        debug!(sockets = self.size, "socket generation rotated");
    }

    /// Fires the pool-wide cancellation signal and every socket's done
    /// signal, then marks the pool closed. A second call is a no-op.
    /// Afterwards [`ConnectionPool::next`] and
    /// [`ConnectionPool::write_msg`] always fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if let Some(sockets) = inner.sockets.take() {
            self.shutdown.cancel();
            for handle in sockets {
                handle.done.cancel();
            }
            info!("connection pool closed");
        }
    }
}

/// Binds a UDP socket on platforms with `SO_REUSEPORT`: the first
/// socket of a generation takes an ephemeral port, later ones bind the
/// same local address so the generation shares one port.
#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn bind_socket(bind_address: SocketAddr, shared: Option<SocketAddr>) -> std::io::Result<UdpSocket> {
    let address = shared.unwrap_or(bind_address);
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_port(true)?;
    socket.bind(&address.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Fallback for platforms without `SO_REUSEPORT`: every socket binds an
/// independent ephemeral port.
#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn bind_socket(
    bind_address: SocketAddr,
    _shared: Option<SocketAddr>,
) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(
        Domain::for_address(bind_address),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;
    socket.bind(&bind_address.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// One read loop per socket. Runs until the done signal fires; the OS
/// socket closes when the last reference drops after exit. Datagram
/// noise on an open UDP port is expected, so anything shorter than the
/// DNS header, undecodable, or without a question section is dropped
/// without surfacing an error.
fn spawn_read_loop(
    socket: Arc<UdpSocket>,
    done: CancellationToken,
    responses: mpsc::UnboundedSender<ResponseEnvelope>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_UDP_PAYLOAD];
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                recv = socket.recv_from(&mut buf) => {
                    let (len, source) = match recv {
                        Ok(pair) => pair,
                        Err(_) => continue,
                    };
                    if len < DNS_HEADER_LEN {
                        continue;
                    }
                    let message = match Message::from_vec(&buf[..len]) {
                        Ok(message) => message,
                        Err(_) => continue,
                    };
                    if message.queries().is_empty() {
                        continue;
                    }
                    if responses.send(ResponseEnvelope { message, source }).is_err() {
                        // Dispatcher dropped the queue; nothing left to deliver to.
                        break;
                    }
                }
            }
        }
    });
}

fn serialize_message(message: &Message) -> Result<Vec<u8>, ResolveError> {
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    message
        .emit(&mut encoder)
        .map_err(|e| ResolveError::MessageEncode(e.to_string()))?;
    Ok(buf)
}
