//! Connection provider: the only way probes obtain sockets.
//!
//! Owns name resolution, connect retry/backoff and the traffic budget, so a
//! probe either receives a usable handle or fails its prepare step before any
//! measurement traffic is generated.

pub mod quota;

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub use self::quota::{QuotaExhausted, TrafficBudget};

use crate::config::TrafficConfig;
use crate::scheduler::Parameters;

/// Connect timeout used for the provider's reachability check.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Udp => write!(f, "udp"),
        }
    }
}

/// What a probe asks the provider for.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    /// `host:port` of the measurement server.
    pub target: &'a str,
    /// Short tag naming the requesting probe, for logs.
    pub purpose: &'a str,
    pub parameters: &'a Parameters,
    pub transport: TransportKind,
    /// Bytes the probe may transfer; reserved from the budget up front.
    pub traffic_bytes: u64,
}

/// A verified TCP endpoint.  Each download worker dials it with its own
/// socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpEndpoint {
    pub host: String,
    pub addr: SocketAddr,
}

/// Handle returned by a successful [`ConnectionProvider::establish`].
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpEndpoint),
    /// Blocking UDP socket, already connected to the target.
    Udp(UdpSocket),
}

#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Bytes still available to probes.  A read-only hint for prepare-time
    /// checks; [`ConnectionProvider::establish`] does the actual reservation.
    fn available_traffic(&self) -> u64;

    /// `None` means the probe cannot run: quota exhausted, name resolution
    /// failed, or the target refused every connect attempt.
    async fn establish(&self, request: ConnectRequest<'_>) -> Option<Connection>;
}

/// Provider backed by real sockets and a shared [`TrafficBudget`].
pub struct SocketProvider {
    budget: Arc<TrafficBudget>,
    connect_attempts: u32,
    retry_backoff: Duration,
    connect_timeout: Duration,
}

impl SocketProvider {
    pub fn new(budget: Arc<TrafficBudget>, config: &TrafficConfig) -> Self {
        Self {
            budget,
            connect_attempts: config.connect_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn budget(&self) -> &Arc<TrafficBudget> {
        &self.budget
    }

    async fn resolve(target: &str) -> Option<SocketAddr> {
        match tokio::net::lookup_host(target).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                warn!(target, error = %e, "name resolution failed");
                None
            }
        }
    }

    async fn check_tcp(&self, addr: SocketAddr) -> bool {
        let mut backoff = self.retry_backoff;
        for attempt in 1..=self.connect_attempts {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => {
                    debug!(%addr, attempt, "tcp endpoint reachable");
                    return true;
                }
                Ok(Err(e)) => warn!(%addr, attempt, error = %e, "tcp connect failed"),
                Err(_) => warn!(%addr, attempt, "tcp connect timed out"),
            }
            if attempt < self.connect_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        false
    }

    fn open_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
        let local: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(addr)?;
        Ok(socket)
    }
}

#[async_trait]
impl ConnectionProvider for SocketProvider {
    fn available_traffic(&self) -> u64 {
        self.budget.available()
    }

    async fn establish(&self, request: ConnectRequest<'_>) -> Option<Connection> {
        let addr = Self::resolve(request.target).await?;

        // Refunded on every path that does not hand out a connection,
        // including cancellation of this future.
        let reservation = match self.budget.reserve(request.traffic_bytes) {
            Ok(reservation) => reservation,
            Err(e) => {
                warn!(
                    target = request.target,
                    purpose = request.purpose,
                    error = %e,
                    "connection refused by traffic budget"
                );
                return None;
            }
        };

        let connection = match request.transport {
            TransportKind::Tcp => {
                if self.check_tcp(addr).await {
                    let host = request
                        .target
                        .rsplit_once(':')
                        .map(|(host, _)| host)
                        .unwrap_or(request.target)
                        .to_string();
                    Some(Connection::Tcp(TcpEndpoint { host, addr }))
                } else {
                    None
                }
            }
            TransportKind::Udp => match Self::open_udp(addr) {
                Ok(socket) => Some(Connection::Udp(socket)),
                Err(e) => {
                    warn!(%addr, error = %e, "failed to open udp socket");
                    None
                }
            },
        };

        if connection.is_some() {
            info!(
                target = request.target,
                purpose = request.purpose,
                transport = %request.transport,
                %addr,
                reserved = reservation.bytes(),
                "connection established"
            );
            reservation.commit();
        }
        connection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(available: u64) -> SocketProvider {
        let config = TrafficConfig {
            available_bytes: available,
            connect_attempts: 2,
            retry_backoff_ms: 10,
        };
        SocketProvider::new(Arc::new(TrafficBudget::new(available)), &config)
    }

    fn request<'a>(target: &'a str, params: &'a Parameters, transport: TransportKind, bytes: u64) -> ConnectRequest<'a> {
        ConnectRequest {
            target,
            purpose: "test",
            parameters: params,
            transport,
            traffic_bytes: bytes,
        }
    }

    #[tokio::test]
    async fn test_tcp_endpoint_reserves_budget() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let provider = provider(1000);
        let params = Parameters::new();

        let conn = provider
            .establish(request(&target, &params, TransportKind::Tcp, 400))
            .await;
        match conn {
            Some(Connection::Tcp(endpoint)) => {
                assert_eq!(endpoint.addr, listener.local_addr().unwrap());
                assert_eq!(endpoint.host, "127.0.0.1");
            }
            other => panic!("expected tcp endpoint, got {:?}", other),
        }
        assert_eq!(provider.budget().available(), 600);
    }

    #[tokio::test]
    async fn test_quota_exhausted_returns_none() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        let provider = provider(100);
        let params = Parameters::new();

        let conn = provider
            .establish(request(&target, &params, TransportKind::Tcp, 400))
            .await;
        assert!(conn.is_none());
        assert_eq!(provider.budget().available(), 100);
    }

    #[tokio::test]
    async fn test_refused_connect_refunds_budget() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let target = format!("127.0.0.1:{}", port);
        let provider = provider(1000);
        let params = Parameters::new();

        let conn = provider
            .establish(request(&target, &params, TransportKind::Tcp, 400))
            .await;
        assert!(conn.is_none());
        assert_eq!(provider.budget().available(), 1000);
    }

    #[tokio::test]
    async fn test_cancelled_establish_refunds_budget() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let target = format!("127.0.0.1:{}", port);
        let config = TrafficConfig {
            available_bytes: 1000,
            connect_attempts: 3,
            retry_backoff_ms: 10_000,
        };
        let provider = SocketProvider::new(Arc::new(TrafficBudget::new(1000)), &config);
        let params = Parameters::new();

        // The first attempt is refused; the future is dropped while it waits
        // out the backoff with the bytes reserved.
        let pending = tokio::time::timeout(
            Duration::from_millis(200),
            provider.establish(request(&target, &params, TransportKind::Tcp, 400)),
        )
        .await;
        assert!(pending.is_err());
        assert_eq!(provider.budget().available(), 1000);
        assert_eq!(provider.budget().used(), 0);
    }

    #[tokio::test]
    async fn test_udp_socket_is_connected() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = server.local_addr().unwrap().to_string();
        let provider = provider(1000);
        let params = Parameters::new();

        let conn = provider
            .establish(request(&target, &params, TransportKind::Udp, 10))
            .await;
        match conn {
            Some(Connection::Udp(socket)) => {
                assert_eq!(socket.peer_addr().unwrap(), server.local_addr().unwrap());
            }
            other => panic!("expected udp socket, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unresolvable_target() {
        let provider = provider(1000);
        let params = Parameters::new();
        let conn = provider
            .establish(request("not a host", &params, TransportKind::Udp, 10))
            .await;
        assert!(conn.is_none());
        assert_eq!(provider.budget().available(), 1000);
    }
}
