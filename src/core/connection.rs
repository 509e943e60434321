/// Transport abstraction and pooled connections
///
/// A [`Transport`] opens [`Channel`]s to endpoints; a [`Connection`] wraps one
/// channel with the bookkeeping the pool and dispatcher need. The default
/// [`TcpTransport`] speaks length-prefixed messages over tokio TCP streams.
use crate::core::Endpoint;
use crate::error::{NetworkError, NetworkErrorKind};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Opens channels to endpoints
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> io::Result<Box<dyn Channel>>;
}

/// One open, bidirectional byte channel carrying whole messages
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    async fn receive(&mut self, timeout: Duration) -> io::Result<Bytes>;

    async fn close(&mut self) -> io::Result<()>;
}

/// Largest message a server may send back (48MB, the server's own limit)
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// TCP transport for wire messages prefixed with their little-endian i32 length
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    keepalive: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { keepalive: true }
    }

    /// Configure stream for low latency request/reply traffic
    fn configure_stream(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        if self.keepalive {
            SockRef::from(stream).set_keepalive(true)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &Endpoint, connect_timeout: Duration) -> io::Result<Box<dyn Channel>> {
        debug!("Connecting to {}", endpoint);

        let address = (endpoint.host(), endpoint.port());
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Failed to connect to {}: {}", endpoint, e);
                return Err(e);
            }
            Err(_) => {
                debug!("Timeout connecting to {}", endpoint);
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {endpoint} timed out after {connect_timeout:?}"),
                ));
            }
        };

        if let Err(e) = self.configure_stream(&stream) {
            warn!("Failed to configure stream to {}: {}", endpoint, e);
        }

        Ok(Box::new(TcpChannel { stream }))
    }
}

struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    async fn read_message(&mut self) -> io::Result<Bytes> {
        let mut prefix = [0u8; 4];
        self.stream.read_exact(&mut prefix).await?;
        let length = i32::from_le_bytes(prefix);
        if length < 4 || length as usize > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid message length {length}"),
            ));
        }

        let mut buf = BytesMut::zeroed(length as usize);
        buf[..4].copy_from_slice(&prefix);
        self.stream.read_exact(&mut buf[4..]).await?;
        Ok(buf.freeze())
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    async fn receive(&mut self, receive_timeout: Duration) -> io::Result<Bytes> {
        match timeout(receive_timeout, self.read_message()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no reply within {receive_timeout:?}"),
            )),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// A live channel to one endpoint, owned by exactly one holder at a time
pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    channel: Box<dyn Channel>,
    created_at: Instant,
    last_used: Instant,
    last_success: Option<Instant>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used)
            .field("last_success", &self.last_success)
            .finish()
    }
}

impl Connection {
    pub fn new(id: u64, endpoint: Endpoint, channel: Box<dyn Channel>) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint,
            channel,
            created_at: now,
            last_used: now,
            last_success: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    pub(crate) fn is_idle_too_long(&self, max_idle_time: Option<Duration>) -> bool {
        max_idle_time
            .map(|limit| self.last_used.elapsed() > limit)
            .unwrap_or(false)
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Send one request and wait for its reply.
    ///
    /// Failures while sending are not ambiguous: a partial message is never
    /// executed. Once the request is on the wire any failure is ambiguous.
    pub async fn round_trip(&mut self, request: &[u8], reply_timeout: Duration) -> Result<Bytes, NetworkError> {
        self.touch();

        if let Err(e) = self.channel.send(request).await {
            return Err(NetworkError::from_io(self.endpoint.clone(), NetworkErrorKind::Send, e));
        }

        match self.channel.receive(reply_timeout).await {
            Ok(reply) => {
                let now = Instant::now();
                self.last_used = now;
                self.last_success = Some(now);
                Ok(reply)
            }
            Err(e) => Err(
                NetworkError::from_io(self.endpoint.clone(), NetworkErrorKind::Receive, e).ambiguous(true),
            ),
        }
    }

    /// Close the underlying channel, logging rather than surfacing failures
    pub async fn close(mut self) {
        if let Err(e) = self.channel.close().await {
            debug!("Error closing connection {} to {}: {}", self.id, self.endpoint, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mock::{MockServer, MockTransport};
    use bson::doc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_round_trip_with_length_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo every length-prefixed message back
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                loop {
                    let mut prefix = [0u8; 4];
                    if stream.read_exact(&mut prefix).await.is_err() {
                        break;
                    }
                    let length = i32::from_le_bytes(prefix) as usize;
                    let mut body = vec![0u8; length - 4];
                    if stream.read_exact(&mut body).await.is_err() {
                        break;
                    }
                    let _ = stream.write_all(&prefix).await;
                    let _ = stream.write_all(&body).await;
                }
            }
        });

        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        let transport = TcpTransport::new();
        let channel = transport.connect(&endpoint, Duration::from_secs(1)).await.unwrap();
        let mut connection = Connection::new(1, endpoint, channel);

        let message = [9u8, 0, 0, 0, 1, 2, 3, 4, 5];
        let reply = connection
            .round_trip(&message, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&reply[..], &message[..]);
        assert!(connection.last_success().is_some());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let transport = TcpTransport::new();
        let endpoint = Endpoint::new("127.0.0.1", 65534);
        let result = transport.connect(&endpoint, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_receive_timeout_is_ambiguous() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept and never answer
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        let channel = TcpTransport::new()
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        let mut connection = Connection::new(7, endpoint, channel);

        let err = connection
            .round_trip(&[8, 0, 0, 0, 1, 2, 3, 4], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.ambiguous);
        assert_eq!(err.kind, NetworkErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_send_failure_is_not_ambiguous() {
        let server = MockServer::new(|_endpoint, _command| Ok(doc! { "ok": 1 }));
        server.fail_next_sends(1);
        let transport = MockTransport::new(server);
        let endpoint = Endpoint::new("h1", 27017);
        let channel = transport.connect(&endpoint, Duration::from_secs(1)).await.unwrap();
        let mut connection = Connection::new(1, endpoint, channel);

        let err = connection
            .round_trip(b"request", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, NetworkErrorKind::Send);
        assert!(!err.ambiguous);
    }

    #[test]
    fn test_idle_detection() {
        let server = MockServer::new(|_endpoint, _command| Ok(doc! { "ok": 1 }));
        let channel = MockTransport::new(server).channel_for(Endpoint::new("h1", 27017));
        let connection = Connection::new(3, Endpoint::new("h1", 27017), channel);
        assert!(!connection.is_idle_too_long(None));
        assert!(!connection.is_idle_too_long(Some(Duration::from_secs(60))));
        std::thread::sleep(Duration::from_millis(5));
        assert!(connection.is_idle_too_long(Some(Duration::from_millis(1))));
    }
}
