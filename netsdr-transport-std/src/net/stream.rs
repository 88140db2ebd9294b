//! TCP stream transport implementation for the std platform.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use netsdr_transport_api::stream::{Error, StreamTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{DEFAULT_CHANNEL_CAPACITY, Inbound, IntoTransportError, RemoteAddress};

/// Default size of the buffer filled by each read of the receive loop.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 8194;

/// Configuration of a [`StreamTransportClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTransportConfig {
    /// The remote endpoint to connect to.
    pub remote: RemoteAddress,
    /// Upper bound for establishing a connection; `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,
    /// Whether to disable Nagle's algorithm on the connection.
    pub nodelay: bool,
    /// Size of the buffer each read fills, and so the largest inbound message.
    pub receive_buffer_size: usize,
    /// Capacity of the inbound message channel.
    pub channel_capacity: usize,
}

impl StreamTransportConfig {
    /// Creates a configuration for `remote` with default settings.
    pub fn new(remote: RemoteAddress) -> Self {
        Self {
            remote,
            connect_timeout: None,
            nodelay: true,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets `TCP_NODELAY`.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Sets the receive buffer size (at least one byte).
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size.max(1);
        self
    }

    /// Sets the inbound channel capacity (at least one message).
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

#[derive(Debug)]
enum State {
    Disconnected,
    Connected(Connection),
}

/// An established connection and the receive loop reading from it.
#[derive(Debug)]
struct Connection {
    writer: OwnedWriteHalf,
    peer: SocketAddr,
    shutdown: CancellationToken,
    receiver: JoinHandle<()>,
}

impl Connection {
    /// Returns whether the receive loop is still running.
    fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.receiver.is_finished()
    }

    /// Stops the receive loop, waits for it to exit and shuts the write half down.
    async fn close(mut self) {
        self.shutdown.cancel();
        // The loop handles all of its errors itself, a join error can only be a cancelled task.
        let _ = (&mut self.receiver).await;
        // Any error isn't actionable here.
        let _ = self.writer.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.receiver.abort();
    }
}

/// Client for a connection-oriented transport to one fixed remote endpoint.
///
/// Inbound data is delivered on the [`Inbound`] stream returned by the constructor, one message per
/// successful read, in the order it was read.
///
/// The stream belongs to the client rather than to a single connection. Messages left unread
/// when a connection ends stay queued and are yielded ahead of those from a later connection.
///
/// Dropping the client aborts the receive loop and closes the connection, but only [`Self::close`]
/// waits for that to complete.
///
/// # Example
///
/// ```no_run
/// use netsdr_transport_std::StreamTransportClient;
/// use tokio_stream::StreamExt;
///
/// # async fn example() -> Result<(), netsdr_transport_api::stream::Error> {
/// let (mut client, mut inbound) = StreamTransportClient::new("192.168.0.10", 50000);
/// client.connect().await?;
/// client.send(&[0x04, 0x20, 0x01, 0x00]).await?;
/// if let Some(reply) = inbound.next().await {
///     println!("{reply:02X?}");
/// }
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct StreamTransportClient {
    config: StreamTransportConfig,
    state: State,
    inbound: mpsc::Sender<Vec<u8>>,
}

impl StreamTransportClient {
    /// Creates a client for `host:port` with default settings.
    pub fn new(host: impl Into<String>, port: u16) -> (Self, Inbound<Vec<u8>>) {
        Self::with_config(StreamTransportConfig::new(RemoteAddress::new(host, port)))
    }

    /// Creates a client from a full configuration.
    pub fn with_config(config: StreamTransportConfig) -> (Self, Inbound<Vec<u8>>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity.max(1));
        let client = Self {
            config,
            state: State::Disconnected,
            inbound: inbound_tx,
        };
        (client, Inbound::new(inbound_rx))
    }

    /// Returns the configured remote endpoint.
    pub fn remote(&self) -> &RemoteAddress {
        &self.config.remote
    }

    /// Returns the configuration this client was created with.
    pub fn config(&self) -> &StreamTransportConfig {
        &self.config
    }

    /// Returns whether a connection is established and its receive loop is still running.
    ///
    /// Once the peer closes the connection or a read fails this returns `false`, even before the
    /// stale connection has been released by the next call to [`Self::connect`] or [`Self::send`].
    pub fn is_connected(&self) -> bool {
        matches!(&self.state, State::Connected(connection) if connection.is_alive())
    }

    /// Returns the address of the connected peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            State::Connected(connection) if connection.is_alive() => Some(connection.peer),
            _ => None,
        }
    }

    /// Connects to the remote endpoint and starts the receive loop.
    ///
    /// Does nothing if already connected. On failure the error is logged and returned, and the
    /// client stays disconnected.
    #[tracing::instrument(skip(self), fields(remote = %self.config.remote))]
    pub async fn connect(&mut self) -> Result<(), Error> {
        self.release_stale().await;

        if self.is_connected() {
            tracing::info!("already connected");
            return Ok(());
        }

        let (stream, peer) = match self.open().await {
            Ok(opened) => opened,
            Err(error) => {
                tracing::warn!(%error, "failed to connect");
                return Err(error.into_transport_error());
            }
        };

        let (reader, writer) = stream.into_split();
        let shutdown = CancellationToken::new();
        let receiver = tokio::spawn(
            receive_loop(
                reader,
                self.inbound.clone(),
                shutdown.clone(),
                self.config.receive_buffer_size.max(1),
            )
            .instrument(tracing::info_span!("stream_receive", %peer)),
        );

        tracing::info!(%peer, "connected");
        self.state = State::Connected(Connection {
            writer,
            peer,
            shutdown,
            receiver,
        });

        Ok(())
    }

    /// Stops the receive loop and closes the connection.
    ///
    /// A connection whose receive loop already ended on its own counts as no connection; it is
    /// released and only the diagnostic for a missing connection is reported.
    #[tracing::instrument(skip(self), fields(remote = %self.config.remote))]
    pub async fn disconnect(&mut self) {
        self.release_stale().await;

        match self.take_connection() {
            Some(connection) => {
                connection.close().await;
                tracing::info!("disconnected");
            }
            None => {
                tracing::info!("no active connection to disconnect");
            }
        }
    }

    /// Writes all of `data` to the connection and flushes it.
    ///
    /// Returns [`Error::NotConnected`] without touching the network if there is no connection.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.release_stale().await;

        let State::Connected(connection) = &mut self.state else {
            return Err(Error::NotConnected);
        };

        tracing::debug!(
            peer = %connection.peer,
            length = data.len(),
            data = %hex::encode_upper(data),
            "sending message",
        );

        let result = async {
            connection.writer.write_all(data).await?;
            connection.writer.flush().await
        }
        .await;

        result.map_err(|error| {
            tracing::warn!(peer = %connection.peer, %error, "failed to send message");
            error.into_transport_error()
        })
    }

    /// Writes the UTF-8 encoding of `text` to the connection.
    pub async fn send_str(&mut self, text: &str) -> Result<(), Error> {
        self.send(text.as_bytes()).await
    }

    /// Releases the connection, if any, and waits for the receive loop to exit.
    ///
    /// Silent and safe to call from any state, any number of times.
    pub async fn close(&mut self) {
        if let Some(connection) = self.take_connection() {
            connection.close().await;
        }
    }

    async fn open(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        let connect = TcpStream::connect(self.config.remote.as_to_socket_addrs());
        let stream = match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_elapsed| std::io::Error::from(ErrorKind::TimedOut))??,
            None => connect.await?,
        };
        stream.set_nodelay(self.config.nodelay)?;
        let peer = stream.peer_addr()?;
        Ok((stream, peer))
    }

    fn take_connection(&mut self) -> Option<Connection> {
        match std::mem::replace(&mut self.state, State::Disconnected) {
            State::Connected(connection) => Some(connection),
            State::Disconnected => None,
        }
    }

    /// Moves to [`State::Disconnected`] if the receive loop has terminated on its own.
    async fn release_stale(&mut self) {
        if self.is_connected() {
            return;
        }
        if let Some(connection) = self.take_connection() {
            tracing::debug!(peer = %connection.peer, "releasing connection after receive loop exit");
            connection.close().await;
        }
    }
}

impl StreamTransport for StreamTransportClient {
    async fn connect(&mut self) -> Result<(), Error> {
        StreamTransportClient::connect(self).await
    }

    async fn disconnect(&mut self) {
        StreamTransportClient::disconnect(self).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        StreamTransportClient::send(self, data).await
    }

    fn is_connected(&self) -> bool {
        StreamTransportClient::is_connected(self)
    }

    async fn close(&mut self) {
        StreamTransportClient::close(self).await
    }
}

/// Reads from the connection until cancelled, the peer closes it, or a read fails.
///
/// Every read of at least one byte is forwarded as its own message.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    inbound: mpsc::Sender<Vec<u8>>,
    shutdown: CancellationToken,
    buffer_size: usize,
) {
    tracing::debug!("receive loop started");

    let mut buffer = vec![0; buffer_size];
    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                tracing::warn!("peer closed the connection");
                break;
            }
            Ok(length) => {
                let message = buffer[..length].to_vec();
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    sent = inbound.send(message) => {
                        if sent.is_err() {
                            tracing::trace!(length, "inbound stream dropped, discarding message");
                        }
                    }
                }
            }
            Err(error) => {
                tracing::error!(%error, "error in receive loop");
                break;
            }
        }
    }

    tracing::debug!("receive loop stopped");
}

impl IntoTransportError<Error> for std::io::Error {
    fn into_transport_error(self) -> Error {
        match self.kind() {
            ErrorKind::PermissionDenied => Error::PermissionDenied,
            ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            ErrorKind::ConnectionReset => Error::ConnectionReset,
            ErrorKind::ConnectionAborted => Error::ConnectionReset,
            ErrorKind::BrokenPipe => Error::ConnectionReset,
            ErrorKind::NotConnected => Error::NotConnected,
            ErrorKind::HostUnreachable => Error::NoRoute,
            ErrorKind::NetworkUnreachable => Error::NoRoute,
            ErrorKind::AddrInUse => Error::InvalidAddress,
            ErrorKind::AddrNotAvailable => Error::InvalidAddress,
            ErrorKind::InvalidInput => Error::InvalidAddress,
            ErrorKind::NetworkDown => Error::NetworkDown,
            ErrorKind::TimedOut => Error::TimedOut,
            _ => Error::Other,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use socket2::SockRef;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_stream::StreamExt;
    use tracing_test::traced_test;

    use super::{DEFAULT_RECEIVE_BUFFER_SIZE, StreamTransportClient, StreamTransportConfig};
    use crate::RemoteAddress;

    const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn wait_until_disconnected(client: &StreamTransportClient) {
        timeout(RECEIVE_TIMEOUT, async {
            while client.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client still connected");
    }

    #[test]
    fn config_defaults() {
        let config = StreamTransportConfig::new(RemoteAddress::new("127.0.0.1", 50000));
        assert_eq!(config.receive_buffer_size, DEFAULT_RECEIVE_BUFFER_SIZE);
        assert_eq!(config.receive_buffer_size, 8194);
        assert_eq!(config.connect_timeout, None);
        assert!(config.nodelay);

        let config = config
            .with_receive_buffer_size(0)
            .with_channel_capacity(0)
            .with_connect_timeout(Duration::from_secs(2))
            .with_nodelay(false);
        assert_eq!(config.receive_buffer_size, 1);
        assert_eq!(config.channel_capacity, 1);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(2)));
        assert!(!config.nodelay);
    }

    #[tokio::test]
    #[traced_test]
    async fn second_connect_is_reported() {
        let (listener, port) = local_listener().await;
        let (mut client, _inbound) = StreamTransportClient::new("127.0.0.1", port);

        client.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();
        client.connect().await.unwrap();

        assert!(logs_contain("connected"));
        assert!(logs_contain("already connected"));
        client.close().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn disconnect_without_connection_is_reported() {
        let (mut client, _inbound) = StreamTransportClient::new("127.0.0.1", 9);

        client.disconnect().await;

        assert!(logs_contain("no active connection to disconnect"));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_connect_is_reported() {
        let (listener, port) = local_listener().await;
        drop(listener);
        let (mut client, _inbound) = StreamTransportClient::new("127.0.0.1", port);

        assert!(client.connect().await.is_err());

        assert!(logs_contain("failed to connect"));
        assert!(!client.is_connected());
        assert_eq!(client.peer_addr(), None);
    }

    #[tokio::test]
    async fn messages_hold_only_the_bytes_read() {
        let (listener, port) = local_listener().await;
        let config = StreamTransportConfig::new(RemoteAddress::new("127.0.0.1", port))
            .with_receive_buffer_size(4);
        let (mut client, mut inbound) = StreamTransportClient::with_config(config);

        client.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"0123456789").await.unwrap();

        let mut received = Vec::new();
        while received.len() < 10 {
            let message = timeout(RECEIVE_TIMEOUT, inbound.next())
                .await
                .unwrap()
                .unwrap();
            assert!(!message.is_empty() && message.len() <= 4);
            received.extend_from_slice(&message);
        }
        assert_eq!(received, b"0123456789");

        client.close().await;
    }

    #[tokio::test]
    async fn peer_addr_while_connected() {
        let (listener, port) = local_listener().await;
        let (mut client, _inbound) = StreamTransportClient::new("127.0.0.1", port);

        client.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        assert_eq!(client.peer_addr(), Some(listener.local_addr().unwrap()));
        assert_eq!(client.remote().port(), port);

        client.disconnect().await;
        assert_eq!(client.peer_addr(), None);
    }

    #[tokio::test]
    async fn dropping_the_client_closes_the_connection() {
        let (listener, port) = local_listener().await;
        let (mut client, _inbound) = StreamTransportClient::new("127.0.0.1", port);

        client.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        drop(client);

        let mut buffer = [0u8; 8];
        let read = timeout(RECEIVE_TIMEOUT, peer.read(&mut buffer))
            .await
            .expect("connection still open after drop")
            .unwrap_or(0);
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn dropped_inbound_stream_keeps_the_connection() {
        let (listener, port) = local_listener().await;
        let (mut client, inbound) = StreamTransportClient::new("127.0.0.1", port);
        drop(inbound);

        client.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"nobody listens").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(client.is_connected());
        client.send(b"still here").await.unwrap();

        let mut buffer = [0u8; 10];
        timeout(RECEIVE_TIMEOUT, peer.read_exact(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buffer, b"still here");

        client.close().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn reset_by_peer_ends_the_connection() {
        let (listener, port) = local_listener().await;
        let (mut client, _inbound) = StreamTransportClient::new("127.0.0.1", port);

        client.connect().await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        // A zero linger timeout makes the close send a reset instead of a FIN.
        SockRef::from(&peer)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(peer);

        wait_until_disconnected(&client).await;
        assert!(logs_contain("error in receive loop"));
        assert_eq!(client.peer_addr(), None);

        client.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();
        assert!(client.is_connected());

        client.close().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn disconnect_after_peer_close_reports_no_connection() {
        let (listener, port) = local_listener().await;
        let (mut client, _inbound) = StreamTransportClient::new("127.0.0.1", port);

        client.connect().await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);
        wait_until_disconnected(&client).await;

        client.disconnect().await;

        assert!(logs_contain("no active connection to disconnect"));
        assert!(!logs_contain("disconnected"));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn unread_messages_outlive_the_connection() {
        let (listener, port) = local_listener().await;
        let (mut client, mut inbound) = StreamTransportClient::new("127.0.0.1", port);

        client.connect().await.unwrap();
        let (mut first, _) = listener.accept().await.unwrap();
        first.write_all(b"old").await.unwrap();
        timeout(RECEIVE_TIMEOUT, async {
            while inbound.as_ref().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message was not queued");
        client.disconnect().await;

        client.connect().await.unwrap();
        let (mut second, _) = listener.accept().await.unwrap();
        second.write_all(b"new").await.unwrap();

        for expected in [b"old", b"new"] {
            let message = timeout(RECEIVE_TIMEOUT, inbound.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message, expected);
        }

        client.close().await;
    }
}
