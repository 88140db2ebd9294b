//! Stream (TCP) transport abstractions.
//!
//! To get started, see [`StreamTransport`].

/// Connection-oriented transport to one fixed remote endpoint.
///
/// An implementation owns at most one connection at a time. While connected, a background receive
/// loop delivers every chunk read from the connection, in order, to the inbound channel handed out
/// by the implementation's constructor. The receive loop runs iff the transport is connected.
///
/// # Example
///
/// ```no_run
/// use netsdr_transport_api::stream::StreamTransport;
///
/// async fn request_name(mut transport: impl StreamTransport) {
///     transport.connect().await.unwrap();
///     transport.send(&[0x04, 0x20, 0x01, 0x00]).await.unwrap();
///     // Replies arrive on the inbound channel.
///     transport.disconnect().await;
/// }
/// ```
#[expect(async_fn_in_trait)]
pub trait StreamTransport {
    /// Connects to the configured remote endpoint and starts the receive loop.
    ///
    /// Calling this while already connected is a no-op that returns `Ok(())`; no second connection
    /// or receive loop is created. On failure the transport stays disconnected.
    async fn connect(&mut self) -> Result<(), Error>;

    /// Stops the receive loop and releases the connection.
    ///
    /// Does nothing (apart from a diagnostic) when not connected.
    async fn disconnect(&mut self);

    /// Writes the entire buffer to the connection.
    ///
    /// Returns [`Error::NotConnected`] without touching the network if the transport is not
    /// connected.
    async fn send(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Writes the UTF-8 encoding of `text` to the connection.
    async fn send_str(&mut self, text: &str) -> Result<(), Error> {
        self.send(text.as_bytes()).await
    }

    /// Returns whether a connection is established and its receive loop is still running.
    fn is_connected(&self) -> bool;

    /// Releases every resource held by the transport.
    ///
    /// Safe to call from any state and any number of times. A later [`Self::connect`] starts over
    /// from a clean state.
    async fn close(&mut self);
}

/// Errors that can occur when using a stream transport.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, thiserror::Error)]
pub enum Error {
    /// The operation requires an established connection.
    #[error("not connected to a server")]
    NotConnected,
    /// The remote host actively refused the connection.
    #[error("the connection was refused by the remote host")]
    ConnectionRefused,
    /// The connection was reset or aborted by the remote host.
    #[error("the connection was reset by the remote host")]
    ConnectionReset,
    /// The connection attempt or write timed out.
    #[error("the connection timed out")]
    TimedOut,
    /// No route to host.
    #[error("no route to host")]
    NoRoute,
    /// The remote address could not be resolved or is not usable.
    #[error("the remote address is invalid")]
    InvalidAddress,
    /// No permission to access the resource.
    #[error("no permission to access the resource")]
    PermissionDenied,
    /// The network stack is down.
    #[error("the network stack is down")]
    NetworkDown,
    /// Currently unhandled error occurred.
    #[error("unspecified transport error")]
    Other,
}

#[doc(hidden)]
#[cfg(feature = "test-suites")]
#[cfg_attr(coverage_nightly, coverage(off))]
pub mod test_suite {
    #![expect(missing_docs, reason = "tests")]
    //! Test suite for stream transports.
    //!
    //! Every function takes a factory building the transport under test for a `host` and `port`,
    //! returning it together with its inbound message stream.

    use crate::net::stream::{Error, StreamTransport};
    use futures::{Stream, StreamExt};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
    const SILENCE: Duration = Duration::from_millis(200);

    async fn next_message(inbound: &mut (impl Stream<Item = Vec<u8>> + Unpin)) -> Vec<u8> {
        timeout(RECEIVE_TIMEOUT, inbound.next())
            .await
            .expect("no inbound message in time")
            .expect("inbound stream closed")
    }

    async fn assert_silent(inbound: &mut (impl Stream<Item = Vec<u8>> + Unpin)) {
        match timeout(SILENCE, inbound.next()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(message)) => panic!("unexpected inbound message {message:02X?}"),
        }
    }

    pub async fn test_receive_on_connect<T, S>(
        make_client: impl FnOnce(&str, u16) -> (T, S),
        ip_address: &str,
        port: u16,
    ) where
        T: StreamTransport,
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let listener = TcpListener::bind((ip_address, port)).await.unwrap();
        let (mut client, mut inbound) = make_client(ip_address, port);

        client.connect().await.unwrap();
        assert!(client.is_connected());

        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();

        assert_eq!(next_message(&mut inbound).await, [0xDE, 0xAD, 0xBE, 0xEF]);

        client.close().await;
    }

    pub async fn test_connect_twice<T, S>(
        make_client: impl FnOnce(&str, u16) -> (T, S),
        ip_address: &str,
        port: u16,
    ) where
        T: StreamTransport,
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let listener = TcpListener::bind((ip_address, port)).await.unwrap();
        let (mut client, mut inbound) = make_client(ip_address, port);

        client.connect().await.unwrap();
        client.connect().await.unwrap();
        assert!(client.is_connected());

        let (mut peer, _) = listener.accept().await.unwrap();
        assert!(
            timeout(SILENCE, listener.accept()).await.is_err(),
            "second connect must not open another connection"
        );

        // A second receive loop would either steal or duplicate this chunk.
        peer.write_all(b"once").await.unwrap();
        assert_eq!(next_message(&mut inbound).await, b"once");
        assert_silent(&mut inbound).await;

        client.close().await;
    }

    pub async fn test_send_without_connection<T, S>(
        make_client: impl FnOnce(&str, u16) -> (T, S),
        ip_address: &str,
        port: u16,
    ) where
        T: StreamTransport,
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let listener = TcpListener::bind((ip_address, port)).await.unwrap();
        let (mut client, _inbound) = make_client(ip_address, port);

        assert!(!client.is_connected());
        assert_eq!(client.send(b"hello").await, Err(Error::NotConnected));
        assert_eq!(client.send_str("hello").await, Err(Error::NotConnected));
        assert!(
            timeout(SILENCE, listener.accept()).await.is_err(),
            "send without a connection must not reach the network"
        );

        client.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();
        client.disconnect().await;
        assert_eq!(client.send(b"hello").await, Err(Error::NotConnected));
    }

    pub async fn test_send_in_order<T, S>(
        make_client: impl FnOnce(&str, u16) -> (T, S),
        ip_address: &str,
        port: u16,
    ) where
        T: StreamTransport,
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let listener = TcpListener::bind((ip_address, port)).await.unwrap();
        let (mut client, _inbound) = make_client(ip_address, port);

        client.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        let payloads: Vec<Vec<u8>> = (0..32u8)
            .map(|index| vec![index; usize::from(index) * 64 + 1])
            .collect();
        for payload in &payloads {
            client.send(payload).await.unwrap();
        }
        client.send_str("done").await.unwrap();

        let mut expected = payloads.concat();
        expected.extend_from_slice(b"done");

        let mut received = vec![0; expected.len()];
        timeout(RECEIVE_TIMEOUT, peer.read_exact(&mut received))
            .await
            .expect("peer did not receive everything in time")
            .unwrap();
        assert_eq!(received, expected);

        client.close().await;
    }

    pub async fn test_connect_refused<T, S>(
        make_client: impl FnOnce(&str, u16) -> (T, S),
        ip_address: &str,
        port: u16,
    ) where
        T: StreamTransport,
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let (mut client, _inbound) = make_client(ip_address, port);

        assert_eq!(client.connect().await, Err(Error::ConnectionRefused));
        assert!(!client.is_connected());
        assert_eq!(client.send(b"hello").await, Err(Error::NotConnected));
    }

    pub async fn test_silent_after_disconnect<T, S>(
        make_client: impl FnOnce(&str, u16) -> (T, S),
        ip_address: &str,
        port: u16,
    ) where
        T: StreamTransport,
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let listener = TcpListener::bind((ip_address, port)).await.unwrap();
        let (mut client, mut inbound) = make_client(ip_address, port);

        client.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        peer.write_all(b"before").await.unwrap();
        assert_eq!(next_message(&mut inbound).await, b"before");

        client.disconnect().await;
        assert!(!client.is_connected());

        // The write may fail once the client side is gone; that is fine.
        let _ = peer.write_all(b"after").await;
        assert_silent(&mut inbound).await;
    }

    pub async fn test_reconnect<T, S>(
        make_client: impl FnOnce(&str, u16) -> (T, S),
        ip_address: &str,
        port: u16,
    ) where
        T: StreamTransport,
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let listener = TcpListener::bind((ip_address, port)).await.unwrap();
        let (mut client, mut inbound) = make_client(ip_address, port);

        client.connect().await.unwrap();
        let (mut first, _) = listener.accept().await.unwrap();
        client.disconnect().await;

        let mut buffer = [0u8; 8];
        let read = timeout(RECEIVE_TIMEOUT, first.read(&mut buffer))
            .await
            .expect("first connection was not closed")
            .unwrap_or(0);
        assert_eq!(read, 0, "expected EOF after disconnect");

        client.connect().await.unwrap();
        let (mut second, _) = listener.accept().await.unwrap();
        second.write_all(b"again").await.unwrap();
        assert_eq!(next_message(&mut inbound).await, b"again");

        client.close().await;
    }

    pub async fn test_peer_close<T, S>(
        make_client: impl FnOnce(&str, u16) -> (T, S),
        ip_address: &str,
        port: u16,
    ) where
        T: StreamTransport,
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let listener = TcpListener::bind((ip_address, port)).await.unwrap();
        let (mut client, mut inbound) = make_client(ip_address, port);

        client.connect().await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"bye").await.unwrap();
        drop(peer);

        assert_eq!(next_message(&mut inbound).await, b"bye");

        timeout(RECEIVE_TIMEOUT, async {
            while client.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client still connected after the peer closed");
        assert_eq!(client.send(b"late").await, Err(Error::NotConnected));

        client.connect().await.unwrap();
        assert!(client.is_connected());
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"hello").await.unwrap();
        assert_eq!(next_message(&mut inbound).await, b"hello");

        client.close().await;
    }

    pub async fn test_prompt_shutdown<T, S>(
        make_client: impl FnOnce(&str, u16) -> (T, S),
        ip_address: &str,
        port: u16,
    ) where
        T: StreamTransport,
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        let listener = TcpListener::bind((ip_address, port)).await.unwrap();
        let (mut client, _inbound) = make_client(ip_address, port);

        // Nothing is ever written by the peer, so the receive loop stays blocked in its read.
        client.connect().await.unwrap();
        let _peer = listener.accept().await.unwrap();

        timeout(Duration::from_secs(1), client.disconnect())
            .await
            .expect("disconnect did not interrupt the blocked receive loop");
        assert!(!client.is_connected());

        client.disconnect().await;
        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
    }
}
