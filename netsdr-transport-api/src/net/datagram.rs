//! Datagram (UDP) transport abstractions.

use core::net::SocketAddr;

/// Connectionless transport listening on a fixed local endpoint.
///
/// There is no connect step: once listening, every datagram arriving from any sender is delivered,
/// in arrival order, to the inbound channel handed out by the implementation's constructor. At most
/// one receive loop runs per instance.
///
/// # Example
///
/// ```no_run
/// use netsdr_transport_api::datagram::DatagramTransport;
///
/// async fn capture(mut transport: impl DatagramTransport) {
///     transport.start_listening().await.unwrap();
///     // IQ samples arrive on the inbound channel until listening is stopped.
///     transport.stop_listening().await;
/// }
/// ```
#[expect(async_fn_in_trait)]
pub trait DatagramTransport {
    /// Binds the local endpoint and starts the receive loop.
    ///
    /// Returns once the socket is bound. Starting while already listening is rejected with
    /// [`Error::AlreadyListening`] and leaves the running loop untouched.
    async fn start_listening(&mut self) -> Result<(), Error>;

    /// Stops the receive loop and releases the socket.
    ///
    /// Does nothing when not listening.
    async fn stop_listening(&mut self);

    /// Releases every resource held by the transport.
    ///
    /// Same as [`Self::stop_listening`] but without diagnostics, intended for application shutdown.
    async fn exit(&mut self);

    /// Returns whether the receive loop is running.
    fn is_listening(&self) -> bool;

    /// Returns the configured local endpoint.
    fn local_endpoint(&self) -> SocketAddr;
}

/// A single datagram received by a [`DatagramTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Datagram {
    /// The datagram payload, exactly as received.
    pub payload: Vec<u8>,
    /// The address the datagram was sent from.
    pub source: SocketAddr,
}

/// Errors that can occur when using a datagram transport.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Copy, Clone, Hash, thiserror::Error)]
pub enum Error {
    /// The transport is already listening.
    #[error("already listening")]
    AlreadyListening,
    /// The provided address is invalid.
    ///
    /// This can occur if the address is already in use or doesn't exist.
    #[error("the local address is invalid or already in use")]
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
    //! Test suite for datagram transports.
    //!
    //! Every function takes a factory building the transport under test for a local `port`,
    //! returning it together with its inbound datagram stream.

    use crate::net::datagram::{Datagram, DatagramTransport, Error};
    use futures::{Stream, StreamExt};
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
    const SILENCE: Duration = Duration::from_millis(200);

    async fn next_datagram(inbound: &mut (impl Stream<Item = Datagram> + Unpin)) -> Datagram {
        timeout(RECEIVE_TIMEOUT, inbound.next())
            .await
            .expect("no datagram in time")
            .expect("inbound stream closed")
    }

    async fn sender() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    pub async fn test_receive_ping<T, S>(make_client: impl FnOnce(u16) -> (T, S), port: u16)
    where
        T: DatagramTransport,
        S: Stream<Item = Datagram> + Unpin,
    {
        let (mut client, mut inbound) = make_client(port);
        client.start_listening().await.unwrap();
        assert!(client.is_listening());

        let sender = sender().await;
        sender.send_to(b"ping", ("127.0.0.1", port)).await.unwrap();

        let datagram = next_datagram(&mut inbound).await;
        assert_eq!(core::str::from_utf8(&datagram.payload).unwrap(), "ping");
        assert_eq!(datagram.source, sender.local_addr().unwrap());

        client.exit().await;
        assert!(!client.is_listening());
    }

    pub async fn test_restart<T, S>(make_client: impl FnOnce(u16) -> (T, S), port: u16)
    where
        T: DatagramTransport,
        S: Stream<Item = Datagram> + Unpin,
    {
        let (mut client, mut inbound) = make_client(port);
        let sender = sender().await;

        client.start_listening().await.unwrap();
        client.stop_listening().await;
        assert!(!client.is_listening());

        client.start_listening().await.unwrap();
        assert!(client.is_listening());

        sender.send_to(b"again", ("127.0.0.1", port)).await.unwrap();
        assert_eq!(next_datagram(&mut inbound).await.payload, b"again");

        client.exit().await;
    }

    pub async fn test_start_twice<T, S>(make_client: impl FnOnce(u16) -> (T, S), port: u16)
    where
        T: DatagramTransport,
        S: Stream<Item = Datagram> + Unpin,
    {
        let (mut client, mut inbound) = make_client(port);

        client.start_listening().await.unwrap();
        assert_eq!(client.start_listening().await, Err(Error::AlreadyListening));
        assert!(client.is_listening());

        let sender = sender().await;
        sender
            .send_to(b"single", ("127.0.0.1", port))
            .await
            .unwrap();
        assert_eq!(next_datagram(&mut inbound).await.payload, b"single");
        assert!(
            timeout(SILENCE, inbound.next()).await.is_err(),
            "a datagram must be delivered once"
        );

        client.exit().await;
    }

    pub async fn test_bind_conflict<T, S>(make_client: impl FnOnce(u16) -> (T, S), port: u16)
    where
        T: DatagramTransport,
        S: Stream<Item = Datagram> + Unpin,
    {
        let blocker = UdpSocket::bind(("0.0.0.0", port)).await.unwrap();
        let (mut client, _inbound) = make_client(port);

        assert_eq!(client.start_listening().await, Err(Error::InvalidAddress));
        assert!(!client.is_listening());

        drop(blocker);
        client.start_listening().await.unwrap();
        assert!(client.is_listening());

        client.exit().await;
    }

    pub async fn test_prompt_shutdown<T, S>(make_client: impl FnOnce(u16) -> (T, S), port: u16)
    where
        T: DatagramTransport,
        S: Stream<Item = Datagram> + Unpin,
    {
        let (mut client, _inbound) = make_client(port);

        client.stop_listening().await;
        client.exit().await;
        assert!(!client.is_listening());

        // No datagram is ever sent, so the receive loop stays blocked waiting for one.
        client.start_listening().await.unwrap();
        timeout(Duration::from_secs(1), client.stop_listening())
            .await
            .expect("stop did not interrupt the blocked receive loop");
        assert!(!client.is_listening());

        client.stop_listening().await;
        client.exit().await;
    }

    pub async fn test_receive_in_order<T, S>(make_client: impl FnOnce(u16) -> (T, S), port: u16)
    where
        T: DatagramTransport,
        S: Stream<Item = Datagram> + Unpin,
    {
        let (mut client, mut inbound) = make_client(port);
        client.start_listening().await.unwrap();

        let sender = sender().await;
        for index in 0..16u8 {
            sender
                .send_to(&[index, index, index], ("127.0.0.1", port))
                .await
                .unwrap();
        }

        for index in 0..16u8 {
            assert_eq!(
                next_datagram(&mut inbound).await.payload,
                [index, index, index]
            );
        }

        client.exit().await;
    }
}
