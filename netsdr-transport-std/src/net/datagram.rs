//! UDP datagram transport implementation for the std platform.

use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};

use netsdr_transport_api::datagram::{Datagram, DatagramTransport, Error};
use socket2::{Domain, Protocol, SockAddr, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{DEFAULT_CHANNEL_CAPACITY, Inbound, IntoTransportError};

/// Largest possible UDP payload; the receive buffer is sized so no datagram is ever truncated.
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Configuration of a [`DatagramTransportClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramTransportConfig {
    /// The local endpoint to bind.
    pub local: SocketAddr,
    /// Kernel receive buffer size (`SO_RCVBUF`); `None` keeps the OS default.
    pub receive_buffer_size: Option<usize>,
    /// Capacity of the inbound datagram channel.
    pub channel_capacity: usize,
}

impl DatagramTransportConfig {
    /// Creates a configuration listening on `port` on all IPv4 interfaces.
    pub fn new(port: u16) -> Self {
        Self {
            local: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            receive_buffer_size: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Binds `local` instead of all interfaces.
    pub fn with_local(mut self, local: SocketAddr) -> Self {
        self.local = local;
        self
    }

    /// Requests a kernel receive buffer of `size` bytes.
    pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = Some(size);
        self
    }

    /// Sets the inbound channel capacity (at least one datagram).
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

/// Stops the receive loop of a [`DatagramTransportClient`] from another task.
///
/// The socket is released once the loop has observed the request; the client reports
/// [`DatagramTransportClient::is_listening`] as `false` immediately.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    /// Asks the receive loop to stop.
    pub fn stop(&self) {
        self.0.cancel();
    }

    /// Waits until the receive loop has been asked to stop.
    pub async fn stopped(&self) {
        self.0.cancelled().await;
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Listening(Listener),
}

/// A bound socket and the receive loop owning it.
#[derive(Debug)]
struct Listener {
    local: SocketAddr,
    shutdown: CancellationToken,
    receiver: JoinHandle<()>,
}

impl Listener {
    fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.receiver.is_finished()
    }

    /// Stops the receive loop and waits for it to exit, which releases the socket.
    async fn stop(mut self) {
        self.shutdown.cancel();
        let _ = (&mut self.receiver).await;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.receiver.abort();
    }
}

/// Client for a connectionless transport receiving on a fixed local port.
///
/// Every datagram received while listening is delivered on the [`Inbound`] stream returned by the
/// constructor, in arrival order, together with its source address.
///
/// Two clients compare equal when their configured local endpoints render identically, which
/// allows using clients as map keys.
///
/// # Example
///
/// ```no_run
/// use netsdr_transport_std::DatagramTransportClient;
/// use tokio_stream::StreamExt;
///
/// # async fn example() -> Result<(), netsdr_transport_api::datagram::Error> {
/// let (mut client, mut inbound) = DatagramTransportClient::new(60000);
/// client.start_listening().await?;
/// while let Some(datagram) = inbound.next().await {
///     println!("{} bytes from {}", datagram.payload.len(), datagram.source);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DatagramTransportClient {
    config: DatagramTransportConfig,
    state: State,
    inbound: mpsc::Sender<Datagram>,
}

impl DatagramTransportClient {
    /// Creates a client listening on `port` on all interfaces.
    pub fn new(port: u16) -> (Self, Inbound<Datagram>) {
        Self::with_config(DatagramTransportConfig::new(port))
    }

    /// Creates a client from a full configuration.
    pub fn with_config(config: DatagramTransportConfig) -> (Self, Inbound<Datagram>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity.max(1));
        let client = Self {
            config,
            state: State::Idle,
            inbound: inbound_tx,
        };
        (client, Inbound::new(inbound_rx))
    }

    /// Returns the configuration this client was created with.
    pub fn config(&self) -> &DatagramTransportConfig {
        &self.config
    }

    /// Returns the configured local endpoint.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.config.local
    }

    /// Returns the address the socket is actually bound to while listening.
    ///
    /// Differs from [`Self::local_endpoint`] when port `0` was configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            State::Listening(listener) if listener.is_alive() => Some(listener.local),
            _ => None,
        }
    }

    /// Returns whether the receive loop is running.
    pub fn is_listening(&self) -> bool {
        matches!(&self.state, State::Listening(listener) if listener.is_alive())
    }

    /// Returns a handle to stop the current receive loop from elsewhere.
    pub fn stop_handle(&self) -> Option<StopHandle> {
        match &self.state {
            State::Listening(listener) if listener.is_alive() => {
                Some(StopHandle(listener.shutdown.clone()))
            }
            _ => None,
        }
    }

    /// Binds the local endpoint and starts the receive loop.
    ///
    /// Returns once the socket is bound. Starting again while listening is rejected with
    /// [`Error::AlreadyListening`]; a bind failure is logged and returned.
    #[tracing::instrument(skip(self), fields(local = %self.config.local))]
    pub async fn start_listening(&mut self) -> Result<(), Error> {
        self.release_stopped().await;

        if self.is_listening() {
            tracing::warn!("already listening, ignoring start request");
            return Err(Error::AlreadyListening);
        }

        let (socket, local) = match bind(&self.config) {
            Ok(bound) => bound,
            Err(error) => {
                tracing::warn!(%error, "failed to bind");
                return Err(error.into_transport_error());
            }
        };

        let shutdown = CancellationToken::new();
        let receiver = tokio::spawn(
            receive_loop(socket, self.inbound.clone(), shutdown.clone())
                .instrument(tracing::info_span!("datagram_receive", %local)),
        );

        tracing::info!(%local, "listening");
        self.state = State::Listening(Listener {
            local,
            shutdown,
            receiver,
        });

        Ok(())
    }

    /// Waits until the current receive loop has been asked to stop.
    ///
    /// Returns immediately when not listening.
    pub async fn stopped(&self) {
        if let State::Listening(listener) = &self.state {
            listener.shutdown.cancelled().await;
        }
    }

    /// Stops the receive loop and releases the socket.
    #[tracing::instrument(skip(self), fields(local = %self.config.local))]
    pub async fn stop_listening(&mut self) {
        match self.take_listener() {
            Some(listener) => {
                listener.stop().await;
                tracing::info!("stopped listening");
            }
            None => {
                tracing::debug!("not listening");
            }
        }
    }

    /// Stops the receive loop and releases the socket without diagnostics.
    pub async fn exit(&mut self) {
        if let Some(listener) = self.take_listener() {
            listener.stop().await;
        }
    }

    fn take_listener(&mut self) -> Option<Listener> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Listening(listener) => Some(listener),
            State::Idle => None,
        }
    }

    /// Moves to [`State::Idle`] if the receive loop was stopped through a [`StopHandle`].
    async fn release_stopped(&mut self) {
        if self.is_listening() {
            return;
        }
        if let Some(listener) = self.take_listener() {
            listener.stop().await;
        }
    }
}

// Identity is the rendered endpoint, not the socket state.
impl PartialEq for DatagramTransportClient {
    fn eq(&self, other: &Self) -> bool {
        self.config.local.to_string() == other.config.local.to_string()
    }
}

impl Eq for DatagramTransportClient {}

impl Hash for DatagramTransportClient {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.config.local.to_string().hash(state);
    }
}

impl DatagramTransport for DatagramTransportClient {
    async fn start_listening(&mut self) -> Result<(), Error> {
        DatagramTransportClient::start_listening(self).await
    }

    async fn stop_listening(&mut self) {
        DatagramTransportClient::stop_listening(self).await
    }

    async fn exit(&mut self) {
        DatagramTransportClient::exit(self).await
    }

    fn is_listening(&self) -> bool {
        DatagramTransportClient::is_listening(self)
    }

    fn local_endpoint(&self) -> SocketAddr {
        DatagramTransportClient::local_endpoint(self)
    }
}

/// Creates a non-blocking UDP socket bound to the configured endpoint.
fn bind(config: &DatagramTransportConfig) -> std::io::Result<(UdpSocket, SocketAddr)> {
    // `socket2` gives access to `SO_RCVBUF` before binding, which neither Tokio nor the standard
    // library expose for UDP sockets.
    let socket = socket2::Socket::new(
        Domain::for_address(config.local),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;

    if let Some(size) = config.receive_buffer_size {
        socket.set_recv_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(config.local))?;

    let socket = UdpSocket::from_std(socket.into())?;
    let local = socket.local_addr()?;
    Ok((socket, local))
}

/// Receives datagrams until cancelled.
///
/// Receive errors are logged and do not end the loop.
async fn receive_loop(
    socket: UdpSocket,
    inbound: mpsc::Sender<Datagram>,
    shutdown: CancellationToken,
) {
    tracing::debug!("receive loop started");

    let mut buffer = vec![0; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        match received {
            Ok((length, source)) => {
                tracing::trace!(%source, length, "datagram received");
                let datagram = Datagram {
                    payload: buffer[..length].to_vec(),
                    source,
                };
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    sent = inbound.send(datagram) => {
                        if sent.is_err() {
                            tracing::trace!(length, "inbound stream dropped, discarding datagram");
                        }
                    }
                }
            }
            Err(error) => {
                tracing::error!(%error, "failed to receive datagram");
            }
        }
    }

    tracing::debug!("receive loop stopped");
}

impl IntoTransportError<Error> for std::io::Error {
    fn into_transport_error(self) -> Error {
        match self.kind() {
            ErrorKind::PermissionDenied => Error::PermissionDenied,
            ErrorKind::AddrInUse => Error::InvalidAddress,
            ErrorKind::AddrNotAvailable => Error::InvalidAddress,
            ErrorKind::InvalidInput => Error::InvalidAddress,
            ErrorKind::NetworkDown => Error::NetworkDown,
            _ => Error::Other,
        }
    }
}
