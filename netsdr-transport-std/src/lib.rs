//! Std transport implementation for the NetSDR client.
//!
//! This provides the stream and datagram transports described by [`netsdr_transport_api`], using
//! Tokio sockets and one background receive task per active transport.

#![forbid(unsafe_code)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod address;
pub mod net;

pub use address::{RemoteAddress, RemoteAddressParseError};
pub use net::datagram::{DatagramTransportClient, DatagramTransportConfig, StopHandle};
pub use net::stream::{StreamTransportClient, StreamTransportConfig};
pub use netsdr_transport_api::{Datagram, DatagramTransport, StreamTransport};

/// Stream of inbound messages produced by a transport's receive loop.
///
/// Yields messages in the order the transport delivered them. The stream only ends once the
/// transport itself has been dropped.
///
/// One stream serves every session of its transport: messages still unread when a connection is
/// closed or listening stops are yielded before those of the next session.
pub type Inbound<T> = tokio_stream::wrappers::ReceiverStream<T>;

/// Default capacity of the inbound message channel.
///
/// A full channel pauses the receive loop, so the transport's own buffering takes over.
pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// Helper trait to convert errors into transport errors.
///
/// We cannot implement `From` as that would be part of the public API.
pub(crate) trait IntoTransportError<E>
where
    E: core::error::Error,
{
    /// Converts the error into a transport error.
    fn into_transport_error(self) -> E;
}
