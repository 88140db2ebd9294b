//! The NetSDR transport abstraction API.
//!
//! Defines the contract shared by the stream (TCP) and datagram (UDP) transports used to talk to a
//! NetSDR receiver. Payloads are opaque byte sequences; framing and device protocol live above this
//! layer.

#![forbid(unsafe_code)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod net;

pub use net::datagram::{self, Datagram, DatagramTransport};
pub use net::stream::{self, StreamTransport};
