//! Network transport abstractions.
//!
//! Provides platform-agnostic traits for the two socket disciplines used by the client.

pub mod datagram;
pub mod stream;
