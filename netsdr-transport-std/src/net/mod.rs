//! Network transports for the std platform.

pub mod datagram;
pub mod stream;
