//! Remote endpoint addressing for the stream transport.

use std::fmt::{self, Display, Formatter};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// A parsed-but-not-resolved `host:port` pair naming the remote device.
///
/// The host may be a hostname or an IP literal; resolution happens on every connect so a device
/// that changes address between sessions is picked up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    host: String,
    port: u16,
}

impl RemoteAddress {
    /// Creates a remote address without validating the host.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the hostname or IP literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns this as something that can be used with Tokio's [`tokio::net::ToSocketAddrs`].
    ///
    /// `ToSocketAddrs` is sealed so we must return a helper instead of implementing it directly.
    pub(crate) fn as_to_socket_addrs(&self) -> impl tokio::net::ToSocketAddrs + '_ {
        (self.host.as_str(), self.port)
    }
}

impl From<SocketAddr> for RemoteAddress {
    fn from(address: SocketAddr) -> Self {
        Self::new(address.ip().to_string(), address.port())
    }
}

impl Display for RemoteAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let RemoteAddress { host, port } = self;
        // IPv6 literals need brackets to keep the port separator unambiguous.
        if host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{host}]:{port}")
        } else {
            write!(f, "{host}:{port}")
        }
    }
}

/// Errors that can occur when parsing a [`RemoteAddress`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteAddressParseError {
    /// Missing ':' separator between host and port.
    #[error("missing ':' separator")]
    MissingSeparator,

    /// Invalid port number format.
    #[error("invalid port number")]
    InvalidPortNumber(#[source] std::num::ParseIntError),

    /// Invalid hostname format.
    #[error("invalid hostname: {0}")]
    InvalidHostname(&'static str),
}

/// Checks a hostname against RFC 1123 label syntax.
fn validate_hostname(host: &str) -> Result<(), RemoteAddressParseError> {
    let invalid = RemoteAddressParseError::InvalidHostname;

    if host.is_empty() {
        return Err(invalid("is empty"));
    }
    if host.len() > 253 {
        return Err(invalid("is too long"));
    }

    // A trailing `.` is allowed for fully qualified names.
    for label in host.strip_suffix('.').unwrap_or(host).split('.') {
        if label.is_empty() {
            return Err(invalid("contains empty label"));
        }
        if label.len() > 63 {
            return Err(invalid("label too long"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with dash"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("label contains disallowed character"));
        }
    }

    Ok(())
}

impl FromStr for RemoteAddress {
    type Err = RemoteAddressParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let (host, port) = string
            .rsplit_once(':')
            .ok_or(RemoteAddressParseError::MissingSeparator)?;

        let port = port
            .parse()
            .map_err(RemoteAddressParseError::InvalidPortNumber)?;

        if let Some(literal) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            return match literal.parse::<Ipv6Addr>() {
                Ok(_) => Ok(Self::new(literal, port)),
                Err(_) => Err(RemoteAddressParseError::InvalidHostname(
                    "invalid IPv6 literal",
                )),
            };
        }

        // Unbracketed IPv6 literals are rejected here by the hostname rules.
        if host.parse::<Ipv4Addr>().is_err() {
            validate_hostname(host)?;
        }

        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::{RemoteAddress, RemoteAddressParseError};
    use std::net::SocketAddr;
    use std::str::FromStr;

    #[test]
    fn remote_address_parsing() {
        let address = RemoteAddress::from_str("127.0.0.1:50000").unwrap();
        assert_eq!(address.host(), "127.0.0.1");
        assert_eq!(address.port(), 50000);

        let address = RemoteAddress::from_str("sdr-receiver.local.:50000").unwrap();
        assert_eq!(address.host(), "sdr-receiver.local.");

        let address = RemoteAddress::from_str("[2001:db8::cafe]:8888").unwrap();
        assert_eq!(address.host(), "2001:db8::cafe");
        assert_eq!(address.port(), 8888);

        assert_eq!(
            RemoteAddress::from_str(""),
            Err(RemoteAddressParseError::MissingSeparator)
        );
        assert_eq!(
            RemoteAddress::from_str("localhost"),
            Err(RemoteAddressParseError::MissingSeparator)
        );
        assert!(matches!(
            RemoteAddress::from_str("localhost:http"),
            Err(RemoteAddressParseError::InvalidPortNumber(_)),
        ));
        assert!(matches!(
            RemoteAddress::from_str("localhost:70000"),
            Err(RemoteAddressParseError::InvalidPortNumber(_)),
        ));
        assert!(matches!(
            RemoteAddress::from_str(":80"),
            Err(RemoteAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            RemoteAddress::from_str("2001:db8::cafe:80"),
            Err(RemoteAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            RemoteAddress::from_str("[not-v6]:80"),
            Err(RemoteAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            RemoteAddress::from_str("-receiver.local:80"),
            Err(RemoteAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            RemoteAddress::from_str("receiver..local:80"),
            Err(RemoteAddressParseError::InvalidHostname(_)),
        ));
        assert!(matches!(
            RemoteAddress::from_str("receiver_1:80"),
            Err(RemoteAddressParseError::InvalidHostname(_)),
        ));
    }

    #[test]
    fn remote_address_display_round_trips() {
        for text in ["127.0.0.1:50000", "[::1]:50000", "receiver.local:50000"] {
            assert_eq!(RemoteAddress::from_str(text).unwrap().to_string(), text);
        }

        let socket: SocketAddr = "[::1]:7".parse().unwrap();
        assert_eq!(RemoteAddress::from(socket).to_string(), "[::1]:7");
    }
}
