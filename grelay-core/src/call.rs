//! # Inbound Call
//!
//! A read-only view over the parts of an inbound gRPC call that routing decisions depend on:
//! the method path, the transport peer and the request metadata.
use std::net::{IpAddr, SocketAddr};
use tonic::metadata::MetadataMap;

/// Metadata key set by an HTTP/JSON gateway in front of the server, carrying the `ip:port`
/// of the client that originated the call.
pub const FORWARDED_REMOTE_ADDR: &str = "x-forwarded-remote-addr";

/// Metadata key carrying the chain of addresses a call was forwarded through.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone, Copy)]
pub struct InboundCall<'a> {
    method: &'a str,
    peer: Option<SocketAddr>,
    metadata: &'a MetadataMap,
}

impl<'a> InboundCall<'a> {
    /// # Arguments
    ///
    /// * `method` - The fully qualified method path (e.g. `/my.package.Service/Method`).
    /// * `peer` - The transport address of the connection the call arrived on, if known.
    /// * `metadata` - The request metadata (headers) sent by the caller.
    pub fn new(method: &'a str, peer: Option<SocketAddr>, metadata: &'a MetadataMap) -> Self {
        Self {
            method,
            peer,
            metadata,
        }
    }

    pub fn method(&self) -> &'a str {
        self.method
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn metadata(&self) -> &'a MetadataMap {
        self.metadata
    }

    /// Returns the IP address of the client that originated the call.
    ///
    /// Addresses injected by a gateway take precedence over the transport peer, in this order:
    /// `x-forwarded-remote-addr`, the first hop of `x-forwarded-for`, the peer address.
    /// IPv4-mapped IPv6 addresses are returned as plain IPv4 addresses.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        let forwarded = self
            .ascii_value(FORWARDED_REMOTE_ADDR)
            .and_then(parse_addr)
            .or_else(|| {
                self.ascii_value(FORWARDED_FOR)
                    .and_then(|hops| hops.split(',').next())
                    .and_then(parse_addr)
            });

        forwarded
            .or_else(|| self.peer.map(|peer| peer.ip()))
            .map(|ip| ip.to_canonical())
    }

    /// Returns every ascii value the caller sent for `key`.
    pub fn values(&self, key: &str) -> impl Iterator<Item = &'a str> {
        self.metadata
            .get_all(key)
            .iter()
            .filter_map(|value| value.to_str().ok())
    }

    fn ascii_value(&self, key: &str) -> Option<&'a str> {
        self.metadata.get(key).and_then(|value| value.to_str().ok())
    }
}

/// Parses either `ip:port` (`[v6]:port` for IPv6) or a bare IP.
fn parse_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();

    raw.parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .or_else(|_| raw.parse::<IpAddr>())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    fn metadata(pairs: &[(&'static str, &str)]) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        for (key, value) in pairs {
            metadata.append(*key, MetadataValue::try_from(*value).unwrap());
        }
        metadata
    }

    #[test]
    fn test_prefers_the_gateway_remote_address() {
        let md = metadata(&[
            (FORWARDED_REMOTE_ADDR, "192.168.0.1:1949"),
            (FORWARDED_FOR, "10.1.1.1"),
        ]);
        let peer = "127.0.0.1:5000".parse().ok();

        let call = InboundCall::new("/svc/Method", peer, &md);

        assert_eq!(call.remote_ip(), Some("192.168.0.1".parse().unwrap()));
    }

    #[test]
    fn test_falls_back_to_the_first_forwarded_hop() {
        let md = metadata(&[(FORWARDED_FOR, "10.1.1.1, 172.16.0.3")]);
        let peer = "127.0.0.1:5000".parse().ok();

        let call = InboundCall::new("/svc/Method", peer, &md);

        assert_eq!(call.remote_ip(), Some("10.1.1.1".parse().unwrap()));
    }

    #[test]
    fn test_falls_back_to_the_transport_peer() {
        let md = MetadataMap::new();
        let peer = "[::ffff:172.16.4.2]:5000".parse().ok();

        let call = InboundCall::new("/svc/Method", peer, &md);

        assert_eq!(call.remote_ip(), Some("172.16.4.2".parse().unwrap()));
    }

    #[test]
    fn test_ignores_unparseable_gateway_addresses() {
        let md = metadata(&[(FORWARDED_REMOTE_ADDR, "not-an-address")]);
        let call = InboundCall::new("/svc/Method", None, &md);

        assert_eq!(call.remote_ip(), None);
    }

    #[test]
    fn test_accepts_bracketed_ipv6_gateway_addresses() {
        let md = metadata(&[(FORWARDED_REMOTE_ADDR, "[fd00::7]:8080")]);
        let call = InboundCall::new("/svc/Method", None, &md);

        assert_eq!(call.remote_ip(), Some("fd00::7".parse().unwrap()));
    }

    #[test]
    fn test_lists_all_values_of_a_key() {
        let md = metadata(&[("tenant", "a"), ("tenant", "b"), ("other", "c")]);
        let call = InboundCall::new("/svc/Method", None, &md);

        assert_eq!(call.values("tenant").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(call.values("missing").count(), 0);
    }
}
