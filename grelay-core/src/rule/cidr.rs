//! CIDR notation parsing and containment checks.
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CidrParseError {
    #[error("'{0}' is missing the '/<prefix>' suffix")]
    MissingPrefix(String),
    #[error("'{0}' does not start with a valid IP address")]
    InvalidAddress(String),
    #[error("'{cidr}' has a prefix length out of range (max {max})")]
    InvalidPrefix { cidr: String, max: u8 },
}

/// An IP network, e.g. `192.168.0.0/24` or `fd00::/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn network(&self) -> IpAddr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `ip` belongs to this network.
    ///
    /// IPv4-mapped IPv6 addresses are compared as IPv4. Addresses of the other family never match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let mask = mask_v4(self.prefix);
                u32::from(ip) & mask == u32::from(network)
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let mask = mask_v6(self.prefix);
                u128::from(ip) & mask == u128::from(network)
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = CidrParseError;

    /// Host bits are cleared, so `192.168.0.1/24` parses as `192.168.0.0/24`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = s
            .split_once('/')
            .ok_or_else(|| CidrParseError::MissingPrefix(s.to_string()))?;

        let address: IpAddr = address
            .parse()
            .map_err(|_| CidrParseError::InvalidAddress(s.to_string()))?;

        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };

        let prefix = prefix
            .parse::<u8>()
            .ok()
            .filter(|prefix| *prefix <= max)
            .ok_or_else(|| CidrParseError::InvalidPrefix {
                cidr: s.to_string(),
                max,
            })?;

        let network = match address {
            IpAddr::V4(v4) => IpAddr::from((u32::from(v4) & mask_v4(prefix)).to_be_bytes()),
            IpAddr::V6(v6) => IpAddr::from((u128::from(v6) & mask_v6(prefix)).to_be_bytes()),
        };

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask_v4(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0)
}

fn mask_v6(prefix: u8) -> u128 {
    u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0)
}
