//! Small validated types used at the edges of command construction, so a
//! malformed flag or peer-derived value fails fast as a [`Error::Configuration`]
//! rather than producing a broken shell command string later.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::Error;

/// Linux's interface-name length limit (`IFNAMSIZ`), including the
/// terminating null the kernel reserves.
const IFNAMSIZ: usize = 16;

/// A network interface name, validated against the kernel's own
/// constraints: non-empty, short enough for `IFNAMSIZ`, and free of `/`
/// and whitespace (both of which would corrupt a composed shell command).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceName(String);

impl InterfaceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for InterfaceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::Configuration("interface name must not be empty".into()));
        }
        if s.len() >= IFNAMSIZ {
            return Err(Error::Configuration(format!(
                "interface name {s:?} is too long (max {} chars)",
                IFNAMSIZ - 1
            )));
        }
        if s.chars().any(|c| c == '/' || c.is_whitespace()) {
            return Err(Error::Configuration(format!(
                "interface name {s:?} contains invalid characters"
            )));
        }
        Ok(InterfaceName(s.to_string()))
    }
}

impl fmt::Display for InterfaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a tunnel peer's `allowed-ips` list: an address paired with
/// its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedIp {
    pub address: IpAddr,
    pub cidr: u8,
}

impl AllowedIp {
    /// A single host route: the given address with a full-length prefix.
    pub fn host(address: IpAddr) -> Self {
        let cidr = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        AllowedIp { address, cidr }
    }
}

impl FromStr for AllowedIp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (addr, cidr) = s
            .split_once('/')
            .ok_or_else(|| Error::Configuration(format!("not a CIDR: {s:?}")))?;
        let address = addr
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid address in {s:?}")))?;
        let cidr = cidr
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid prefix length in {s:?}")))?;
        Ok(AllowedIp { address, cidr })
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.cidr)
    }
}
