/// IPv4 CIDR arithmetic for subnet planning and rule peers
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// `0.0.0.0/0`
    pub const ANY: Ipv4Cidr = Ipv4Cidr {
        network: Ipv4Addr::UNSPECIFIED,
        prefix: 0,
    };

    /// Create a CIDR; host bits must be zero
    pub fn new(network: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            anyhow::bail!("Invalid prefix length /{}", prefix);
        }
        let cidr = Self { network, prefix };
        if u32::from(network) & !cidr.mask() != 0 {
            anyhow::bail!(
                "{}/{} has host bits set (did you mean {}/{}?)",
                network,
                prefix,
                Ipv4Addr::from(u32::from(network) & cidr.mask()),
                prefix
            );
        }
        Ok(cidr)
    }

    /// A single host, `/32`
    pub fn host(address: Ipv4Addr) -> Self {
        Self {
            network: address,
            prefix: 32,
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    fn first(&self) -> u32 {
        u32::from(self.network)
    }

    fn last(&self) -> u32 {
        self.first() | !self.mask()
    }

    /// Whether this CIDR covers every IPv4 address
    pub fn is_any(&self) -> bool {
        self.prefix == 0
    }

    /// Whether `other` lies entirely inside this network
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        self.first() <= other.first() && other.last() <= self.last()
    }

    /// Whether the two networks share at least one address
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }

    /// The `index`-th subnet of length `new_prefix` inside this network
    pub fn subnet(&self, new_prefix: u8, index: u32) -> Result<Ipv4Cidr> {
        if new_prefix < self.prefix || new_prefix > 32 {
            anyhow::bail!(
                "Cannot carve /{} subnets out of {}",
                new_prefix,
                self
            );
        }

        let available = 1u64 << (new_prefix - self.prefix);
        if u64::from(index) >= available {
            anyhow::bail!(
                "{} only has room for {} /{} subnets, subnet #{} requested",
                self,
                available,
                new_prefix,
                index + 1
            );
        }

        let size = 1u64 << (32 - new_prefix);
        let start = u64::from(self.first()) + u64::from(index) * size;
        Self::new(Ipv4Addr::from(start as u32), new_prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (address, prefix) = s
            .trim()
            .split_once('/')
            .with_context(|| format!("Invalid CIDR notation: {}", s))?;
        let address: Ipv4Addr = address
            .parse()
            .with_context(|| format!("Invalid IPv4 address in CIDR: {}", s))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("Invalid prefix length in CIDR: {}", s))?;
        Self::new(address, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(cidr("10.0.0.0/16").to_string(), "10.0.0.0/16");
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.1/16".parse::<Ipv4Cidr>().is_err());
        assert!("300.0.0.0/8".parse::<Ipv4Cidr>().is_err());
        assert!(cidr("0.0.0.0/0").is_any());
    }

    #[test]
    fn test_subnets() {
        let vpc = cidr("10.0.0.0/16");
        assert_eq!(vpc.subnet(24, 0).unwrap(), cidr("10.0.0.0/24"));
        assert_eq!(vpc.subnet(24, 5).unwrap(), cidr("10.0.5.0/24"));
        assert!(vpc.subnet(24, 256).is_err());
        assert!(vpc.subnet(8, 0).is_err());
    }

    #[test]
    fn test_overlap_and_containment() {
        let vpc = cidr("10.0.0.0/16");
        assert!(vpc.contains(&cidr("10.0.3.0/24")));
        assert!(!vpc.contains(&cidr("10.1.0.0/24")));
        assert!(cidr("10.0.0.0/23").overlaps(&cidr("10.0.1.0/24")));
        assert!(!cidr("10.0.0.0/24").overlaps(&cidr("10.0.1.0/24")));
        assert!(Ipv4Cidr::ANY.contains(&vpc));
    }

    #[test]
    fn test_serde_as_string() {
        let value: Ipv4Cidr = serde_json::from_str("\"192.168.0.0/24\"").unwrap();
        assert_eq!(value, cidr("192.168.0.0/24"));
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"192.168.0.0/24\"");
    }
}
