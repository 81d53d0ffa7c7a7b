/// Security group rule model and the cluster access-control topology
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod topology;

pub use topology::{EndpointAccess, SecurityRefs, SecurityTopology};

use crate::config::CustomIngressRule;
use crate::network::Ipv4Cidr;

/// Kubernetes NodePort service range
pub const NODE_PORT_RANGE: (u16, u16) = (30000, 32767);

/// Ephemeral range used by kubelet and kube-proxy
pub const KUBELET_PORT_RANGE: (u16, u16) = (1025, 65535);

/// IP protocol of a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    All,
}

impl Protocol {
    /// Value of the `IpProtocol` property
    pub fn ip_protocol(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::All => "-1",
        }
    }
}

/// Protocol plus port range, `All` ignores ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    pub protocol: Protocol,
    pub from: u16,
    pub to: u16,
}

impl Port {
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            from: port,
            to: port,
        }
    }

    pub fn tcp_range(from: u16, to: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            from,
            to,
        }
    }

    pub fn all_traffic() -> Self {
        Self {
            protocol: Protocol::All,
            from: 0,
            to: 65535,
        }
    }

    /// Whether traffic to `port` over TCP matches this rule
    pub fn covers_tcp(&self, port: u16) -> bool {
        match self.protocol {
            Protocol::All => true,
            Protocol::Tcp => self.from <= port && port <= self.to,
            Protocol::Udp => false,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::All => write!(f, "all traffic"),
            p if self.from == self.to => write!(f, "{} {}", p.ip_protocol(), self.from),
            p => write!(f, "{} {}-{}", p.ip_protocol(), self.from, self.to),
        }
    }
}

/// The three access groups of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupRole {
    ControlPlane,
    Worker,
    LoadBalancer,
}

impl GroupRole {
    pub fn logical_id(&self) -> &'static str {
        match self {
            GroupRole::ControlPlane => "ClusterSecurityGroup",
            GroupRole::Worker => "NodeGroupSecurityGroup",
            GroupRole::LoadBalancer => "AlbSecurityGroup",
        }
    }
}

impl fmt::Display for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRole::ControlPlane => write!(f, "cluster"),
            GroupRole::Worker => write!(f, "nodegroup"),
            GroupRole::LoadBalancer => write!(f, "alb"),
        }
    }
}

/// The other side of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peer {
    Cidr(Ipv4Cidr),
    Group(GroupRole),
    SecurityGroupId(String),
    /// The address range of the cluster VPC
    VpcCidr,
}

impl Peer {
    pub fn any_ipv4() -> Self {
        Peer::Cidr(Ipv4Cidr::ANY)
    }

    /// Parse a CIDR or an `sg-` id
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.starts_with("sg-") {
            return Ok(Peer::SecurityGroupId(value.to_string()));
        }
        let cidr: Ipv4Cidr = value
            .parse()
            .with_context(|| format!("Invalid rule peer: {}", value))?;
        Ok(Peer::Cidr(cidr))
    }

    /// Whether the peer is the open internet
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Peer::Cidr(cidr) if cidr.is_any())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

/// One directional permission owned by an access group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub direction: Direction,
    pub peer: Peer,
    pub port: Port,
    pub description: String,
}

impl Rule {
    pub fn ingress(peer: Peer, port: Port, description: impl Into<String>) -> Self {
        Self {
            direction: Direction::Ingress,
            peer,
            port,
            description: description.into(),
        }
    }

    pub fn egress(peer: Peer, port: Port, description: impl Into<String>) -> Self {
        Self {
            direction: Direction::Egress,
            peer,
            port,
            description: description.into(),
        }
    }

    /// Convert a configured custom rule; `index` is zero-based
    pub fn from_custom(rule: &CustomIngressRule, index: usize) -> Result<Self> {
        let peer = Peer::parse(&rule.source)?;
        let port = match rule.protocol {
            Protocol::All => Port::all_traffic(),
            protocol => {
                let from = rule.port.with_context(|| {
                    format!("Custom rule {} needs a port for {:?}", index + 1, protocol)
                })?;
                let to = rule.to_port.unwrap_or(from);
                if to < from {
                    anyhow::bail!("Custom rule {} has port range {}-{}", index + 1, from, to);
                }
                Port { protocol, from, to }
            }
        };
        let description = rule
            .description
            .clone()
            .unwrap_or_else(|| format!("Custom rule {}", index + 1));
        Ok(Rule::ingress(peer, port, description))
    }
}

/// A security group this stack creates, with every rule it owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGroup {
    pub role: GroupRole,
    pub description: String,
    pub allow_all_outbound: bool,
    pub rules: Vec<Rule>,
}

impl AccessGroup {
    pub fn new(role: GroupRole, description: impl Into<String>) -> Self {
        Self {
            role,
            description: description.into(),
            allow_all_outbound: true,
            rules: vec![],
        }
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn ingress(&self) -> impl Iterator<Item = &Rule> {
        self.rules
            .iter()
            .filter(|r| r.direction == Direction::Ingress)
    }

    pub fn egress(&self) -> impl Iterator<Item = &Rule> {
        self.rules
            .iter()
            .filter(|r| r.direction == Direction::Egress)
    }

    /// Whether any inbound rule lets the open internet reach port 22
    pub fn allows_ssh_from_anywhere(&self) -> bool {
        self.ingress()
            .any(|r| r.peer.is_unrestricted() && r.port.covers_tcp(22))
    }
}

/// Detect the caller's public IPv4 address
pub async fn current_public_ip() -> Result<Ipv4Cidr> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")?;
    let response = client
        .get("https://ipv4.icanhazip.com")
        .send()
        .await
        .context("Failed to get current IP address")?
        .error_for_status()
        .context("IP detection service returned an error")?;

    let ip = response
        .text()
        .await
        .context("Failed to read IP address response")?;
    let address: std::net::Ipv4Addr = ip
        .trim()
        .parse()
        .with_context(|| format!("Unexpected IP address response: {}", ip.trim()))?;

    Ok(Ipv4Cidr::host(address))
}
