/// Builds the control plane, worker and load balancer security groups
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::{
    AccessGroup, Direction, GroupRole, Peer, Port, Rule, KUBELET_PORT_RANGE, NODE_PORT_RANGE,
};
use crate::config::SecurityConfig;
use crate::network::{Ipv4Cidr, NetworkRefs};
use crate::template::{reference, Resource, Template};

/// Exposure of the Kubernetes API endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointAccess {
    Private,
    PublicAndPrivate,
}

impl EndpointAccess {
    /// Pick the endpoint exposure; earlier guards take priority
    pub fn decide(config: &SecurityConfig) -> Self {
        if config.enable_vpc_endpoint_access {
            return EndpointAccess::Private;
        }
        if !config.allow_inbound_cidrs.is_empty() {
            return EndpointAccess::PublicAndPrivate;
        }
        EndpointAccess::Private
    }

    pub fn is_public(&self) -> bool {
        matches!(self, EndpointAccess::PublicAndPrivate)
    }
}

/// A group this stack owns, or one the caller passed in by id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupSource {
    Synthesized(AccessGroup),
    Supplied(String),
}

impl GroupSource {
    /// The synthesized group, `None` when it was supplied
    pub fn group(&self) -> Option<&AccessGroup> {
        match self {
            GroupSource::Synthesized(group) => Some(group),
            GroupSource::Supplied(_) => None,
        }
    }

    fn group_mut(&mut self) -> Option<&mut AccessGroup> {
        match self {
            GroupSource::Synthesized(group) => Some(group),
            GroupSource::Supplied(_) => None,
        }
    }
}

/// References to the three groups inside the template
#[derive(Debug, Clone)]
pub struct SecurityRefs {
    pub control_plane: Value,
    pub worker: Value,
    pub load_balancer: Value,
}

impl SecurityRefs {
    pub fn get(&self, role: GroupRole) -> &Value {
        match role {
            GroupRole::ControlPlane => &self.control_plane,
            GroupRole::Worker => &self.worker,
            GroupRole::LoadBalancer => &self.load_balancer,
        }
    }
}

/// The cluster's access-control topology
#[derive(Debug, Clone)]
pub struct SecurityTopology {
    pub control_plane: GroupSource,
    pub worker: GroupSource,
    pub load_balancer: GroupSource,
    pub endpoint_access: EndpointAccess,
    pub inbound_cidrs: Vec<Ipv4Cidr>,
}

impl SecurityTopology {
    /// Derive the three groups and the rules connecting them
    pub fn build(config: &SecurityConfig) -> Result<Self> {
        let inbound_cidrs = config
            .allow_inbound_cidrs
            .iter()
            .map(|c| c.parse::<Ipv4Cidr>().with_context(|| format!("Invalid inbound CIDR: {}", c)))
            .collect::<Result<Vec<Ipv4Cidr>>>()?;

        let existing = &config.existing_groups;
        let control_plane = match &existing.cluster {
            Some(id) => GroupSource::Supplied(id.clone()),
            None => GroupSource::Synthesized(control_plane_group(config, &inbound_cidrs)?),
        };
        let worker = match &existing.node_group {
            Some(id) => GroupSource::Supplied(id.clone()),
            None => GroupSource::Synthesized(worker_group()),
        };
        let load_balancer = match &existing.alb {
            Some(id) => GroupSource::Supplied(id.clone()),
            None => GroupSource::Synthesized(load_balancer_group(&inbound_cidrs)),
        };

        let mut topology = Self {
            control_plane,
            worker,
            load_balancer,
            endpoint_access: EndpointAccess::decide(config),
            inbound_cidrs,
        };
        topology.wire_groups(config.restrict_node_access);

        info!(
            "Security topology: endpoint {:?}, {} inbound CIDRs",
            topology.endpoint_access,
            topology.inbound_cidrs.len()
        );
        Ok(topology)
    }

    pub fn source(&self, role: GroupRole) -> &GroupSource {
        match role {
            GroupRole::ControlPlane => &self.control_plane,
            GroupRole::Worker => &self.worker,
            GroupRole::LoadBalancer => &self.load_balancer,
        }
    }

    fn source_mut(&mut self, role: GroupRole) -> &mut GroupSource {
        match role {
            GroupRole::ControlPlane => &mut self.control_plane,
            GroupRole::Worker => &mut self.worker,
            GroupRole::LoadBalancer => &mut self.load_balancer,
        }
    }

    /// Add a rule to `owner`; supplied groups are never modified
    fn add_rule(&mut self, owner: GroupRole, rule: Rule) {
        match self.source_mut(owner).group_mut() {
            Some(group) => group.add_rule(rule),
            None => debug!("Skipping rule on supplied {} group: {}", owner, rule.description),
        }
    }

    fn wire_groups(&mut self, restrict_node_access: bool) {
        let (kubelet_from, kubelet_to) = KUBELET_PORT_RANGE;
        let (node_port_from, node_port_to) = NODE_PORT_RANGE;

        self.add_rule(
            GroupRole::ControlPlane,
            Rule::egress(
                Peer::Group(GroupRole::Worker),
                Port::tcp(443),
                "Allow cluster to communicate with nodes on HTTPS",
            ),
        );
        self.add_rule(
            GroupRole::ControlPlane,
            Rule::egress(
                Peer::Group(GroupRole::Worker),
                Port::tcp_range(kubelet_from, kubelet_to),
                "Allow cluster to communicate with nodes on kubelet ports",
            ),
        );
        self.add_rule(
            GroupRole::Worker,
            Rule::egress(
                Peer::Group(GroupRole::ControlPlane),
                Port::tcp(443),
                "Allow nodes to communicate with cluster API",
            ),
        );
        self.add_rule(
            GroupRole::LoadBalancer,
            Rule::egress(
                Peer::Group(GroupRole::Worker),
                Port::tcp_range(node_port_from, node_port_to),
                "Allow ALB to communicate with NodePort services",
            ),
        );
        self.add_rule(
            GroupRole::Worker,
            Rule::ingress(
                Peer::Group(GroupRole::LoadBalancer),
                Port::tcp_range(node_port_from, node_port_to),
                "Allow ALB to reach NodePort services",
            ),
        );

        if restrict_node_access {
            self.add_rule(
                GroupRole::Worker,
                Rule::ingress(
                    Peer::Group(GroupRole::ControlPlane),
                    Port::tcp(22),
                    "Allow SSH only from cluster security group",
                ),
            );
        }
    }

    /// Open every port on the workers to the control plane (managed node groups)
    pub fn allow_control_plane_to_workers(&mut self) {
        self.add_rule(
            GroupRole::Worker,
            Rule::ingress(
                Peer::Group(GroupRole::ControlPlane),
                Port::all_traffic(),
                "Allow cluster to communicate with nodes",
            ),
        );
    }

    /// Add the synthesized groups and their rules to the template
    pub fn emit(
        &self,
        template: &mut Template,
        network: &NetworkRefs,
        cluster_name: &str,
    ) -> Result<SecurityRefs> {
        let refs = SecurityRefs {
            control_plane: group_ref(&self.control_plane, GroupRole::ControlPlane),
            worker: group_ref(&self.worker, GroupRole::Worker),
            load_balancer: group_ref(&self.load_balancer, GroupRole::LoadBalancer),
        };

        for role in [GroupRole::ControlPlane, GroupRole::Worker, GroupRole::LoadBalancer] {
            match self.source(role) {
                GroupSource::Synthesized(group) => {
                    emit_group(template, group, network, &refs, cluster_name)?
                }
                GroupSource::Supplied(id) => {
                    info!("Using supplied {} security group {}", role, id)
                }
            }
        }

        Ok(refs)
    }
}

fn control_plane_group(config: &SecurityConfig, inbound_cidrs: &[Ipv4Cidr]) -> Result<AccessGroup> {
    let mut group = AccessGroup::new(GroupRole::ControlPlane, "EKS Cluster Security Group");

    for (index, rule) in config.custom_ingress_rules.iter().enumerate() {
        group.add_rule(Rule::from_custom(rule, index)?);
    }

    for cidr in inbound_cidrs {
        group.add_rule(Rule::ingress(
            Peer::Cidr(*cidr),
            Port::tcp(443),
            format!("Allow HTTPS from {}", cidr),
        ));
    }

    if config.enable_vpc_endpoint_access {
        group.add_rule(Rule::ingress(
            Peer::VpcCidr,
            Port::tcp(443),
            "Allow VPC endpoint access",
        ));
    }

    Ok(group)
}

fn worker_group() -> AccessGroup {
    let (kubelet_from, kubelet_to) = KUBELET_PORT_RANGE;
    let mut group = AccessGroup::new(GroupRole::Worker, "EKS Node Group Security Group");

    group.add_rule(Rule::ingress(
        Peer::Group(GroupRole::Worker),
        Port::all_traffic(),
        "Allow nodes to communicate with each other",
    ));
    group.add_rule(Rule::ingress(
        Peer::Group(GroupRole::Worker),
        Port::tcp_range(kubelet_from, kubelet_to),
        "Allow kubelet and kube-proxy communication",
    ));

    group
}

fn load_balancer_group(inbound_cidrs: &[Ipv4Cidr]) -> AccessGroup {
    let (node_port_from, node_port_to) = NODE_PORT_RANGE;
    let mut group = AccessGroup::new(GroupRole::LoadBalancer, "ALB Security Group for EKS");

    group.add_rule(Rule::ingress(
        Peer::any_ipv4(),
        Port::tcp(80),
        "Allow HTTP from internet",
    ));
    group.add_rule(Rule::ingress(
        Peer::any_ipv4(),
        Port::tcp(443),
        "Allow HTTPS from internet",
    ));

    for cidr in inbound_cidrs {
        group.add_rule(Rule::ingress(
            Peer::Cidr(*cidr),
            Port::tcp_range(node_port_from, node_port_to),
            format!("Allow NodePort range from {}", cidr),
        ));
    }

    group
}

fn group_ref(source: &GroupSource, role: GroupRole) -> Value {
    match source {
        GroupSource::Synthesized(_) => reference(role.logical_id()),
        GroupSource::Supplied(id) => json!(id),
    }
}

fn port_properties(port: &Port, properties: &mut Map<String, Value>) {
    properties.insert("IpProtocol".to_string(), json!(port.protocol.ip_protocol()));
    if port.protocol != super::Protocol::All {
        properties.insert("FromPort".to_string(), json!(port.from));
        properties.insert("ToPort".to_string(), json!(port.to));
    }
}

/// Rules against a CIDR or an external group id go inline; rules against
/// one of the three roles become standalone resources so the groups can
/// reference each other without a dependency cycle.
fn emit_group(
    template: &mut Template,
    group: &AccessGroup,
    network: &NetworkRefs,
    refs: &SecurityRefs,
    cluster_name: &str,
) -> Result<()> {
    let logical_id = group.role.logical_id();
    let mut inline_ingress = Vec::new();
    let mut inline_egress = Vec::new();

    if group.allow_all_outbound {
        inline_egress.push(json!({
            "IpProtocol": "-1",
            "CidrIp": Ipv4Cidr::ANY.to_string(),
            "Description": "Allow all outbound traffic by default",
        }));
    }

    let mut standalone = 0;
    for rule in &group.rules {
        let mut properties = Map::new();
        port_properties(&rule.port, &mut properties);
        properties.insert("Description".to_string(), json!(rule.description));

        let (cidr_key, group_key) = match rule.direction {
            Direction::Ingress => ("CidrIp", "SourceSecurityGroupId"),
            Direction::Egress => ("CidrIp", "DestinationSecurityGroupId"),
        };

        match &rule.peer {
            Peer::Cidr(cidr) => {
                properties.insert(cidr_key.to_string(), json!(cidr.to_string()));
            }
            Peer::VpcCidr => {
                properties.insert(cidr_key.to_string(), network.vpc_cidr.clone());
            }
            Peer::SecurityGroupId(id) => {
                properties.insert(group_key.to_string(), json!(id));
            }
            Peer::Group(peer) => {
                standalone += 1;
                properties.insert("GroupId".to_string(), reference(logical_id));
                properties.insert(group_key.to_string(), refs.get(*peer).clone());

                let (resource_type, suffix) = match rule.direction {
                    Direction::Ingress => ("AWS::EC2::SecurityGroupIngress", "Ingress"),
                    Direction::Egress => ("AWS::EC2::SecurityGroupEgress", "Egress"),
                };
                template.add_resource(
                    format!("{}{}{}", logical_id, suffix, standalone),
                    Resource::new(resource_type, Value::Object(properties)),
                )?;
                continue;
            }
        }

        match rule.direction {
            Direction::Ingress => inline_ingress.push(Value::Object(properties)),
            Direction::Egress => inline_egress.push(Value::Object(properties)),
        }
    }

    template.add_resource(
        logical_id,
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": group.description,
                "VpcId": network.vpc_id,
                "SecurityGroupIngress": inline_ingress,
                "SecurityGroupEgress": inline_egress,
                "Tags": [{ "Key": "Name", "Value": format!("{}-{}-sg", cluster_name, group.role) }],
            }),
        ),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CustomIngressRule, ExistingSecurityGroups};
    use crate::security::Protocol;

    fn network() -> NetworkRefs {
        NetworkRefs {
            vpc_id: reference("Vpc"),
            vpc_cidr: crate::template::get_att("Vpc", "CidrBlock"),
            private_subnet_ids: vec![],
        }
    }

    fn config_with_cidrs(cidrs: &[&str]) -> SecurityConfig {
        SecurityConfig {
            allow_inbound_cidrs: cidrs.iter().map(|c| c.to_string()).collect(),
            ..SecurityConfig::default()
        }
    }

    #[test]
    fn test_endpoint_access_priority() {
        assert_eq!(
            EndpointAccess::decide(&SecurityConfig::default()),
            EndpointAccess::Private
        );

        let mut config = SecurityConfig {
            enable_vpc_endpoint_access: true,
            ..SecurityConfig::default()
        };
        assert_eq!(EndpointAccess::decide(&config), EndpointAccess::Private);

        config.enable_vpc_endpoint_access = false;
        config.allow_inbound_cidrs = vec!["203.0.113.0/24".to_string()];
        assert_eq!(EndpointAccess::decide(&config), EndpointAccess::PublicAndPrivate);

        // VPC endpoint access wins over explicit CIDRs
        config.enable_vpc_endpoint_access = true;
        assert_eq!(EndpointAccess::decide(&config), EndpointAccess::Private);
    }

    #[test]
    fn test_restricted_node_access_never_opens_ssh() {
        let config = SecurityConfig {
            restrict_node_access: true,
            ..config_with_cidrs(&["0.0.0.0/0", "10.20.0.0/16"])
        };
        let mut topology = SecurityTopology::build(&config).unwrap();
        topology.allow_control_plane_to_workers();

        let worker = topology.worker.group().unwrap();
        assert!(!worker.allows_ssh_from_anywhere());
        assert!(worker.ingress().any(|r| r.port == Port::tcp(22)
            && r.peer == Peer::Group(GroupRole::ControlPlane)));
    }

    #[test]
    fn test_control_plane_is_outbound_only_by_default() {
        let topology = SecurityTopology::build(&SecurityConfig::default()).unwrap();
        let control_plane = topology.control_plane.group().unwrap();
        assert!(control_plane.allow_all_outbound);
        assert_eq!(control_plane.ingress().count(), 0);
    }

    #[test]
    fn test_control_plane_inbound_rules() {
        let config = SecurityConfig {
            enable_vpc_endpoint_access: true,
            custom_ingress_rules: vec![CustomIngressRule {
                source: "sg-0feed".to_string(),
                protocol: Protocol::Tcp,
                port: Some(8443),
                to_port: None,
                description: None,
            }],
            ..config_with_cidrs(&["203.0.113.0/24"])
        };
        let topology = SecurityTopology::build(&config).unwrap();
        let control_plane = topology.control_plane.group().unwrap();

        let ingress: Vec<&Rule> = control_plane.ingress().collect();
        assert_eq!(ingress.len(), 3);
        assert!(ingress.iter().all(|r| r.port == Port::tcp(443) || r.port == Port::tcp(8443)));
        assert!(ingress.iter().any(|r| r.peer == Peer::VpcCidr));
        assert!(ingress.iter().all(|r| !r.peer.is_unrestricted()));
    }

    #[test]
    fn test_load_balancer_node_ports_only_for_configured_cidrs() {
        let topology =
            SecurityTopology::build(&config_with_cidrs(&["198.51.100.0/24"])).unwrap();
        let alb = topology.load_balancer.group().unwrap();

        let node_port_rules: Vec<&Rule> = alb
            .ingress()
            .filter(|r| r.port == Port::tcp_range(30000, 32767))
            .collect();
        assert_eq!(node_port_rules.len(), 1);
        assert_eq!(
            node_port_rules[0].peer,
            Peer::Cidr("198.51.100.0/24".parse().unwrap())
        );

        let open: Vec<&Rule> = alb.ingress().filter(|r| r.peer.is_unrestricted()).collect();
        assert_eq!(open.len(), 2);
    }

    #[test]
    fn test_supplied_groups_are_left_untouched() {
        let config = SecurityConfig {
            restrict_node_access: true,
            existing_groups: ExistingSecurityGroups {
                cluster: None,
                node_group: Some("sg-workers".to_string()),
                alb: None,
            },
            ..config_with_cidrs(&["203.0.113.0/24"])
        };
        let mut topology = SecurityTopology::build(&config).unwrap();
        topology.allow_control_plane_to_workers();
        assert_eq!(topology.worker, GroupSource::Supplied("sg-workers".to_string()));

        let mut template = Template::new("test");
        let refs = topology.emit(&mut template, &network(), "shop-dev-cluster").unwrap();
        assert_eq!(refs.worker, json!("sg-workers"));
        assert!(!template.contains("NodeGroupSecurityGroup"));

        // Nothing in the template may target the supplied group
        for resource_type in ["AWS::EC2::SecurityGroupIngress", "AWS::EC2::SecurityGroupEgress"] {
            for (_, resource) in template.resources_of_type(resource_type) {
                assert_ne!(resource.property("GroupId"), Some(&json!("sg-workers")));
            }
        }
    }

    #[test]
    fn test_emit_cross_group_rules() {
        let topology = SecurityTopology::build(&SecurityConfig::default()).unwrap();
        let mut template = Template::new("test");
        topology.emit(&mut template, &network(), "shop-dev-cluster").unwrap();

        assert_eq!(template.resources_of_type("AWS::EC2::SecurityGroup").count(), 3);

        let egress: Vec<_> = template
            .resources_of_type("AWS::EC2::SecurityGroupEgress")
            .map(|(_, r)| r)
            .collect();
        assert_eq!(egress.len(), 4);

        let alb_to_nodes = template.resource("AlbSecurityGroupEgress1").unwrap();
        assert_eq!(alb_to_nodes.property("FromPort").unwrap(), &json!(30000));
        assert_eq!(
            alb_to_nodes.property("DestinationSecurityGroupId").unwrap(),
            &reference("NodeGroupSecurityGroup")
        );

        let self_rule = template.resource("NodeGroupSecurityGroupIngress1").unwrap();
        assert_eq!(self_rule.property("IpProtocol").unwrap(), &json!("-1"));
        assert!(self_rule.property("FromPort").is_none());
    }
}
