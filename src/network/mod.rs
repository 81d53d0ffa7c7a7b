/// VPC and subnet planning
use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::info;

pub mod cidr;

pub use cidr::Ipv4Cidr;

use crate::config::NetworkConfig;
use crate::template::{get_att, reference, select_az, Resource, Template};

/// Planned address layout of the cluster VPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTopology {
    pub vpc_cidr: Ipv4Cidr,
    pub layout: SubnetLayout,
}

/// Where the subnets come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetLayout {
    /// Subnets carved out of a VPC this stack creates
    Planned {
        public: Vec<Ipv4Cidr>,
        private: Vec<Ipv4Cidr>,
        nat_gateways: u32,
    },

    /// An existing VPC, referenced by id
    Existing {
        vpc_id: String,
        private_subnet_ids: Vec<String>,
    },
}

/// Template references to the network, consumed by later components
#[derive(Debug, Clone)]
pub struct NetworkRefs {
    pub vpc_id: Value,
    pub vpc_cidr: Value,
    pub private_subnet_ids: Vec<Value>,
}

impl NetworkTopology {
    /// Plan the VPC layout and check it for overlaps
    pub fn plan(config: &NetworkConfig) -> Result<Self> {
        if let Some(existing) = &config.existing_vpc {
            let vpc_cidr: Ipv4Cidr = existing
                .cidr
                .parse()
                .context("Invalid existing VPC CIDR")?;
            if existing.private_subnet_ids.len() < 2 {
                anyhow::bail!("EKS needs at least two private subnets in the existing VPC");
            }
            return Ok(Self {
                vpc_cidr,
                layout: SubnetLayout::Existing {
                    vpc_id: existing.vpc_id.clone(),
                    private_subnet_ids: existing.private_subnet_ids.clone(),
                },
            });
        }

        let vpc_cidr: Ipv4Cidr = config.cidr.parse().context("Invalid VPC CIDR")?;

        if !(2..=6).contains(&config.max_azs) {
            anyhow::bail!("max_azs must be between 2 and 6, got {}", config.max_azs);
        }
        if config.nat_gateways == 0 || config.nat_gateways > config.max_azs {
            anyhow::bail!(
                "nat_gateways must be between 1 and max_azs ({}), got {}",
                config.max_azs,
                config.nat_gateways
            );
        }

        let azs = config.max_azs;
        let public = (0..azs)
            .map(|i| vpc_cidr.subnet(config.subnet_mask, i))
            .collect::<Result<Vec<_>>>()?;
        let private = (azs..azs * 2)
            .map(|i| vpc_cidr.subnet(config.subnet_mask, i))
            .collect::<Result<Vec<_>>>()?;

        let topology = Self {
            vpc_cidr,
            layout: SubnetLayout::Planned {
                public,
                private,
                nat_gateways: config.nat_gateways,
            },
        };
        topology.validate()?;
        Ok(topology)
    }

    /// Public and private ranges must not overlap and must fit in the VPC
    pub fn validate(&self) -> Result<()> {
        let SubnetLayout::Planned {
            public, private, ..
        } = &self.layout
        else {
            return Ok(());
        };

        let all: Vec<&Ipv4Cidr> = public.iter().chain(private.iter()).collect();
        for subnet in &all {
            if !self.vpc_cidr.contains(subnet) {
                anyhow::bail!("Subnet {} is outside VPC {}", subnet, self.vpc_cidr);
            }
        }
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                if a.overlaps(b) {
                    anyhow::bail!("Subnets {} and {} overlap", a, b);
                }
            }
        }
        Ok(())
    }

    /// Number of availability zones the subnets span
    pub fn availability_zones(&self) -> usize {
        match &self.layout {
            SubnetLayout::Planned { private, .. } => private.len(),
            SubnetLayout::Existing {
                private_subnet_ids, ..
            } => private_subnet_ids.len(),
        }
    }

    /// Add the network resources to the template
    pub fn emit(&self, template: &mut Template, name_prefix: &str) -> Result<NetworkRefs> {
        match &self.layout {
            SubnetLayout::Existing {
                vpc_id,
                private_subnet_ids,
            } => {
                info!("Using existing VPC {} ({})", vpc_id, self.vpc_cidr);
                Ok(NetworkRefs {
                    vpc_id: json!(vpc_id),
                    vpc_cidr: json!(self.vpc_cidr.to_string()),
                    private_subnet_ids: private_subnet_ids.iter().map(|id| json!(id)).collect(),
                })
            }
            SubnetLayout::Planned {
                public,
                private,
                nat_gateways,
            } => {
                info!(
                    "Planning VPC {} across {} AZs with {} NAT gateways",
                    self.vpc_cidr,
                    self.availability_zones(),
                    nat_gateways
                );
                self.emit_planned(template, name_prefix, public, private, *nat_gateways)
            }
        }
    }

    fn emit_planned(
        &self,
        template: &mut Template,
        name_prefix: &str,
        public: &[Ipv4Cidr],
        private: &[Ipv4Cidr],
        nat_gateways: u32,
    ) -> Result<NetworkRefs> {
        let name_tag = |suffix: &str| {
            json!([{
                "Key": "Name",
                "Value": format!("{}-{}", name_prefix, suffix),
            }])
        };

        template.add_resource(
            "Vpc",
            Resource::new(
                "AWS::EC2::VPC",
                json!({
                    "CidrBlock": self.vpc_cidr.to_string(),
                    "EnableDnsHostnames": true,
                    "EnableDnsSupport": true,
                    "Tags": name_tag("vpc"),
                }),
            ),
        )?;
        template.add_resource(
            "InternetGateway",
            Resource::new("AWS::EC2::InternetGateway", json!({ "Tags": name_tag("igw") })),
        )?;
        template.add_resource(
            "VpcGatewayAttachment",
            Resource::new(
                "AWS::EC2::VPCGatewayAttachment",
                json!({
                    "VpcId": reference("Vpc"),
                    "InternetGatewayId": reference("InternetGateway"),
                }),
            ),
        )?;

        // One public route table shared by every public subnet
        template.add_resource(
            "PublicRouteTable",
            Resource::new(
                "AWS::EC2::RouteTable",
                json!({ "VpcId": reference("Vpc"), "Tags": name_tag("public") }),
            ),
        )?;
        template.add_resource(
            "PublicDefaultRoute",
            Resource::new(
                "AWS::EC2::Route",
                json!({
                    "RouteTableId": reference("PublicRouteTable"),
                    "DestinationCidrBlock": Ipv4Cidr::ANY.to_string(),
                    "GatewayId": reference("InternetGateway"),
                }),
            )
            .depends_on("VpcGatewayAttachment"),
        )?;

        for (i, cidr) in public.iter().enumerate() {
            let n = i + 1;
            let subnet_id = format!("PublicSubnet{}", n);
            template.add_resource(
                &subnet_id,
                Resource::new(
                    "AWS::EC2::Subnet",
                    json!({
                        "VpcId": reference("Vpc"),
                        "CidrBlock": cidr.to_string(),
                        "AvailabilityZone": select_az(i),
                        "MapPublicIpOnLaunch": true,
                        "Tags": [
                            { "Key": "Name", "Value": format!("{}-public-{}", name_prefix, n) },
                            { "Key": "kubernetes.io/role/elb", "Value": "1" },
                        ],
                    }),
                ),
            )?;
            template.add_resource(
                format!("{}RouteTableAssociation", subnet_id),
                Resource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({
                        "SubnetId": reference(&subnet_id),
                        "RouteTableId": reference("PublicRouteTable"),
                    }),
                ),
            )?;
        }

        for n in 1..=nat_gateways {
            let eip_id = format!("NatGateway{}Eip", n);
            template.add_resource(
                &eip_id,
                Resource::new(
                    "AWS::EC2::EIP",
                    json!({ "Domain": "vpc", "Tags": name_tag(&format!("nat-{}", n)) }),
                )
                .depends_on("VpcGatewayAttachment"),
            )?;
            template.add_resource(
                format!("NatGateway{}", n),
                Resource::new(
                    "AWS::EC2::NatGateway",
                    json!({
                        "AllocationId": get_att(&eip_id, "AllocationId"),
                        "SubnetId": reference(&format!("PublicSubnet{}", n)),
                        "Tags": name_tag(&format!("nat-{}", n)),
                    }),
                ),
            )?;
        }

        let mut private_subnet_ids = Vec::with_capacity(private.len());
        for (i, cidr) in private.iter().enumerate() {
            let n = i + 1;
            let subnet_id = format!("PrivateSubnet{}", n);
            let route_table_id = format!("PrivateRouteTable{}", n);
            let nat = i as u32 % nat_gateways + 1;

            template.add_resource(
                &subnet_id,
                Resource::new(
                    "AWS::EC2::Subnet",
                    json!({
                        "VpcId": reference("Vpc"),
                        "CidrBlock": cidr.to_string(),
                        "AvailabilityZone": select_az(i),
                        "MapPublicIpOnLaunch": false,
                        "Tags": [
                            { "Key": "Name", "Value": format!("{}-private-{}", name_prefix, n) },
                            { "Key": "kubernetes.io/role/internal-elb", "Value": "1" },
                        ],
                    }),
                ),
            )?;
            template.add_resource(
                &route_table_id,
                Resource::new(
                    "AWS::EC2::RouteTable",
                    json!({ "VpcId": reference("Vpc"), "Tags": name_tag(&format!("private-{}", n)) }),
                ),
            )?;
            template.add_resource(
                format!("PrivateDefaultRoute{}", n),
                Resource::new(
                    "AWS::EC2::Route",
                    json!({
                        "RouteTableId": reference(&route_table_id),
                        "DestinationCidrBlock": Ipv4Cidr::ANY.to_string(),
                        "NatGatewayId": reference(&format!("NatGateway{}", nat)),
                    }),
                ),
            )?;
            template.add_resource(
                format!("{}RouteTableAssociation", subnet_id),
                Resource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({
                        "SubnetId": reference(&subnet_id),
                        "RouteTableId": reference(&route_table_id),
                    }),
                ),
            )?;
            private_subnet_ids.push(reference(&subnet_id));
        }

        Ok(NetworkRefs {
            vpc_id: reference("Vpc"),
            vpc_cidr: get_att("Vpc", "CidrBlock"),
            private_subnet_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExistingVpcConfig;

    #[test]
    fn test_default_plan() {
        let topology = NetworkTopology::plan(&NetworkConfig::default()).unwrap();
        assert_eq!(topology.availability_zones(), 3);

        let SubnetLayout::Planned {
            public, private, ..
        } = &topology.layout
        else {
            panic!("expected planned layout");
        };
        assert_eq!(public[0].to_string(), "10.0.0.0/24");
        assert_eq!(private[0].to_string(), "10.0.3.0/24");
        for p in public {
            assert!(private.iter().all(|q| !p.overlaps(q)));
        }
    }

    #[test]
    fn test_plan_rejects_bad_layouts() {
        let config = NetworkConfig {
            cidr: "10.0.0.0/24".to_string(),
            ..NetworkConfig::default()
        };
        assert!(NetworkTopology::plan(&config).is_err());

        let config = NetworkConfig {
            nat_gateways: 0,
            ..NetworkConfig::default()
        };
        assert!(NetworkTopology::plan(&config).is_err());

        let config = NetworkConfig {
            max_azs: 1,
            nat_gateways: 1,
            ..NetworkConfig::default()
        };
        assert!(NetworkTopology::plan(&config).is_err());
    }

    #[test]
    fn test_validate_detects_overlap() {
        let topology = NetworkTopology {
            vpc_cidr: "10.0.0.0/16".parse().unwrap(),
            layout: SubnetLayout::Planned {
                public: vec!["10.0.0.0/23".parse().unwrap()],
                private: vec!["10.0.1.0/24".parse().unwrap()],
                nat_gateways: 1,
            },
        };
        assert!(topology.validate().is_err());
    }

    #[test]
    fn test_emit_planned() {
        let topology = NetworkTopology::plan(&NetworkConfig::default()).unwrap();
        let mut template = Template::new("test");
        let refs = topology.emit(&mut template, "shop-dev").unwrap();

        assert_eq!(refs.private_subnet_ids.len(), 3);
        assert_eq!(template.resources_of_type("AWS::EC2::NatGateway").count(), 2);
        assert_eq!(template.resources_of_type("AWS::EC2::Subnet").count(), 6);

        // Third private subnet wraps around to the first NAT gateway
        let route = template.resource("PrivateDefaultRoute3").unwrap();
        assert_eq!(route.property("NatGatewayId").unwrap(), &reference("NatGateway1"));
    }

    #[test]
    fn test_emit_existing() {
        let config = NetworkConfig {
            existing_vpc: Some(ExistingVpcConfig {
                vpc_id: "vpc-0abc".to_string(),
                cidr: "172.31.0.0/16".to_string(),
                private_subnet_ids: vec!["subnet-a".to_string(), "subnet-b".to_string()],
            }),
            ..NetworkConfig::default()
        };
        let topology = NetworkTopology::plan(&config).unwrap();
        let mut template = Template::new("test");
        let refs = topology.emit(&mut template, "shop-dev").unwrap();

        assert_eq!(template.resource_count(), 0);
        assert_eq!(refs.vpc_id, json!("vpc-0abc"));
        assert_eq!(refs.vpc_cidr, json!("172.31.0.0/16"));
    }
}
