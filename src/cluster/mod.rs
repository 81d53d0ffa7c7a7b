/// EKS control plane and compute provisioning
use anyhow::Result;
use serde_json::{json, Value};
use tracing::info;

pub mod nodegroup;
pub mod ssh_key;

pub use nodegroup::{WorkerPoolSpec, WORKER_NODE_POLICIES};
pub use ssh_key::SshKeyPair;

use crate::config::ClusterConfig;
use crate::identity::service_role;
use crate::network::{Ipv4Cidr, NetworkRefs};
use crate::security::{EndpointAccess, SecurityRefs};
use crate::template::{get_att, reference, sub, Resource, Template};

pub const CLUSTER_ID: &str = "EksCluster";

const CLUSTER_LOG_TYPES: [&str; 5] = [
    "api",
    "audit",
    "authenticator",
    "controllerManager",
    "scheduler",
];

/// How pods get compute; exactly one strategy per cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeStrategy {
    /// A managed node group created by this stack
    ManagedNodeGroup(WorkerPoolSpec),

    /// Compute lifecycle handed to EKS Auto Mode after creation
    AutoMode,

    /// Serverless pods on Fargate
    Fargate(FargateProfileSpec),
}

/// Fargate profile selecting whole namespaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FargateProfileSpec {
    pub name: String,
    pub namespaces: Vec<String>,
}

impl ComputeStrategy {
    /// Pick the strategy from configuration flags; contradictory flags are rejected
    pub fn from_config(
        config: &ClusterConfig,
        is_prod: bool,
        pool_name: &str,
        fargate_namespaces: &[&str],
    ) -> Result<Self> {
        match (config.enable_auto_mode, config.enable_fargate) {
            (true, true) => anyhow::bail!(
                "Auto Mode and Fargate cannot both govern compute; enable only one"
            ),
            (true, false) => Ok(ComputeStrategy::AutoMode),
            (false, true) => {
                let mut namespaces = vec!["default".to_string(), "kube-system".to_string()];
                for ns in fargate_namespaces {
                    if !namespaces.iter().any(|n| n == ns) {
                        namespaces.push(ns.to_string());
                    }
                }
                Ok(ComputeStrategy::Fargate(FargateProfileSpec {
                    name: "default-fargate-profile".to_string(),
                    namespaces,
                }))
            }
            (false, false) => Ok(ComputeStrategy::ManagedNodeGroup(
                WorkerPoolSpec::for_environment(pool_name, is_prod, &config.node_group)?,
            )),
        }
    }

    pub fn worker_pool(&self) -> Option<&WorkerPoolSpec> {
        match self {
            ComputeStrategy::ManagedNodeGroup(pool) => Some(pool),
            _ => None,
        }
    }
}

/// Provisioning request for the control plane
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub name: String,
    pub version: String,
    pub endpoint_access: EndpointAccess,
    pub public_access_cidrs: Vec<Ipv4Cidr>,
    pub enable_logging: bool,
    pub compute: ComputeStrategy,
    /// Public half of the node SSH key, if node access is wanted
    pub ssh_public_key: Option<(String, String)>,
}

/// Template references to the provisioned cluster
#[derive(Debug, Clone)]
pub struct ClusterRefs {
    pub name: Value,
    pub endpoint: Value,
    pub arn: Value,
    /// Logical id of the resource that brings up compute, if any
    pub compute_resource: Option<String>,
}

/// Emits the control plane, its roles and the selected compute
pub struct ClusterProvisioner<'a> {
    spec: &'a ClusterSpec,
}

impl<'a> ClusterProvisioner<'a> {
    pub fn new(spec: &'a ClusterSpec) -> Self {
        Self { spec }
    }

    pub fn emit(
        &self,
        template: &mut Template,
        network: &NetworkRefs,
        security: &SecurityRefs,
    ) -> Result<ClusterRefs> {
        let spec = self.spec;
        info!(
            "Provisioning cluster {} (Kubernetes {}, endpoint {:?})",
            spec.name, spec.version, spec.endpoint_access
        );

        self.emit_control_plane(template, network, security)?;

        let compute_resource = match &spec.compute {
            ComputeStrategy::ManagedNodeGroup(pool) => {
                Some(self.emit_node_group(template, pool, network, security)?)
            }
            ComputeStrategy::Fargate(profile) => {
                Some(self.emit_fargate_profile(template, profile, network)?)
            }
            ComputeStrategy::AutoMode => {
                self.emit_auto_mode(template)?;
                None
            }
        };

        if let Some(compute) = &compute_resource {
            self.emit_addons(template, compute)?;
        }

        Ok(ClusterRefs {
            name: reference(CLUSTER_ID),
            endpoint: get_att(CLUSTER_ID, "Endpoint"),
            arn: get_att(CLUSTER_ID, "Arn"),
            compute_resource,
        })
    }

    fn emit_control_plane(
        &self,
        template: &mut Template,
        network: &NetworkRefs,
        security: &SecurityRefs,
    ) -> Result<()> {
        let spec = self.spec;
        let auto_mode = spec.compute == ComputeStrategy::AutoMode;

        let mut policies = vec!["AmazonEKSClusterPolicy"];
        if auto_mode {
            policies.extend([
                "AmazonEKSComputePolicy",
                "AmazonEKSBlockStoragePolicy",
                "AmazonEKSLoadBalancingPolicy",
                "AmazonEKSNetworkingPolicy",
            ]);
        }
        template.add_resource(
            "EksClusterRole",
            service_role("eks.amazonaws.com", &policies, auto_mode),
        )?;

        let mut vpc_config = json!({
            "SubnetIds": network.private_subnet_ids,
            "SecurityGroupIds": [security.control_plane],
            "EndpointPrivateAccess": true,
            "EndpointPublicAccess": spec.endpoint_access.is_public(),
        });
        if spec.endpoint_access.is_public() && !spec.public_access_cidrs.is_empty() {
            vpc_config["PublicAccessCidrs"] = json!(spec
                .public_access_cidrs
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>());
        }

        let mut properties = json!({
            "Name": spec.name,
            "Version": spec.version,
            "RoleArn": get_att("EksClusterRole", "Arn"),
            "ResourcesVpcConfig": vpc_config,
            "AccessConfig": {
                "AuthenticationMode": "API_AND_CONFIG_MAP",
                "BootstrapClusterCreatorAdminPermissions": true,
            },
        });
        if spec.enable_logging {
            properties["Logging"] = json!({
                "ClusterLogging": {
                    "EnabledTypes": CLUSTER_LOG_TYPES
                        .iter()
                        .map(|t| json!({ "Type": t }))
                        .collect::<Vec<_>>(),
                }
            });
        }
        if auto_mode {
            properties["Tags"] = json!([{ "Key": "eks-devtron/compute-type", "Value": "auto" }]);
        }

        template.add_resource(CLUSTER_ID, Resource::new("AWS::EKS::Cluster", properties))
    }

    fn emit_node_group(
        &self,
        template: &mut Template,
        pool: &WorkerPoolSpec,
        network: &NetworkRefs,
        security: &SecurityRefs,
    ) -> Result<String> {
        info!(
            "Adding managed node group {}: {:?}, min {} / desired {} / max {}",
            pool.name,
            pool.instance_types,
            pool.min_size(),
            pool.desired_size(),
            pool.max_size()
        );

        template.add_resource(
            "EksNodeGroupRole",
            service_role("ec2.amazonaws.com", &WORKER_NODE_POLICIES, false),
        )?;

        let mut launch_data = json!({
            "SecurityGroupIds": [
                get_att(CLUSTER_ID, "ClusterSecurityGroupId"),
                security.worker,
            ],
            "BlockDeviceMappings": [{
                "DeviceName": "/dev/xvda",
                "Ebs": {
                    "VolumeSize": pool.disk_size,
                    "VolumeType": "gp3",
                    "Encrypted": true,
                    "DeleteOnTermination": true,
                },
            }],
            "MetadataOptions": {
                "HttpTokens": "required",
                "HttpPutResponseHopLimit": 2,
            },
        });
        if let Some((key_name, public_key)) = &self.spec.ssh_public_key {
            template.add_resource(
                "NodeKeyPair",
                Resource::new(
                    "AWS::EC2::KeyPair",
                    json!({
                        "KeyName": key_name,
                        "KeyType": "ed25519",
                        "PublicKeyMaterial": public_key,
                    }),
                ),
            )?;
            launch_data["KeyName"] = reference("NodeKeyPair");
        }

        template.add_resource(
            "EksNodeGroupLaunchTemplate",
            Resource::new(
                "AWS::EC2::LaunchTemplate",
                json!({ "LaunchTemplateData": launch_data }),
            ),
        )?;

        template.add_resource(
            "EksNodeGroup",
            Resource::new(
                "AWS::EKS::Nodegroup",
                json!({
                    "ClusterName": reference(CLUSTER_ID),
                    "NodegroupName": pool.name,
                    "NodeRole": get_att("EksNodeGroupRole", "Arn"),
                    "Subnets": network.private_subnet_ids,
                    "InstanceTypes": pool.instance_types,
                    "AmiType": pool.ami_type,
                    "CapacityType": pool.capacity_type,
                    "ScalingConfig": {
                        "MinSize": pool.min_size(),
                        "DesiredSize": pool.desired_size(),
                        "MaxSize": pool.max_size(),
                    },
                    "UpdateConfig": { "MaxUnavailable": 1 },
                    "ForceUpdateEnabled": false,
                    "Labels": pool.labels,
                    "LaunchTemplate": {
                        "Id": reference("EksNodeGroupLaunchTemplate"),
                        "Version": get_att("EksNodeGroupLaunchTemplate", "LatestVersionNumber"),
                    },
                }),
            ),
        )?;

        Ok("EksNodeGroup".to_string())
    }

    fn emit_fargate_profile(
        &self,
        template: &mut Template,
        profile: &FargateProfileSpec,
        network: &NetworkRefs,
    ) -> Result<String> {
        info!(
            "Adding Fargate profile {} for namespaces {:?}",
            profile.name, profile.namespaces
        );

        template.add_resource(
            "EksFargateRole",
            service_role(
                "eks-fargate-pods.amazonaws.com",
                &["AmazonEKSFargatePodExecutionRolePolicy"],
                false,
            ),
        )?;
        template.add_resource(
            "EksFargateProfile",
            Resource::new(
                "AWS::EKS::FargateProfile",
                json!({
                    "ClusterName": reference(CLUSTER_ID),
                    "FargateProfileName": profile.name,
                    "PodExecutionRoleArn": get_att("EksFargateRole", "Arn"),
                    "Subnets": network.private_subnet_ids,
                    "Selectors": profile
                        .namespaces
                        .iter()
                        .map(|ns| json!({ "Namespace": ns }))
                        .collect::<Vec<_>>(),
                }),
            ),
        )?;

        Ok("EksFargateProfile".to_string())
    }

    /// Auto Mode is switched on by an operator after creation; emit the command for it
    fn emit_auto_mode(&self, template: &mut Template) -> Result<()> {
        info!(
            "Auto Mode requested: no node group is created, compute is enabled after deployment"
        );

        template.add_resource(
            "AutoModeNodeRole",
            service_role(
                "ec2.amazonaws.com",
                &[
                    "AmazonEKSWorkerNodeMinimalPolicy",
                    "AmazonEC2ContainerRegistryPullOnly",
                ],
                false,
            ),
        )?;

        let command = format!(
            "aws eks update-cluster-config --name {} \
             --compute-config '{{\"enabled\":true,\"nodePools\":[\"general-purpose\",\"system\"],\"nodeRoleArn\":\"${{AutoModeNodeRole.Arn}}\"}}' \
             --kubernetes-network-config '{{\"elasticLoadBalancing\":{{\"enabled\":true}}}}' \
             --storage-config '{{\"blockStorage\":{{\"enabled\":true}}}}'",
            self.spec.name
        );
        template.add_output(
            "AutoModeInstructions",
            sub(&command),
            "Command to enable EKS Auto Mode after deployment",
        )
    }

    fn emit_addons(&self, template: &mut Template, compute_resource: &str) -> Result<()> {
        let fargate = matches!(self.spec.compute, ComputeStrategy::Fargate(_));

        for addon in ["vpc-cni", "coredns", "kube-proxy", "eks-pod-identity-agent"] {
            let mut properties = json!({
                "AddonName": addon,
                "ClusterName": reference(CLUSTER_ID),
                "ResolveConflicts": "OVERWRITE",
            });
            if fargate && addon == "coredns" {
                properties["ConfigurationValues"] = json!(r#"{"computeType":"Fargate"}"#);
            }

            template.add_resource(
                crate::template::logical_id([addon, "addon"]),
                Resource::new("AWS::EKS::Addon", properties).depends_on(compute_resource),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::security::SecurityTopology;

    fn network() -> NetworkRefs {
        NetworkRefs {
            vpc_id: reference("Vpc"),
            vpc_cidr: get_att("Vpc", "CidrBlock"),
            private_subnet_ids: vec![reference("PrivateSubnet1"), reference("PrivateSubnet2")],
        }
    }

    fn security() -> SecurityRefs {
        let topology = SecurityTopology::build(&SecurityConfig::default()).unwrap();
        let mut template = Template::new("scratch");
        topology.emit(&mut template, &network(), "c").unwrap()
    }

    fn spec(compute: ComputeStrategy) -> ClusterSpec {
        ClusterSpec {
            name: "shop-dev-cluster".to_string(),
            version: "1.31".to_string(),
            endpoint_access: EndpointAccess::Private,
            public_access_cidrs: vec![],
            enable_logging: true,
            compute,
            ssh_public_key: None,
        }
    }

    fn managed() -> ComputeStrategy {
        ComputeStrategy::from_config(&ClusterConfig::default(), false, "shop-dev-nodes", &[])
            .unwrap()
    }

    #[test]
    fn test_contradictory_compute_rejected() {
        let config = ClusterConfig {
            enable_auto_mode: true,
            enable_fargate: true,
            ..ClusterConfig::default()
        };
        assert!(ComputeStrategy::from_config(&config, false, "p", &[]).is_err());
    }

    #[test]
    fn test_fargate_namespaces() {
        let config = ClusterConfig {
            enable_fargate: true,
            ..ClusterConfig::default()
        };
        let strategy = ComputeStrategy::from_config(&config, false, "p", &["devtroncd", "default"])
            .unwrap();
        let ComputeStrategy::Fargate(profile) = strategy else {
            panic!("expected fargate");
        };
        assert_eq!(profile.namespaces, vec!["default", "kube-system", "devtroncd"]);
    }

    #[test]
    fn test_worker_role_has_exactly_three_policies() {
        let spec = spec(managed());
        let mut template = Template::new("test");
        ClusterProvisioner::new(&spec)
            .emit(&mut template, &network(), &security())
            .unwrap();

        let role = template.resource("EksNodeGroupRole").unwrap();
        let policies = role.property("ManagedPolicyArns").unwrap().as_array().unwrap();
        assert_eq!(policies.len(), 3);
        for name in WORKER_NODE_POLICIES {
            assert!(policies.contains(&crate::template::managed_policy_arn(name)));
        }
    }

    #[test]
    fn test_managed_node_group_emission() {
        let spec = spec(managed());
        let mut template = Template::new("test");
        let refs = ClusterProvisioner::new(&spec)
            .emit(&mut template, &network(), &security())
            .unwrap();

        assert_eq!(refs.compute_resource.as_deref(), Some("EksNodeGroup"));
        let nodegroup = template.resource("EksNodeGroup").unwrap();
        assert_eq!(nodegroup.property("ScalingConfig").unwrap()["MinSize"], 2);
        assert_eq!(template.resources_of_type("AWS::EKS::Addon").count(), 4);
        assert!(template.output("AutoModeInstructions").is_none());

        let cluster = template.resource(CLUSTER_ID).unwrap();
        let vpc_config = cluster.property("ResourcesVpcConfig").unwrap();
        assert_eq!(vpc_config["EndpointPublicAccess"], false);
        assert_eq!(
            cluster.property("Logging").unwrap()["ClusterLogging"]["EnabledTypes"]
                .as_array()
                .unwrap()
                .len(),
            5
        );
    }

    #[test]
    fn test_auto_mode_creates_no_node_group() {
        let spec = spec(ComputeStrategy::AutoMode);
        let mut template = Template::new("test");
        let refs = ClusterProvisioner::new(&spec)
            .emit(&mut template, &network(), &security())
            .unwrap();

        assert!(refs.compute_resource.is_none());
        assert_eq!(template.resources_of_type("AWS::EKS::Nodegroup").count(), 0);
        assert_eq!(template.resources_of_type("AWS::EKS::Addon").count(), 0);

        let output = template.output("AutoModeInstructions").unwrap();
        let command = output.value["Fn::Sub"].as_str().unwrap();
        assert!(command.starts_with("aws eks update-cluster-config --name shop-dev-cluster"));
        assert!(command.contains("${AutoModeNodeRole.Arn}"));
    }

    #[test]
    fn test_public_endpoint_carries_cidrs() {
        let mut spec = spec(managed());
        spec.endpoint_access = EndpointAccess::PublicAndPrivate;
        spec.public_access_cidrs = vec!["203.0.113.0/24".parse().unwrap()];
        spec.ssh_public_key = Some(("nodes".to_string(), "ssh-ed25519 AAAA nodes".to_string()));

        let mut template = Template::new("test");
        ClusterProvisioner::new(&spec)
            .emit(&mut template, &network(), &security())
            .unwrap();

        let vpc_config = template
            .resource(CLUSTER_ID)
            .unwrap()
            .property("ResourcesVpcConfig")
            .unwrap()
            .clone();
        assert_eq!(vpc_config["EndpointPublicAccess"], true);
        assert_eq!(vpc_config["PublicAccessCidrs"], json!(["203.0.113.0/24"]));

        let launch = template.resource("EksNodeGroupLaunchTemplate").unwrap();
        assert_eq!(
            launch.property("LaunchTemplateData").unwrap()["KeyName"],
            reference("NodeKeyPair")
        );
    }
}
