/// Configuration management for eks-devtron
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

pub mod env;

pub use env::EnvironmentParams;

use crate::identity::PolicyPreset;
use crate::network::Ipv4Cidr;
use crate::security::Protocol;

/// Main deployment configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// VPC layout
    pub network: NetworkConfig,

    /// EKS control plane and compute
    pub cluster: ClusterConfig,

    /// Security group policy
    pub security: SecurityConfig,

    /// Devtron platform installation
    pub devtron: DevtronConfig,

    /// Extra tags applied to every resource
    pub tags: BTreeMap<String, String>,
}

/// VPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// VPC CIDR (e.g., "10.0.0.0/16")
    pub cidr: String,

    /// Number of availability zones to spread subnets over
    pub max_azs: u32,

    /// Number of NAT gateways shared by the private subnets
    pub nat_gateways: u32,

    /// Prefix length of every public and private subnet
    pub subnet_mask: u8,

    /// Use an existing VPC instead of creating one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_vpc: Option<ExistingVpcConfig>,
}

/// Reference to a VPC managed outside this stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingVpcConfig {
    pub vpc_id: String,
    pub cidr: String,
    pub private_subnet_ids: Vec<String>,
}

/// EKS cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Kubernetes version (e.g., "1.31")
    pub kubernetes_version: String,

    /// Ship all control plane log types to CloudWatch
    pub enable_logging: bool,

    /// Run pods on Fargate instead of a managed node group
    pub enable_fargate: bool,

    /// Hand compute over to EKS Auto Mode
    pub enable_auto_mode: bool,

    /// Generate an SSH key pair for the worker nodes
    pub ssh_access: bool,

    /// Managed node group overrides
    pub node_group: NodeGroupConfig,
}

/// Managed node group overrides; unset values follow the environment defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeGroupConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instance_types: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_size: Option<u32>,

    /// Root volume size in GiB
    pub disk_size: u32,

    pub labels: BTreeMap<String, String>,
}

/// Security group configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// CIDRs allowed to reach the API server and NodePort range
    pub allow_inbound_cidrs: Vec<String>,

    /// Extra ingress rules on the control plane group
    pub custom_ingress_rules: Vec<CustomIngressRule>,

    /// Allow SSH to nodes only from the control plane group
    pub restrict_node_access: bool,

    /// Keep the API endpoint private and open it to the VPC range
    pub enable_vpc_endpoint_access: bool,

    /// Security groups managed outside this stack
    pub existing_groups: ExistingSecurityGroups,
}

/// Custom control plane ingress rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomIngressRule {
    /// CIDR or security group id (`sg-...`)
    pub source: String,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// End of the port range, defaults to `port`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Security group ids supplied by the caller, used verbatim
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExistingSecurityGroups {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_group: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub alb: Option<String>,
}

/// Devtron platform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevtronConfig {
    /// Prepare the Devtron installation at all
    pub enabled: bool,

    /// Leave the chart out of the stack and install it with `install-devtron`
    pub deferred: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,

    /// Expose the dashboard through an ingress controller
    pub enable_ingress: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress_class: Option<String>,

    /// Base domain; the dashboard host is `devtron.<domain>`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Force a LoadBalancer service, even when ingress is enabled
    pub use_load_balancer: bool,

    pub storage_class: String,

    pub enable_monitoring: bool,

    /// Blob storage for build logs, cache and artifacts
    pub storage: StorageBackend,

    /// Extra permissions for the Devtron service account
    pub service_account_policies: Vec<PolicyPreset>,
}

/// Blob storage backend used by Devtron CI/CD
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-cluster MinIO
    #[default]
    Minio,

    /// External S3 bucket
    S3 {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/16".to_string(),
            max_azs: 3,
            nat_gateways: 2,
            subnet_mask: 24,
            existing_vpc: None,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubernetes_version: "1.31".to_string(),
            enable_logging: false,
            enable_fargate: false,
            enable_auto_mode: false,
            ssh_access: false,
            node_group: NodeGroupConfig::default(),
        }
    }
}

impl Default for NodeGroupConfig {
    fn default() -> Self {
        Self {
            instance_types: vec![],
            min_size: None,
            max_size: None,
            desired_size: None,
            disk_size: 20,
            labels: BTreeMap::new(),
        }
    }
}

impl Default for DevtronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deferred: true,
            chart_version: None,
            admin_email: None,
            admin_password: None,
            enable_ingress: false,
            ingress_class: None,
            domain: None,
            use_load_balancer: false,
            storage_class: "gp2".to_string(),
            enable_monitoring: false,
            storage: StorageBackend::Minio,
            service_account_policies: vec![],
        }
    }
}

impl DeploymentConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: DeploymentConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, falling back to defaults when it is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_file(path);
        }

        info!(
            "No configuration file at {}, using defaults",
            path.display()
        );
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        crate::network::NetworkTopology::plan(&self.network)?;

        for cidr in &self.security.allow_inbound_cidrs {
            cidr.parse::<Ipv4Cidr>()
                .with_context(|| format!("Invalid inbound CIDR: {}", cidr))?;
        }

        for rule in &self.security.custom_ingress_rules {
            crate::security::Rule::from_custom(rule, 0)?;
        }

        if self.cluster.enable_auto_mode && self.cluster.enable_fargate {
            anyhow::bail!(
                "enable_auto_mode and enable_fargate are mutually exclusive: choose one compute strategy"
            );
        }

        if self.cluster.kubernetes_version.trim().is_empty() {
            anyhow::bail!("cluster.kubernetes_version cannot be empty");
        }

        if let StorageBackend::S3 { bucket, .. } = &self.devtron.storage {
            if bucket.trim().is_empty() {
                anyhow::bail!("devtron.storage.bucket cannot be empty for the s3 backend");
            }
        }

        if let Some(domain) = &self.devtron.domain {
            if domain.trim().is_empty() || domain.contains('/') {
                anyhow::bail!("Invalid devtron.domain: {:?}", domain);
            }
        }

        Ok(())
    }

    /// Generate an example configuration file
    pub fn example() -> Self {
        Self {
            network: NetworkConfig::default(),
            cluster: ClusterConfig {
                enable_logging: true,
                ..ClusterConfig::default()
            },
            security: SecurityConfig {
                allow_inbound_cidrs: vec!["203.0.113.0/24".to_string()],
                custom_ingress_rules: vec![],
                restrict_node_access: true,
                enable_vpc_endpoint_access: false,
                existing_groups: ExistingSecurityGroups::default(),
            },
            devtron: DevtronConfig {
                use_load_balancer: true,
                enable_monitoring: true,
                ..DevtronConfig::default()
            },
            tags: [("Owner".to_string(), "platform-team".to_string())]
                .into_iter()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_validation() {
        let mut config = DeploymentConfig::example();
        assert!(config.validate().is_ok());

        config.cluster.enable_auto_mode = true;
        config.cluster.enable_fargate = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cidr_validation() {
        let mut config = DeploymentConfig::example();
        config.security.allow_inbound_cidrs = vec!["invalid".to_string()];
        assert!(config.validate().is_err());

        let mut config = DeploymentConfig::example();
        config.network.cidr = "10.0.0.0".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let mut config = DeploymentConfig::default();
        config.devtron.storage = StorageBackend::S3 {
            bucket: " ".to_string(),
            region: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
cluster:
  enable_auto_mode: true
devtron:
  storage:
    type: s3
    bucket: devtron-artifacts
security:
  custom_ingress_rules:
    - source: sg-0123456789abcdef0
      port: 8443
"#;
        let config: DeploymentConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.cidr, "10.0.0.0/16");
        assert_eq!(config.cluster.kubernetes_version, "1.31");
        assert!(config.devtron.deferred);
        assert_eq!(
            config.devtron.storage,
            StorageBackend::S3 {
                bucket: "devtron-artifacts".to_string(),
                region: None
            }
        );
        assert_eq!(config.security.custom_ingress_rules[0].protocol, Protocol::Tcp);
    }

    #[test]
    fn test_example_round_trips_through_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let yaml = serde_yaml::to_string(&DeploymentConfig::example()).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let loaded = DeploymentConfig::from_file(file.path()).unwrap();
        assert!(loaded.security.restrict_node_access);
        assert!(loaded.devtron.use_load_balancer);
        assert_eq!(loaded.tags.get("Owner").map(String::as_str), Some("platform-team"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeploymentConfig::load_or_default(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.network.max_azs, 3);
        assert!(config.devtron.enabled);
    }
}
