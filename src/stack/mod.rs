/// Stack composition: every component wired into one template
use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub mod outputs;

use crate::charts::devtron::DEVTRON_NAMESPACE;
use crate::charts::{self, ChartRequest, DevtronPlan};
use crate::cluster::{ClusterProvisioner, ClusterSpec, ComputeStrategy, SshKeyPair};
use crate::config::{DeploymentConfig, EnvironmentParams};
use crate::identity::operator_bindings;
use crate::network::NetworkTopology;
use crate::security::SecurityTopology;
use crate::template::{get_att, join, Template};
use outputs::{DevtronDelivery, OutputContext};

/// A synthesized deployment ready to be written and deployed
pub struct SynthesizedStack {
    pub stack_name: String,
    pub cluster_name: String,
    pub template: Template,
    /// Charts installed after deployment by `install-devtron`
    pub deferred_charts: Vec<ChartRequest>,
    pub devtron: Option<DevtronPlan>,
    pub ssh_key: Option<SshKeyPair>,
    pub tags: BTreeMap<String, String>,
}

impl SynthesizedStack {
    /// Write the template, chart values and SSH key into `dir`
    pub async fn write(&self, dir: &Path) -> Result<PathBuf> {
        let template_path = self.template.write_to(dir, &self.stack_name).await?;
        for chart in &self.deferred_charts {
            chart.write_values(dir).await?;
        }
        if let Some(key) = &self.ssh_key {
            key.write_private_key(dir).await?;
        }
        Ok(template_path)
    }
}

/// Composes network, security, cluster, identity and charts for one environment
pub struct StackBuilder<'a> {
    params: &'a EnvironmentParams,
    config: &'a DeploymentConfig,
    /// Where generated files from earlier runs live
    output_dir: &'a Path,
}

impl<'a> StackBuilder<'a> {
    pub fn new(
        params: &'a EnvironmentParams,
        config: &'a DeploymentConfig,
        output_dir: &'a Path,
    ) -> Self {
        Self {
            params,
            config,
            output_dir,
        }
    }

    /// Standard tags; user tags cannot replace them
    pub fn tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.config.tags.clone();
        tags.insert("Project".to_string(), self.params.project_name.clone());
        tags.insert("Environment".to_string(), self.params.env_name.clone());
        tags.insert("Component".to_string(), "EKS".to_string());
        tags.insert("ManagedBy".to_string(), env!("CARGO_PKG_NAME").to_string());
        tags
    }

    pub fn build(&self) -> Result<SynthesizedStack> {
        let config = self.config;
        let params = self.params;
        config.validate()?;

        let stack_name = params.stack_name();
        let cluster_name = params.cluster_name();
        let prefix = format!("{}-{}", params.project_name, params.env_name);
        let region = params.target.region.as_deref();
        info!(
            "Synthesizing {} for cluster {} ({})",
            stack_name,
            cluster_name,
            if params.is_prod { "prod" } else { "non-prod" }
        );

        let mut template = Template::new(format!(
            "EKS cluster {} with the Devtron platform",
            cluster_name
        ));

        // Network
        let network = NetworkTopology::plan(&config.network)?.emit(&mut template, &prefix)?;

        // Compute strategy decides which security wiring applies
        let fargate_namespaces: &[&str] = if config.devtron.enabled {
            &[DEVTRON_NAMESPACE]
        } else {
            &[]
        };
        let compute = ComputeStrategy::from_config(
            &config.cluster,
            params.is_prod,
            &format!("{}-nodes", prefix),
            fargate_namespaces,
        )?;

        let mut security = SecurityTopology::build(&config.security)?;
        if compute.worker_pool().is_some() {
            security.allow_control_plane_to_workers();
        }
        if security
            .worker
            .group()
            .is_some_and(|group| group.allows_ssh_from_anywhere())
        {
            warn!("Worker nodes accept SSH from anywhere; restrict security.allow_inbound_cidrs");
        }
        let security_refs = security.emit(&mut template, &network, &cluster_name)?;

        let ssh_key = if config.cluster.ssh_access && compute.worker_pool().is_some() {
            Some(SshKeyPair::load_or_generate(
                self.output_dir,
                format!("{}-nodes", cluster_name),
            )?)
        } else {
            None
        };

        // Cluster
        let spec = ClusterSpec {
            name: cluster_name.clone(),
            version: config.cluster.kubernetes_version.clone(),
            endpoint_access: security.endpoint_access,
            public_access_cidrs: security.inbound_cidrs.clone(),
            enable_logging: config.cluster.enable_logging,
            compute,
            ssh_public_key: ssh_key
                .as_ref()
                .map(|key| (key.name.clone(), key.public_key.clone())),
        };
        let cluster = ClusterProvisioner::new(&spec).emit(&mut template, &network, &security_refs)?;

        // Identity
        let operators = params
            .sso_role_name
            .iter()
            .chain(params.access_role_name.iter())
            .cloned();
        for binding in operator_bindings(operators, &cluster_name)? {
            binding.emit(&mut template, &cluster_name, &cluster.name)?;
        }

        // Platform charts
        let deferred = config.devtron.deferred;
        let mut deferred_charts = Vec::new();

        let on_fargate = matches!(spec.compute, ComputeStrategy::Fargate(_));
        let (controller, controller_identity) = charts::load_balancer_controller(
            &cluster_name,
            on_fargate.then_some(&network.vpc_id),
        )?;
        controller_identity.emit(&mut template, &cluster_name, &cluster.name)?;
        let controller_release = if deferred {
            deferred_charts.push(controller);
            None
        } else {
            Some(controller.emit(&mut template, &cluster.name, cluster.compute_resource.as_deref())?)
        };

        let devtron = if config.devtron.enabled {
            let plan = DevtronPlan::new(&config.devtron, region)?;
            if let Some(binding) = plan.identity_binding(&cluster_name)? {
                binding.emit(&mut template, &cluster_name, &cluster.name)?;
            }
            let request = plan.chart_request()?;
            if deferred {
                deferred_charts.push(request);
            } else {
                let after = controller_release
                    .as_deref()
                    .or(cluster.compute_resource.as_deref());
                request.emit(&mut template, &cluster.name, after)?;
            }
            Some(plan)
        } else {
            None
        };

        // Outputs
        self.emit_outputs(&mut template, &cluster, &network, &security_refs, devtron.as_ref())?;

        let tags = self.tags();
        template.apply_tags(&tags);

        info!(
            "Synthesized {} resources, {} charts deferred",
            template.resource_count(),
            deferred_charts.len()
        );

        Ok(SynthesizedStack {
            stack_name,
            cluster_name,
            template,
            deferred_charts,
            devtron,
            ssh_key,
            tags,
        })
    }

    fn emit_outputs(
        &self,
        template: &mut Template,
        cluster: &crate::cluster::ClusterRefs,
        network: &crate::network::NetworkRefs,
        security: &crate::security::SecurityRefs,
        devtron: Option<&DevtronPlan>,
    ) -> Result<()> {
        let values: [(&str, Value, &str); 7] = [
            ("ClusterName", cluster.name.clone(), "EKS Cluster Name"),
            ("ClusterEndpoint", cluster.endpoint.clone(), "EKS Cluster Endpoint"),
            ("ClusterArn", cluster.arn.clone(), "EKS Cluster ARN"),
            ("VpcId", network.vpc_id.clone(), "VPC ID"),
            (
                "ClusterSecurityGroupId",
                security.control_plane.clone(),
                "EKS Cluster Security Group ID",
            ),
            (
                "NodeGroupSecurityGroupId",
                security.worker.clone(),
                "EKS Node Group Security Group ID",
            ),
            (
                "AlbSecurityGroupId",
                security.load_balancer.clone(),
                "ALB Security Group ID",
            ),
        ];
        for (name, value, description) in values {
            template.add_output(name, value, description)?;
        }
        template.add_output(
            "PrivateSubnetIds",
            join(",", network.private_subnet_ids.clone()),
            "Private subnets hosting the worker nodes",
        )?;
        template.add_output(
            "EksManagedSecurityGroupId",
            get_att(crate::cluster::CLUSTER_ID, "ClusterSecurityGroupId"),
            "Security group EKS creates for the control plane and managed nodes",
        )?;

        let context = OutputContext::new(
            &self.params.project_name,
            &self.params.cluster_name(),
            self.params.target.region.as_deref(),
            devtron.is_some(),
        );
        outputs::emit_cluster_outputs(template, &context)?;

        let delivery = match (devtron, self.config.devtron.deferred) {
            (None, _) => DevtronDelivery::Disabled,
            (Some(_), true) => DevtronDelivery::Deferred,
            (Some(_), false) => DevtronDelivery::Template,
        };
        outputs::emit_devtron_outputs(
            template,
            &context,
            devtron.map(|plan| &plan.access),
            delivery,
            devtron.is_some_and(|plan| plan.admin_password_configured()),
        )
    }
}
