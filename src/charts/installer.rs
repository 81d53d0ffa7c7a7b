/// Post-deployment chart installation through the aws, kubectl and helm CLIs
use anyhow::{Context, Result};
use futures::future::try_join_all;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{ChartRequest, Lookup};
use crate::utils::command::{check_tool_installed, CommandBuilder};
use crate::utils::polling::PollingConfig;

/// The parts of `aws eks describe-cluster` chart values need
#[derive(Debug, Deserialize)]
struct ClusterInfo {
    arn: String,
    #[serde(rename = "vpcId")]
    vpc_id: String,
}

impl ClusterInfo {
    /// Region field of `arn:<partition>:eks:<region>:<account>:cluster/<name>`
    fn region(&self) -> Result<&str> {
        self.arn
            .split(':')
            .nth(3)
            .filter(|region| !region.is_empty())
            .with_context(|| format!("Unexpected cluster ARN: {}", self.arn))
    }
}

/// Installs chart requests into a running cluster
pub struct ChartInstaller {
    kubeconfig_path: PathBuf,
    output_dir: PathBuf,
    region: Option<String>,
}

impl ChartInstaller {
    pub fn new(output_dir: &Path, region: Option<String>) -> Self {
        Self {
            kubeconfig_path: output_dir.join("kubeconfig"),
            output_dir: output_dir.to_path_buf(),
            region,
        }
    }

    pub fn kubeconfig_path(&self) -> &Path {
        &self.kubeconfig_path
    }

    /// Check that aws, kubectl and helm are available
    pub async fn check_tools() -> Result<()> {
        try_join_all([
            check_tool_installed(
                "aws",
                &["--version"],
                "https://docs.aws.amazon.com/cli/latest/userguide/getting-started-install.html",
            ),
            check_tool_installed(
                "kubectl",
                &["version", "--client"],
                "https://kubernetes.io/docs/tasks/tools/",
            ),
            check_tool_installed("helm", &["version"], "https://helm.sh/docs/intro/install/"),
        ])
        .await?;
        Ok(())
    }

    /// Write a kubeconfig for the cluster into the output directory
    pub async fn update_kubeconfig(&self, cluster_name: &str) -> Result<()> {
        info!("Fetching kubeconfig for {}...", cluster_name);

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .context("Failed to create output directory")?;

        CommandBuilder::new("aws")
            .args(["eks", "update-kubeconfig", "--name", cluster_name, "--kubeconfig"])
            .arg(&self.kubeconfig_path)
            .aws_region(self.region.as_deref())
            .context("Failed to update kubeconfig")
            .run_silent()
            .await?;

        info!("Kubeconfig written: {}", self.kubeconfig_path.display());
        Ok(())
    }

    /// Fill in the placeholders of `request` from the deployed cluster
    pub async fn resolve(&self, cluster_name: &str, request: &ChartRequest) -> Result<ChartRequest> {
        if request.variables.is_empty() {
            return Ok(request.clone());
        }

        let needs_cluster = request
            .variables
            .iter()
            .any(|v| matches!(v.lookup, Lookup::ClusterVpcId | Lookup::ClusterRegion));
        let cluster = if needs_cluster {
            Some(self.describe_cluster(cluster_name).await?)
        } else {
            None
        };

        let mut lookups = BTreeMap::new();
        for variable in &request.variables {
            let value = match (&variable.lookup, &cluster) {
                (Lookup::ClusterVpcId, Some(cluster)) => cluster.vpc_id.clone(),
                (Lookup::ClusterRegion, Some(cluster)) => cluster.region()?.to_string(),
                (Lookup::RoleArn(role_name), _) => self.role_arn(role_name).await?,
                (lookup, None) => anyhow::bail!("No cluster details to resolve {:?}", lookup),
            };
            debug!("{} = {}", variable.name, value);
            lookups.insert(variable.name.clone(), value);
        }

        request.resolved(&lookups)
    }

    async fn describe_cluster(&self, cluster_name: &str) -> Result<ClusterInfo> {
        CommandBuilder::new("aws")
            .args([
                "eks",
                "describe-cluster",
                "--name",
                cluster_name,
                "--query",
                "cluster.{arn: arn, vpcId: resourcesVpcConfig.vpcId}",
                "--output",
                "json",
            ])
            .aws_region(self.region.as_deref())
            .context(format!("Failed to describe cluster {}", cluster_name))
            .run_json()
            .await
    }

    async fn role_arn(&self, role_name: &str) -> Result<String> {
        let arn = CommandBuilder::new("aws")
            .args([
                "iam",
                "get-role",
                "--role-name",
                role_name,
                "--query",
                "Role.Arn",
                "--output",
                "text",
            ])
            .context(format!("Failed to look up IAM role {}", role_name))
            .run()
            .await?;
        Ok(arn.trim().to_string())
    }

    /// Install or upgrade a release, applying its prerequisite manifests first
    pub async fn install(&self, request: &ChartRequest) -> Result<()> {
        request.validate()?;
        info!(
            "Installing {} ({}) into {}...",
            request.release,
            request.chart_reference(),
            request.namespace
        );

        self.add_helm_repo(request).await?;
        self.apply_manifests(request).await?;

        let values_path = request.write_values(&self.output_dir).await?;
        let timeout = format!("{}m", request.timeout_minutes);
        let chart = request.chart_reference();

        let mut args = vec![
            "upgrade",
            "--install",
            request.release.as_str(),
            chart.as_str(),
            "--namespace",
            request.namespace.as_str(),
        ];
        if request.create_namespace {
            args.push("--create-namespace");
        }
        if let Some(version) = &request.version {
            args.extend_from_slice(&["--version", version.as_str()]);
        }
        if request.wait {
            args.extend_from_slice(&["--wait", "--timeout", timeout.as_str()]);
        }

        CommandBuilder::new("helm")
            .args(&args)
            .arg("-f")
            .arg(&values_path)
            .kubeconfig(&self.kubeconfig_path)
            .context(format!("Failed to install {}", request.release))
            .run_silent()
            .await?;

        info!("{} installed successfully", request.release);
        Ok(())
    }

    async fn add_helm_repo(&self, request: &ChartRequest) -> Result<()> {
        let output = CommandBuilder::new("helm")
            .args([
                "repo",
                "add",
                request.repository_name.as_str(),
                request.repository.as_str(),
            ])
            .context("Failed to add Helm repo")
            .output()
            .await?;

        if !output.success && !output.stderr.contains("already exists") {
            anyhow::bail!("Failed to add Helm repo: {}", output.stderr);
        }

        CommandBuilder::new("helm")
            .args(["repo", "update", request.repository_name.as_str()])
            .context("Failed to update Helm repos")
            .run_silent()
            .await
    }

    async fn apply_manifests(&self, request: &ChartRequest) -> Result<()> {
        if request.manifests.is_empty() {
            return Ok(());
        }

        let mut rendered = String::new();
        for manifest in &request.manifests {
            rendered.push_str("---\n");
            rendered.push_str(
                &serde_yaml::to_string(manifest).context("Failed to render manifest")?,
            );
        }

        let path = self
            .output_dir
            .join(format!("{}-manifests.yaml", request.release));
        tokio::fs::write(&path, rendered)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        CommandBuilder::new("kubectl")
            .args(["apply", "-f"])
            .arg(&path)
            .kubeconfig(&self.kubeconfig_path)
            .context(format!("Failed to apply manifests for {}", request.release))
            .run_silent()
            .await
    }

    /// Wait until every pod in `namespace` reports Ready
    pub async fn wait_for_pods(&self, namespace: &str, timeout_secs: u64) -> Result<()> {
        let config = PollingConfig::new(
            timeout_secs,
            15,
            format!("Waiting for pods in {} to be ready", namespace),
        );

        config
            .poll_until(|| async { self.pods_ready(namespace).await })
            .await
    }

    async fn pods_ready(&self, namespace: &str) -> Result<bool> {
        let output = CommandBuilder::new("kubectl")
            .args([
                "get",
                "pods",
                "-n",
                namespace,
                "-o",
                "jsonpath={.items[*].status.conditions[?(@.type=='Ready')].status}",
            ])
            .kubeconfig(&self.kubeconfig_path)
            .context("Failed to check pod status")
            .output()
            .await?;

        if !output.success {
            warn!("Pod status check failed: {}", output.stderr.trim());
            return Ok(false);
        }

        Ok(all_ready(&output.stdout))
    }

    /// Pod listing for `namespace`
    pub async fn status(&self, namespace: &str) -> Result<String> {
        CommandBuilder::new("kubectl")
            .args(["get", "pods", "-n", namespace])
            .kubeconfig(&self.kubeconfig_path)
            .context(format!("Failed to get pods in {}", namespace))
            .run()
            .await
    }
}

/// Every readiness condition in a jsonpath listing is `True`
fn all_ready(statuses: &str) -> bool {
    let mut statuses = statuses.split_whitespace().peekable();
    statuses.peek().is_some() && statuses.all(|s| s.eq_ignore_ascii_case("true"))
}
