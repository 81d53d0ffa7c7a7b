/// Helm chart requests and their delivery into the cluster
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;
use url::Url;

pub mod devtron;
pub mod installer;

pub use devtron::{AccessMethod, DevtronPlan};
pub use installer::ChartInstaller;

use crate::identity::{load_balancer_controller_statements, IdentityBinding};
use crate::template::{get_att, logical_id, reference, Resource, Template};

/// Namespaces that exist in every cluster
pub const SYSTEM_NAMESPACES: [&str; 2] = ["kube-system", "default"];

const LOAD_BALANCER_CONTROLLER: &str = "aws-load-balancer-controller";

/// How a deferred install finds a value the template resolves itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    ClusterVpcId,
    ClusterRegion,
    /// ARN of the IAM role with this name
    RoleArn(String),
}

/// A `${Name}` placeholder in chart values or manifests
#[derive(Debug, Clone, PartialEq)]
pub struct ChartVariable {
    pub name: String,
    /// Intrinsic resolving the value inside the stack template
    pub template_value: Value,
    pub lookup: Lookup,
}

impl ChartVariable {
    pub fn new(name: &str, template_value: Value, lookup: Lookup) -> Self {
        Self {
            name: name.to_string(),
            template_value,
            lookup,
        }
    }

    fn placeholder(&self) -> String {
        format!("${{{}}}", self.name)
    }
}

/// A chart to install, with everything needed to install it either way
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRequest {
    pub release: String,
    pub chart: String,
    /// Local name of the Helm repository
    pub repository_name: String,
    pub repository: Url,
    pub version: Option<String>,
    pub namespace: String,
    pub create_namespace: bool,
    pub wait: bool,
    pub timeout_minutes: u32,
    pub values: Value,
    /// Objects applied before the chart, e.g. service accounts it does not create itself
    pub manifests: Vec<Value>,
    /// Placeholders still to be filled in
    pub variables: Vec<ChartVariable>,
}

impl ChartRequest {
    pub fn new(
        release: &str,
        repository_name: &str,
        repository: &str,
        chart: &str,
        namespace: &str,
    ) -> Result<Self> {
        if !is_dns_label(release) || release.len() > 53 {
            anyhow::bail!("Invalid Helm release name: {:?}", release);
        }
        if !is_dns_label(namespace) {
            anyhow::bail!("Invalid namespace for release {}: {:?}", release, namespace);
        }

        let repository = Url::parse(repository)
            .with_context(|| format!("Invalid repository URL for {}: {}", release, repository))?;
        if !matches!(repository.scheme(), "https" | "http" | "oci") {
            anyhow::bail!(
                "Unsupported repository scheme for {}: {}",
                release,
                repository.scheme()
            );
        }

        Ok(Self {
            release: release.to_string(),
            chart: chart.to_string(),
            repository_name: repository_name.to_string(),
            repository,
            version: None,
            namespace: namespace.to_string(),
            create_namespace: false,
            wait: true,
            timeout_minutes: 15,
            values: json!({}),
            manifests: vec![],
            variables: vec![],
        })
    }

    pub fn version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn create_namespace(mut self) -> Self {
        self.create_namespace = true;
        self
    }

    pub fn values(mut self, values: Value) -> Self {
        self.values = values;
        self
    }

    pub fn manifest(mut self, manifest: Value) -> Self {
        self.manifests.push(manifest);
        self
    }

    pub fn variable(mut self, variable: ChartVariable) -> Self {
        self.variables.push(variable);
        self
    }

    /// Copy with every placeholder replaced by its looked-up value
    pub fn resolved(&self, lookups: &BTreeMap<String, String>) -> Result<Self> {
        let mut replacements = Vec::new();
        for variable in &self.variables {
            let value = lookups.get(&variable.name).with_context(|| {
                format!("No value for {} in release {}", variable.name, self.release)
            })?;
            replacements.push((variable.placeholder(), value.as_str()));
        }

        let mut request = self.clone();
        replace_placeholders(&mut request.values, &replacements);
        for manifest in &mut request.manifests {
            replace_placeholders(manifest, &replacements);
        }
        request.variables.clear();
        Ok(request)
    }

    /// Rendered text, through `Fn::Sub` when it holds placeholders
    fn substituted(&self, text: String) -> Value {
        let used: Map<String, Value> = self
            .variables
            .iter()
            .filter(|v| text.contains(&v.placeholder()))
            .map(|v| (v.name.clone(), v.template_value.clone()))
            .collect();
        if used.is_empty() {
            Value::String(text)
        } else {
            json!({ "Fn::Sub": [text, used] })
        }
    }

    /// A release may only target a namespace that exists or that it creates
    pub fn validate(&self) -> Result<()> {
        if !self.create_namespace && !SYSTEM_NAMESPACES.contains(&self.namespace.as_str()) {
            anyhow::bail!(
                "Release {} targets namespace {} which is neither a system namespace nor created by the release",
                self.release,
                self.namespace
            );
        }
        Ok(())
    }

    /// `repo/chart` reference for the helm CLI
    pub fn chart_reference(&self) -> String {
        format!("{}/{}", self.repository_name, self.chart)
    }

    pub fn values_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.values)
            .with_context(|| format!("Failed to render values for {}", self.release))
    }

    /// Write values as `<dir>/<release>-values.yaml`
    pub async fn write_values(&self, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .context("Failed to create output directory")?;

        let path = dir.join(format!("{}-values.yaml", self.release));
        tokio::fs::write(&path, self.values_yaml()?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!("Values for {} written: {}", self.release, path.display());
        Ok(path)
    }

    /// Emit the chart as template resources; returns the logical id of the release
    pub fn emit(
        &self,
        template: &mut Template,
        cluster: &Value,
        after: Option<&str>,
    ) -> Result<String> {
        self.validate()?;

        let mut prerequisites = Vec::new();
        if self.create_namespace {
            let id = logical_id([self.release.as_str(), "namespace"]);
            let manifest = json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": self.namespace },
            });
            template.add_resource(id.as_str(), self.manifest_resource(cluster, &manifest, after)?)?;
            prerequisites.push(id);
        }
        for (index, manifest) in self.manifests.iter().enumerate() {
            let ordinal = (index + 1).to_string();
            let id = logical_id([self.release.as_str(), "manifest", ordinal.as_str()]);
            let mut resource = self.manifest_resource(cluster, manifest, after)?;
            for dependency in &prerequisites {
                resource = resource.depends_on(dependency.as_str());
            }
            template.add_resource(id.as_str(), resource)?;
            prerequisites.push(id);
        }

        let mut properties = json!({
            "ClusterID": cluster,
            "Name": self.release,
            "Namespace": self.namespace,
            "Chart": self.chart_reference(),
            "Repository": self.repository.as_str(),
            "ValueYaml": self.substituted(self.values_yaml()?),
            "TimeOut": self.timeout_minutes,
        });
        if let Some(version) = &self.version {
            properties["Version"] = json!(version);
        }

        let mut release = Resource::new("AWSQS::Kubernetes::Helm", properties);
        if let Some(after) = after {
            release = release.depends_on(after);
        }
        for dependency in prerequisites {
            release = release.depends_on(dependency);
        }

        let id = logical_id([self.release.as_str(), "chart"]);
        template.add_resource(id.as_str(), release)?;
        Ok(id)
    }

    fn manifest_resource(&self, cluster: &Value, manifest: &Value, after: Option<&str>) -> Result<Resource> {
        let rendered = serde_json::to_string(manifest)
            .with_context(|| format!("Failed to render manifest for {}", self.release))?;
        let resource = Resource::new(
            "AWSQS::Kubernetes::Resource",
            json!({
                "ClusterName": cluster,
                "Namespace": self.namespace,
                "Manifest": self.substituted(rendered),
            }),
        );
        Ok(match after {
            Some(after) => resource.depends_on(after),
            None => resource,
        })
    }
}

/// RFC 1123 label: lowercase alphanumerics and '-', 1 to 63 characters
fn is_dns_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

fn replace_placeholders(value: &mut Value, replacements: &[(String, &str)]) {
    match value {
        Value::String(text) => {
            for (placeholder, replacement) in replacements {
                if text.contains(placeholder.as_str()) {
                    *text = text.replace(placeholder.as_str(), replacement);
                }
            }
        }
        Value::Array(items) => items
            .iter_mut()
            .for_each(|item| replace_placeholders(item, replacements)),
        Value::Object(map) => map
            .values_mut()
            .for_each(|item| replace_placeholders(item, replacements)),
        _ => {}
    }
}

/// AWS Load Balancer Controller release and the identity its service account needs
///
/// `fargate_vpc_id` is set when the controller runs on Fargate. Those pods have
/// no Pod Identity agent and no instance metadata, so the controller gets an
/// OIDC web identity plus explicit VPC and region values.
pub fn load_balancer_controller(
    cluster_name: &str,
    fargate_vpc_id: Option<&Value>,
) -> Result<(ChartRequest, IdentityBinding)> {
    let mut binding = IdentityBinding::workload(
        "kube-system",
        LOAD_BALANCER_CONTROLLER,
        load_balancer_controller_statements(),
        cluster_name,
    )?;

    let mut values = json!({
        "clusterName": cluster_name,
        "serviceAccount": {
            "create": false,
            "name": LOAD_BALANCER_CONTROLLER,
        },
    });
    let mut service_account = json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": {
            "name": LOAD_BALANCER_CONTROLLER,
            "namespace": "kube-system",
        },
    });
    let mut request = ChartRequest::new(
        LOAD_BALANCER_CONTROLLER,
        "eks",
        "https://aws.github.io/eks-charts",
        LOAD_BALANCER_CONTROLLER,
        "kube-system",
    )?;

    if let Some(vpc_id) = fargate_vpc_id {
        binding = binding.with_web_identity();
        let (role_id, role_name) = binding
            .web_identity_role()
            .context("Load balancer controller has no web identity role")?;

        values["vpcId"] = json!("${VpcId}");
        values["region"] = json!("${Region}");
        service_account["metadata"]["annotations"] =
            json!({ "eks.amazonaws.com/role-arn": "${RoleArn}" });
        request = request
            .variable(ChartVariable::new("VpcId", vpc_id.clone(), Lookup::ClusterVpcId))
            .variable(ChartVariable::new(
                "Region",
                reference("AWS::Region"),
                Lookup::ClusterRegion,
            ))
            .variable(ChartVariable::new(
                "RoleArn",
                get_att(&role_id, "Arn"),
                Lookup::RoleArn(role_name),
            ));
    }

    Ok((request.values(values).manifest(service_account), binding))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::reference;

    fn request() -> ChartRequest {
        ChartRequest::new("devtron", "devtron", "https://helm.devtron.ai", "devtron-operator", "devtroncd")
            .unwrap()
    }

    #[test]
    fn test_invalid_repository_rejected() {
        assert!(ChartRequest::new("r", "x", "not a url", "c", "default").is_err());
        assert!(ChartRequest::new("r", "x", "ftp://charts.example.com", "c", "default").is_err());
        assert!(ChartRequest::new("Bad_Name", "x", "https://charts.example.com", "c", "default").is_err());
    }

    #[test]
    fn test_namespace_must_exist_or_be_created() {
        assert!(request().validate().is_err());
        assert!(request().create_namespace().validate().is_ok());

        let system = ChartRequest::new("r", "x", "https://charts.example.com", "c", "kube-system").unwrap();
        assert!(system.validate().is_ok());

        let mut template = Template::new("test");
        assert!(request().emit(&mut template, &reference("EksCluster"), None).is_err());
        assert_eq!(template.resource_count(), 0);
    }

    #[test]
    fn test_emit_orders_namespace_before_release() {
        let mut template = Template::new("test");
        let id = request()
            .create_namespace()
            .values(json!({ "installer": { "modules": ["cicd"] } }))
            .emit(&mut template, &reference("EksCluster"), Some("EksNodeGroup"))
            .unwrap();

        assert_eq!(id, "DevtronChart");
        let release = template.resource("DevtronChart").unwrap();
        assert!(release.depends_on.contains(&"DevtronNamespace".to_string()));
        assert!(release.depends_on.contains(&"EksNodeGroup".to_string()));
        assert_eq!(release.property("Chart").unwrap(), "devtron/devtron-operator");
        assert!(release
            .property("ValueYaml")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("cicd"));

        let namespace = template.resource("DevtronNamespace").unwrap();
        assert_eq!(namespace.resource_type, "AWSQS::Kubernetes::Resource");
    }

    #[test]
    fn test_load_balancer_controller() {
        let (request, binding) = load_balancer_controller("shop-dev-cluster", None).unwrap();
        assert_eq!(request.namespace, "kube-system");
        assert_eq!(request.values["serviceAccount"]["create"], false);
        assert_eq!(request.manifests.len(), 1);
        assert_eq!(binding.scope, "shop-dev-cluster");

        let mut template = Template::new("test");
        request
            .emit(&mut template, &reference("EksCluster"), None)
            .unwrap();
        let release = template.resource("AwsLoadBalancerControllerChart").unwrap();
        assert!(release
            .depends_on
            .contains(&"AwsLoadBalancerControllerManifest1".to_string()));
    }

    #[test]
    fn test_load_balancer_controller_on_fargate() {
        let vpc = reference("Vpc");
        let (request, binding) = load_balancer_controller("shop-dev-cluster", Some(&vpc)).unwrap();
        assert_eq!(request.values["vpcId"], "${VpcId}");
        assert_eq!(request.values["region"], "${Region}");
        assert_eq!(
            request.manifests[0]["metadata"]["annotations"]["eks.amazonaws.com/role-arn"],
            "${RoleArn}"
        );
        assert!(binding.web_identity_role().is_some());

        let mut template = Template::new("test");
        request
            .emit(&mut template, &reference("EksCluster"), None)
            .unwrap();
        let release = template.resource("AwsLoadBalancerControllerChart").unwrap();
        let values = &release.property("ValueYaml").unwrap()["Fn::Sub"];
        assert!(values[0].as_str().unwrap().contains("${VpcId}"));
        assert_eq!(values[1]["VpcId"], vpc);
        assert_eq!(values[1]["Region"], reference("AWS::Region"));
        // Only the variables the text uses are passed to Fn::Sub
        assert!(values[1].get("RoleArn").is_none());

        let manifest = template.resource("AwsLoadBalancerControllerManifest1").unwrap();
        let substitution = &manifest.property("Manifest").unwrap()["Fn::Sub"];
        assert_eq!(
            substitution[1]["RoleArn"],
            get_att("AwsLoadBalancerControllerWebIdentityRole", "Arn")
        );
    }

    #[test]
    fn test_resolved_fills_placeholders() {
        let (request, _) =
            load_balancer_controller("shop-dev-cluster", Some(&reference("Vpc"))).unwrap();
        let lookups: BTreeMap<String, String> = [
            ("VpcId", "vpc-0abc"),
            ("Region", "eu-west-1"),
            ("RoleArn", "arn:aws:iam::123456789012:role/shop-dev-cluster-aws-load-balancer-controller"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let resolved = request.resolved(&lookups).unwrap();
        assert!(resolved.variables.is_empty());
        assert_eq!(resolved.values["vpcId"], "vpc-0abc");
        assert_eq!(resolved.values["region"], "eu-west-1");
        assert!(resolved.manifests[0]["metadata"]["annotations"]["eks.amazonaws.com/role-arn"]
            .as_str()
            .unwrap()
            .ends_with(":role/shop-dev-cluster-aws-load-balancer-controller"));

        let mut partial = lookups.clone();
        partial.remove("RoleArn");
        assert!(request.resolved(&partial).is_err());
    }

    #[test]
    fn test_plain_values_stay_strings() {
        let mut template = Template::new("test");
        let (request, _) = load_balancer_controller("shop-dev-cluster", None).unwrap();
        request
            .emit(&mut template, &reference("EksCluster"), None)
            .unwrap();
        let release = template.resource("AwsLoadBalancerControllerChart").unwrap();
        assert!(release.property("ValueYaml").unwrap().is_string());
    }

    #[tokio::test]
    async fn test_write_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = request()
            .values(json!({ "global": { "storageClass": "gp2" } }))
            .write_values(dir.path())
            .await
            .unwrap();

        assert!(path.ends_with("devtron-values.yaml"));
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["global"]["storageClass"].as_str(), Some("gp2"));
    }
}
