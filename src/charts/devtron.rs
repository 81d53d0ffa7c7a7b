/// Devtron platform values and installation plan
use anyhow::Result;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::ChartRequest;
use crate::config::{DevtronConfig, StorageBackend};
use crate::identity::{IdentityBinding, PolicyStatement};

pub const DEVTRON_NAMESPACE: &str = "devtroncd";
pub const DEVTRON_RELEASE: &str = "devtron";
pub const DEVTRON_REPOSITORY: &str = "https://helm.devtron.ai";
pub const DEVTRON_CHART: &str = "devtron-operator";
pub const DEVTRON_SERVICE_ACCOUNT: &str = "devtron";
pub const DEVTRON_SERVICE: &str = "devtron-service";

/// Domain used when none is configured
pub const DEFAULT_DOMAIN: &str = "devtron.local";

const RESERVED_SUFFIXES: [&str; 5] = [".local", ".localhost", ".test", ".example", ".invalid"];
const DOCUMENTATION_DOMAINS: [&str; 3] = ["example.com", "example.net", "example.org"];

/// Whether no public certificate authority could issue for `domain`
pub fn is_reserved_domain(domain: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    if domain == "localhost" {
        return true;
    }
    if RESERVED_SUFFIXES.iter().any(|s| domain.ends_with(s)) {
        return true;
    }
    DOCUMENTATION_DOMAINS
        .iter()
        .any(|d| domain == *d || domain.ends_with(&format!(".{}", d)))
}

/// How the dashboard is reached from outside the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessMethod {
    LoadBalancer,
    Ingress {
        host: String,
        class: String,
        tls: bool,
    },
}

impl AccessMethod {
    /// Load balancer unless ingress is asked for and a load balancer is not forced
    pub fn decide(config: &DevtronConfig) -> Self {
        if config.use_load_balancer {
            return AccessMethod::LoadBalancer;
        }
        if config.enable_ingress {
            let domain = config.domain.as_deref().unwrap_or(DEFAULT_DOMAIN);
            return AccessMethod::Ingress {
                host: format!("devtron.{}", domain),
                class: config
                    .ingress_class
                    .clone()
                    .unwrap_or_else(|| "nginx".to_string()),
                tls: !is_reserved_domain(domain),
            };
        }
        AccessMethod::LoadBalancer
    }

    pub fn label(&self) -> &'static str {
        match self {
            AccessMethod::LoadBalancer => "LoadBalancer",
            AccessMethod::Ingress { .. } => "Ingress",
        }
    }

    /// Dashboard URL, or how to find it when the load balancer assigns the address
    pub fn url(&self) -> String {
        match self {
            AccessMethod::LoadBalancer => {
                format!("http://<EXTERNAL-IP of {}>", DEVTRON_SERVICE)
            }
            AccessMethod::Ingress { host, tls: true, .. } => format!("https://{}", host),
            AccessMethod::Ingress { host, .. } => format!("http://{}", host),
        }
    }

    fn apply(&self, values: &mut Map<String, Value>) {
        match self {
            AccessMethod::LoadBalancer => {
                values.insert(
                    "service".to_string(),
                    json!({
                        "type": "LoadBalancer",
                        "annotations": {
                            "service.beta.kubernetes.io/aws-load-balancer-type": "external",
                            "service.beta.kubernetes.io/aws-load-balancer-nlb-target-type": "ip",
                            "service.beta.kubernetes.io/aws-load-balancer-scheme": "internet-facing",
                            "service.beta.kubernetes.io/aws-load-balancer-cross-zone-load-balancing-enabled": "true",
                            "service.beta.kubernetes.io/aws-load-balancer-healthcheck-healthy-threshold": "2",
                            "service.beta.kubernetes.io/aws-load-balancer-healthcheck-unhealthy-threshold": "2",
                            "service.beta.kubernetes.io/aws-load-balancer-healthcheck-interval": "10",
                            "service.beta.kubernetes.io/aws-load-balancer-healthcheck-timeout": "5",
                        },
                    }),
                );
            }
            AccessMethod::Ingress { host, class, tls } => {
                let mut ingress = json!({
                    "enabled": true,
                    "className": class,
                    "hosts": [{
                        "host": host,
                        "paths": [{ "path": "/", "pathType": "Prefix" }],
                    }],
                });
                if *tls {
                    ingress["tls"] = json!([{ "secretName": "devtron-tls", "hosts": [host] }]);
                }
                values.insert("ingress".to_string(), ingress);
            }
        }
    }
}

fn small_resources() -> Value {
    json!({
        "requests": { "memory": "256Mi", "cpu": "250m" },
        "limits": { "memory": "512Mi", "cpu": "500m" },
    })
}

/// Everything decided about the Devtron release before it is installed
#[derive(Debug, Clone)]
pub struct DevtronPlan {
    pub access: AccessMethod,
    pub storage: StorageBackend,
    pub values: Value,
    config: DevtronConfig,
}

impl DevtronPlan {
    /// Assemble the values document; `default_region` fills an S3 backend without a region
    pub fn new(config: &DevtronConfig, default_region: Option<&str>) -> Result<Self> {
        let access = AccessMethod::decide(config);
        let storage = match &config.storage {
            StorageBackend::S3 { bucket, region } => {
                let region = region
                    .clone()
                    .or_else(|| default_region.map(str::to_string));
                if region.is_none() {
                    anyhow::bail!(
                        "S3 storage for Devtron needs a region: set devtron.storage.region or AWS_REGION"
                    );
                }
                StorageBackend::S3 {
                    bucket: bucket.clone(),
                    region,
                }
            }
            StorageBackend::Minio => StorageBackend::Minio,
        };

        let mut installer = json!({
            "release": DEVTRON_RELEASE,
            "modules": ["cicd"],
        });
        if let Some(email) = &config.admin_email {
            installer["adminEmail"] = json!(email);
        }
        if let Some(password) = &config.admin_password {
            installer["adminPassword"] = json!(password);
        }

        let mut values = Map::new();
        values.insert("installer".to_string(), installer);
        values.insert("argo-cd".to_string(), json!({ "enabled": true }));
        values.insert(
            "components".to_string(),
            json!({
                "dashboard": { "enabled": true },
                "devtron": { "enabled": true },
                "argocd": { "enabled": true },
            }),
        );
        values.insert(
            "postgresql".to_string(),
            json!({ "persistence": { "enabled": false }, "resources": small_resources() }),
        );
        values.insert(
            "prometheus".to_string(),
            json!({ "persistence": { "enabled": false }, "resources": small_resources() }),
        );
        values.insert(
            "monitoring".to_string(),
            json!({
                "enabled": config.enable_monitoring,
                "prometheus": { "enabled": config.enable_monitoring },
                "grafana": { "enabled": config.enable_monitoring },
            }),
        );
        values.insert(
            "global".to_string(),
            json!({ "storageClass": config.storage_class }),
        );

        match &storage {
            StorageBackend::Minio => {
                values.insert(
                    "minio".to_string(),
                    json!({
                        "enabled": true,
                        "persistence": { "enabled": false },
                        "resources": small_resources(),
                    }),
                );
            }
            StorageBackend::S3 { bucket, region } => {
                values.insert("minio".to_string(), json!({ "enabled": false }));
                values.insert(
                    "configs".to_string(),
                    json!({
                        "BLOB_STORAGE_PROVIDER": "S3",
                        "DEFAULT_CACHE_BUCKET": bucket,
                        "DEFAULT_BUILD_LOGS_BUCKET": bucket,
                        "DEFAULT_CACHE_BUCKET_REGION": region,
                        "DEFAULT_CD_LOGS_BUCKET_REGION": region,
                    }),
                );
            }
        }

        access.apply(&mut values);

        info!(
            "Devtron plan: access {}, storage {}, monitoring {}",
            access.label(),
            match storage {
                StorageBackend::Minio => "minio",
                StorageBackend::S3 { .. } => "s3",
            },
            config.enable_monitoring
        );

        Ok(Self {
            access,
            storage,
            values: Value::Object(values),
            config: config.clone(),
        })
    }

    /// The Helm release for the plan
    pub fn chart_request(&self) -> Result<ChartRequest> {
        Ok(ChartRequest::new(
            DEVTRON_RELEASE,
            "devtron",
            DEVTRON_REPOSITORY,
            DEVTRON_CHART,
            DEVTRON_NAMESPACE,
        )?
        .create_namespace()
        .version(self.config.chart_version.clone())
        .values(self.values.clone()))
    }

    /// Pod Identity for the Devtron service account, if it needs AWS permissions
    pub fn identity_binding(&self, cluster_name: &str) -> Result<Option<IdentityBinding>> {
        let mut statements: Vec<PolicyStatement> = self
            .config
            .service_account_policies
            .iter()
            .map(|preset| preset.statement())
            .collect();

        if let StorageBackend::S3 { bucket, .. } = &self.storage {
            statements.push(PolicyStatement {
                effect: "Allow",
                action: vec![
                    "s3:ListBucket".to_string(),
                    "s3:GetObject".to_string(),
                    "s3:PutObject".to_string(),
                    "s3:DeleteObject".to_string(),
                ],
                resource: vec![
                    format!("arn:aws:s3:::{}", bucket),
                    format!("arn:aws:s3:::{}/*", bucket),
                ],
                condition: None,
            });
        }

        if statements.is_empty() {
            debug!("Devtron service account needs no AWS permissions");
            return Ok(None);
        }

        IdentityBinding::workload(
            DEVTRON_NAMESPACE,
            DEVTRON_SERVICE_ACCOUNT,
            statements,
            cluster_name,
        )
        .map(Some)
    }

    pub fn admin_password_configured(&self) -> bool {
        self.config.admin_password.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PolicyPreset;

    fn config() -> DevtronConfig {
        DevtronConfig::default()
    }

    #[test]
    fn test_reserved_domains() {
        for domain in [
            "devtron.local",
            "localhost",
            "app.localhost",
            "ci.test",
            "site.example",
            "x.invalid",
            "example.com",
            "dev.example.org",
        ] {
            assert!(is_reserved_domain(domain), "{} should be reserved", domain);
        }
        for domain in ["acme.io", "notexample.com", "local.acme.dev"] {
            assert!(!is_reserved_domain(domain), "{} should not be reserved", domain);
        }
    }

    #[test]
    fn test_load_balancer_wins_over_ingress() {
        let config = DevtronConfig {
            use_load_balancer: true,
            enable_ingress: true,
            domain: Some("acme.io".to_string()),
            ..config()
        };
        let plan = DevtronPlan::new(&config, None).unwrap();
        assert_eq!(plan.access, AccessMethod::LoadBalancer);
        assert_eq!(plan.values["service"]["type"], "LoadBalancer");
        assert!(plan.values.get("ingress").is_none());
    }

    #[test]
    fn test_default_is_load_balancer() {
        let plan = DevtronPlan::new(&config(), None).unwrap();
        assert_eq!(plan.access, AccessMethod::LoadBalancer);
        assert_eq!(
            plan.values["service"]["annotations"]["service.beta.kubernetes.io/aws-load-balancer-scheme"],
            "internet-facing"
        );
    }

    #[test]
    fn test_ingress_tls_for_real_domain() {
        let config = DevtronConfig {
            enable_ingress: true,
            domain: Some("acme.io".to_string()),
            ..config()
        };
        let plan = DevtronPlan::new(&config, None).unwrap();
        let ingress = &plan.values["ingress"];
        assert_eq!(ingress["className"], "nginx");
        assert_eq!(ingress["hosts"][0]["host"], "devtron.acme.io");
        assert_eq!(ingress["tls"][0]["hosts"][0], "devtron.acme.io");
        assert_eq!(plan.access.url(), "https://devtron.acme.io");
    }

    #[test]
    fn test_ingress_without_tls_for_reserved_domain() {
        let config = DevtronConfig {
            enable_ingress: true,
            ingress_class: Some("alb".to_string()),
            ..config()
        };
        let plan = DevtronPlan::new(&config, None).unwrap();
        let ingress = &plan.values["ingress"];
        assert_eq!(ingress["className"], "alb");
        assert_eq!(ingress["hosts"][0]["host"], "devtron.devtron.local");
        assert!(ingress.get("tls").is_none());
        assert_eq!(plan.access.url(), "http://devtron.devtron.local");
    }

    #[test]
    fn test_s3_storage_disables_minio() {
        let config = DevtronConfig {
            storage: StorageBackend::S3 {
                bucket: "artifacts".to_string(),
                region: None,
            },
            ..config()
        };
        assert!(DevtronPlan::new(&config, None).is_err());

        let plan = DevtronPlan::new(&config, Some("eu-west-1")).unwrap();
        assert_eq!(plan.values["minio"]["enabled"], false);
        assert_eq!(plan.values["configs"]["BLOB_STORAGE_PROVIDER"], "S3");
        assert_eq!(plan.values["configs"]["DEFAULT_CACHE_BUCKET_REGION"], "eu-west-1");

        let binding = plan.identity_binding("c").unwrap().unwrap();
        assert_eq!(binding.scope, "c");
    }

    #[test]
    fn test_minio_storage_and_monitoring() {
        let config = DevtronConfig {
            enable_monitoring: true,
            storage_class: "gp3".to_string(),
            admin_email: Some("ops@acme.io".to_string()),
            ..config()
        };
        let plan = DevtronPlan::new(&config, None).unwrap();
        assert_eq!(plan.values["minio"]["enabled"], true);
        assert!(plan.values.get("configs").is_none());
        assert_eq!(plan.values["monitoring"]["grafana"]["enabled"], true);
        assert_eq!(plan.values["global"]["storageClass"], "gp3");
        assert_eq!(plan.values["postgresql"]["persistence"]["enabled"], false);
        assert_eq!(plan.values["installer"]["adminEmail"], "ops@acme.io");
        assert!(plan.values["installer"].get("adminPassword").is_none());
        assert!(!plan.admin_password_configured());
        assert!(plan.identity_binding("c").unwrap().is_none());
    }

    #[test]
    fn test_service_account_presets() {
        let config = DevtronConfig {
            service_account_policies: vec![PolicyPreset::S3, PolicyPreset::Bedrock],
            ..config()
        };
        let plan = DevtronPlan::new(&config, None).unwrap();
        let binding = plan.identity_binding("c").unwrap().unwrap();
        match binding.permission {
            crate::identity::Permission::Inline(statements) => assert_eq!(statements.len(), 2),
            other => panic!("unexpected permission {:?}", other),
        }
    }

    #[test]
    fn test_chart_request() {
        let config = DevtronConfig {
            chart_version: Some("0.22.74".to_string()),
            ..config()
        };
        let request = DevtronPlan::new(&config, None)
            .unwrap()
            .chart_request()
            .unwrap();
        assert!(request.create_namespace);
        assert_eq!(request.namespace, DEVTRON_NAMESPACE);
        assert_eq!(request.chart_reference(), "devtron/devtron-operator");
        assert_eq!(request.version.as_deref(), Some("0.22.74"));
        assert!(request.validate().is_ok());
    }
}
