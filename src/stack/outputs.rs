/// Operator-facing stack outputs
use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use serde_json::Value;

use crate::charts::devtron::{DEVTRON_NAMESPACE, DEVTRON_RELEASE, DEVTRON_SERVICE};
use crate::charts::AccessMethod;
use crate::template::{sub, Template};

/// Command outputs: (output name, description, command template)
const COMMANDS: &[(&str, &str, &str)] = &[
    (
        "KubectlCommand",
        "Command to configure kubectl for the cluster",
        "aws eks update-kubeconfig --region {{region}} --name {{cluster_name}}",
    ),
    (
        "RolloutStatusCommand",
        "Command to check that workloads have rolled out",
        "kubectl get nodes -o wide && kubectl wait --for=condition=Available deployment --all -n {{rollout_namespace}} --timeout=10m",
    ),
    (
        "CostCommand",
        "Command to show month-to-date cost of this project",
        "aws ce get-cost-and-usage --region us-east-1 --time-period Start=$(date -u +%Y-%m-01),End=$(date -u -d tomorrow +%Y-%m-%d) --granularity MONTHLY --metrics UnblendedCost --filter '{\"Tags\":{\"Key\":\"Project\",\"Values\":[\"{{project}}\"]}}'",
    ),
];

const DEVTRON_COMMANDS: &[(&str, &str, &str)] = &[
    (
        "DevtronPortForwardCommand",
        "Command to reach the Devtron dashboard locally",
        "kubectl port-forward svc/{{service}} -n {{namespace}} 32000:80",
    ),
    (
        "DevtronLogsCommand",
        "Command to follow Devtron logs",
        "kubectl logs -f deployment/{{release}} -n {{namespace}}",
    ),
];

const LOAD_BALANCER_COMMAND: &str =
    "kubectl get svc {{service}} -n {{namespace}} -o jsonpath='{.status.loadBalancer.ingress[0].hostname}'";

const ADMIN_PASSWORD_COMMAND: &str =
    "kubectl -n {{namespace}} get secret devtron-secret -o jsonpath='{.data.ADMIN_PASSWORD}' | base64 -d";

/// Values the command templates are rendered with
#[derive(Debug, Clone, Serialize)]
pub struct OutputContext {
    pub project: String,
    pub cluster_name: String,
    /// Literal region, or `${AWS::Region}` resolved at deploy time
    pub region: String,
    pub rollout_namespace: String,
    pub namespace: String,
    pub release: String,
    pub service: String,
}

impl OutputContext {
    pub fn new(project: &str, cluster_name: &str, region: Option<&str>, devtron: bool) -> Self {
        Self {
            project: project.to_string(),
            cluster_name: cluster_name.to_string(),
            region: region.unwrap_or("${AWS::Region}").to_string(),
            rollout_namespace: if devtron { DEVTRON_NAMESPACE } else { "kube-system" }.to_string(),
            namespace: DEVTRON_NAMESPACE.to_string(),
            release: DEVTRON_RELEASE.to_string(),
            service: DEVTRON_SERVICE.to_string(),
        }
    }
}

/// How Devtron reaches the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevtronDelivery {
    Disabled,
    Template,
    Deferred,
}

/// Renders operator commands
pub struct CommandRenderer {
    registry: Handlebars<'static>,
}

impl CommandRenderer {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);

        for (name, _, command) in COMMANDS.iter().chain(DEVTRON_COMMANDS) {
            registry
                .register_template_string(name, *command)
                .with_context(|| format!("Invalid command template {}", name))?;
        }
        registry
            .register_template_string("DevtronLoadBalancerCommand", LOAD_BALANCER_COMMAND)
            .context("Invalid command template DevtronLoadBalancerCommand")?;
        registry
            .register_template_string("DevtronAdminPasswordCommand", ADMIN_PASSWORD_COMMAND)
            .context("Invalid command template DevtronAdminPasswordCommand")?;

        Ok(Self { registry })
    }

    pub fn render(&self, name: &str, context: &OutputContext) -> Result<String> {
        self.registry
            .render(name, context)
            .with_context(|| format!("Failed to render {}", name))
    }

    /// Rendered command as an `Fn::Sub` so `${AWS::Region}` resolves
    fn value(&self, name: &str, context: &OutputContext) -> Result<Value> {
        Ok(sub(&self.render(name, context)?))
    }
}

/// Add the cluster command outputs
pub fn emit_cluster_outputs(template: &mut Template, context: &OutputContext) -> Result<()> {
    let renderer = CommandRenderer::new()?;
    for (name, description, _) in COMMANDS {
        template.add_output(*name, renderer.value(name, context)?, *description)?;
    }
    Ok(())
}

/// Add the Devtron access outputs
pub fn emit_devtron_outputs(
    template: &mut Template,
    context: &OutputContext,
    access: Option<&AccessMethod>,
    delivery: DevtronDelivery,
    password_configured: bool,
) -> Result<()> {
    let status = match delivery {
        DevtronDelivery::Disabled => "Not enabled (set devtron.enabled to install)".to_string(),
        DevtronDelivery::Template => format!("Installed by this stack as release {}", DEVTRON_RELEASE),
        DevtronDelivery::Deferred => format!(
            "Deferred: run `{} install-devtron` once the stack is complete",
            env!("CARGO_PKG_NAME")
        ),
    };
    template.add_output(
        "DevtronInstallationStatus",
        Value::String(status),
        "Devtron installation status",
    )?;

    let Some(access) = access else {
        return Ok(());
    };

    let renderer = CommandRenderer::new()?;
    template.add_output(
        "DevtronNamespace",
        Value::String(context.namespace.clone()),
        "Kubernetes namespace where Devtron is installed",
    )?;
    template.add_output(
        "DevtronAccessType",
        Value::String(access.label().to_string()),
        "Devtron access method",
    )?;
    template.add_output(
        "DevtronUrl",
        Value::String(access.url()),
        "Devtron dashboard URL",
    )?;
    if *access == AccessMethod::LoadBalancer {
        template.add_output(
            "DevtronLoadBalancerCommand",
            renderer.value("DevtronLoadBalancerCommand", context)?,
            "Command to get the Devtron load balancer hostname",
        )?;
    }
    for (name, description, _) in DEVTRON_COMMANDS {
        template.add_output(*name, renderer.value(name, context)?, *description)?;
    }
    if !password_configured {
        template.add_output(
            "DevtronAdminPasswordCommand",
            renderer.value("DevtronAdminPasswordCommand", context)?,
            "Command to read the generated Devtron admin password",
        )?;
    }
    Ok(())
}
