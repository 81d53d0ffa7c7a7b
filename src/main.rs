/// eks-devtron - EKS clusters with the Devtron platform
///
/// Synthesizes a CloudFormation template for an EKS cluster (network,
/// security groups, IAM, compute) and installs Devtron on top of it.
mod aws;
mod charts;
mod cluster;
mod config;
mod identity;
mod network;
mod security;
mod stack;
mod template;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::aws::CloudFormation;
use crate::charts::devtron::DEVTRON_NAMESPACE;
use crate::charts::ChartInstaller;
use crate::config::{DeploymentConfig, EnvironmentParams};
use crate::stack::{StackBuilder, SynthesizedStack};
use crate::utils::command::check_tool_installed;

/// Stack operations can take a long time (EKS control plane creation alone is ~15 minutes)
const STACK_TIMEOUT_SECS: u64 = 3600;
const DEVTRON_READY_TIMEOUT_SECS: u64 = 1800;

#[derive(Parser)]
#[command(name = "eks-devtron")]
#[command(about = "Deploy EKS clusters with the Devtron platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "stack.yaml")]
    config: PathBuf,

    /// Output directory for generated files
    #[arg(short, long, default_value = "./output")]
    output: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Add this machine's public IP to the allowed inbound CIDRs
    #[arg(long)]
    allow_my_ip: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate example configuration file
    Init,

    /// Write the CloudFormation template and chart values
    Synth,

    /// Synthesize and deploy the stack
    Deploy {
        /// Bucket for uploading templates above the inline size limit
        #[arg(long)]
        s3_bucket: Option<String>,

        /// Install deferred charts once the stack is complete
        #[arg(long)]
        install_charts: bool,
    },

    /// Show stack status and outputs
    Status,

    /// Delete the stack
    Destroy,

    /// Install the load balancer controller and Devtron into the deployed cluster
    InstallDevtron,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("eks_devtron={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Execute command
    let result = match cli.command {
        Commands::Init => init_config(&cli).await,
        Commands::Synth => synth(&cli).await.map(|_| ()),
        Commands::Deploy {
            ref s3_bucket,
            install_charts,
        } => deploy(&cli, s3_bucket.as_deref(), install_charts).await,
        Commands::Status => show_status(&cli).await,
        Commands::Destroy => destroy(&cli).await,
        Commands::InstallDevtron => install_devtron(&cli).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Environment parameters and configuration, with `--allow-my-ip` applied
async fn load(cli: &Cli) -> Result<(EnvironmentParams, DeploymentConfig)> {
    let params = EnvironmentParams::from_env().context("Invalid deployment environment")?;
    let mut config =
        DeploymentConfig::load_or_default(&cli.config).context("Failed to load configuration")?;

    if cli.allow_my_ip {
        let cidr = security::current_public_ip().await?;
        info!("Detected current IP address: {}", cidr);
        let cidr = cidr.to_string();
        if !config.security.allow_inbound_cidrs.contains(&cidr) {
            config.security.allow_inbound_cidrs.push(cidr);
        }
    }

    Ok((params, config))
}

/// Write the template and chart values
async fn synth(cli: &Cli) -> Result<(EnvironmentParams, SynthesizedStack, PathBuf)> {
    let (params, config) = load(cli).await?;
    let stack = StackBuilder::new(&params, &config, &cli.output).build()?;
    let template_path = stack.write(&cli.output).await?;

    info!("✓ Synthesized stack {}", stack.stack_name);
    info!("  Template: {}", template_path.display());
    for (name, output) in stack.template.outputs() {
        debug!("  Output {}: {}", name, output.description);
    }
    for chart in &stack.deferred_charts {
        info!(
            "  Values: {}",
            cli.output
                .join(format!("{}-values.yaml", chart.release))
                .display()
        );
    }

    Ok((params, stack, template_path))
}

/// Synthesize and deploy the stack
async fn deploy(cli: &Cli, s3_bucket: Option<&str>, install_charts: bool) -> Result<()> {
    check_tool_installed(
        "aws",
        &["--version"],
        "https://docs.aws.amazon.com/cli/latest/userguide/getting-started-install.html",
    )
    .await
    .context("aws CLI is required")?;

    let (params, stack, template_path) = synth(cli).await?;
    let cloudformation = CloudFormation::new(params.target.region.clone());

    if let Some(expected) = &params.target.account {
        let account = cloudformation.caller_account().await?;
        if &account != expected {
            anyhow::bail!(
                "AWS credentials belong to account {}, but AWS_ACCOUNT is {}",
                account,
                expected
            );
        }
    }

    cloudformation
        .deploy(&template_path, &stack.stack_name, s3_bucket, &stack.tags)
        .await?;
    let description = cloudformation
        .wait_for_stack(&stack.stack_name, STACK_TIMEOUT_SECS)
        .await?;

    info!("✓ Stack {} is {}", description.stack_name, description.stack_status);
    info!("");
    info!("Outputs:");
    for output in &description.outputs {
        info!("  {}: {}", output.output_key, output.output_value);
    }

    if let Some(command) = description.output("KubectlCommand") {
        info!("");
        info!("Configure kubectl:");
        info!("  {}", command);
    }

    if stack.deferred_charts.is_empty() {
        return Ok(());
    }
    if install_charts {
        return install_charts_into(cli, &params, &stack).await;
    }

    info!("");
    info!("Next step:");
    info!("  eks-devtron install-devtron");
    Ok(())
}

/// Show stack status and outputs
async fn show_status(cli: &Cli) -> Result<()> {
    let (params, _) = load(cli).await?;
    let stack_name = params.stack_name();
    let cloudformation = CloudFormation::new(params.target.region.clone());

    let Some(description) = cloudformation.describe(&stack_name).await? else {
        info!("Stack {} is not deployed", stack_name);
        return Ok(());
    };

    info!("Stack: {}", description.stack_name);
    info!("  Status: {}", description.stack_status);
    if let Some(reason) = &description.stack_status_reason {
        info!("  Reason: {}", reason);
    }
    if let Some(created) = &description.creation_time {
        info!("  Created: {}", created);
    }
    if let Some(updated) = &description.last_updated_time {
        info!("  Updated: {}", updated);
    }

    info!("");
    info!("Outputs:");
    for output in &description.outputs {
        info!("  {}: {}", output.output_key, output.output_value);
    }

    // Show Devtron pods if a kubeconfig was written by install-devtron
    let installer = ChartInstaller::new(&cli.output, params.target.region.clone());
    if installer.kubeconfig_path().exists() {
        info!("");
        info!("Devtron pods:");
        match installer.status(DEVTRON_NAMESPACE).await {
            Ok(status) => info!("{}", status),
            Err(e) => info!("Could not get Devtron status: {}", e),
        }
    }

    Ok(())
}

/// Delete the stack
async fn destroy(cli: &Cli) -> Result<()> {
    let (params, _) = load(cli).await?;
    let stack_name = params.stack_name();

    info!("Destroying stack {}...", stack_name);
    CloudFormation::new(params.target.region.clone())
        .delete(&stack_name, STACK_TIMEOUT_SECS)
        .await?;

    warn!("Load balancers created by Kubernetes services are not part of the stack; check for leftovers in the VPC if deletion stalled");
    info!("✓ Stack {} destroyed", stack_name);
    Ok(())
}

/// Install the deferred charts into the deployed cluster
async fn install_devtron(cli: &Cli) -> Result<()> {
    let (params, config) = load(cli).await?;
    let stack = StackBuilder::new(&params, &config, &cli.output).build()?;
    install_charts_into(cli, &params, &stack).await
}

async fn install_charts_into(
    cli: &Cli,
    params: &EnvironmentParams,
    stack: &SynthesizedStack,
) -> Result<()> {
    if stack.deferred_charts.is_empty() {
        info!("Charts are managed by the stack template; nothing to install");
        return Ok(());
    }

    ChartInstaller::check_tools().await?;

    let installer = ChartInstaller::new(&cli.output, params.target.region.clone());
    installer.update_kubeconfig(&stack.cluster_name).await?;

    for chart in &stack.deferred_charts {
        let chart = installer.resolve(&stack.cluster_name, chart).await?;
        installer.install(&chart).await?;
    }

    let Some(devtron) = &stack.devtron else {
        info!("✓ Charts installed (Devtron disabled)");
        return Ok(());
    };

    installer
        .wait_for_pods(DEVTRON_NAMESPACE, DEVTRON_READY_TIMEOUT_SECS)
        .await?;

    info!("✓ Devtron installed successfully!");
    info!("");
    info!("Access ({}):", devtron.access.label());
    info!("  URL: {}", devtron.access.url());
    info!(
        "  Port forward: kubectl port-forward svc/devtron-service -n {} 32000:80",
        DEVTRON_NAMESPACE
    );
    if !devtron.admin_password_configured() {
        info!(
            "  Admin password: kubectl -n {} get secret devtron-secret -o jsonpath='{{.data.ADMIN_PASSWORD}}' | base64 -d",
            DEVTRON_NAMESPACE
        );
    }
    info!("");
    info!("  export KUBECONFIG={}", installer.kubeconfig_path().display());

    Ok(())
}

/// Initialize example configuration file
async fn init_config(cli: &Cli) -> Result<()> {
    if cli.config.exists() {
        anyhow::bail!(
            "Configuration file already exists: {}",
            cli.config.display()
        );
    }

    let example_config = DeploymentConfig::example();
    let yaml = serde_yaml::to_string(&example_config)?;

    tokio::fs::write(&cli.config, yaml)
        .await
        .context("Failed to write configuration file")?;

    info!("Example configuration created: {}", cli.config.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the configuration file to match your requirements");
    info!("  2. Set the deployment environment:");
    info!("     export PROJECT_NAME=shop ENV_NAME=dev AWS_REGION=eu-west-1");
    info!("  3. Deploy the stack:");
    info!("     eks-devtron deploy");
    info!("  4. Install Devtron:");
    info!("     eks-devtron install-devtron");

    Ok(())
}
