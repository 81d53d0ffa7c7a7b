/// CloudFormation stack operations
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info, warn};

use super::models::{DescribeStackEventsResponse, DescribeStacksResponse, StackDescription, StackEvent, StackPhase};
use crate::utils::command::CommandBuilder;
use crate::utils::polling::PollingConfig;

/// Largest template body the API accepts without an S3 upload
const MAX_INLINE_TEMPLATE_BYTES: u64 = 51_200;

/// Drives CloudFormation through the aws CLI
pub struct CloudFormation {
    region: Option<String>,
}

impl CloudFormation {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }

    fn command(&self) -> CommandBuilder {
        CommandBuilder::new("aws")
            .args(["cloudformation"])
            .aws_region(self.region.as_deref())
    }

    /// Create or update the stack from a template file
    pub async fn deploy(
        &self,
        template_path: &Path,
        stack_name: &str,
        s3_bucket: Option<&str>,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let size = tokio::fs::metadata(template_path)
            .await
            .with_context(|| format!("Failed to read {}", template_path.display()))?
            .len();
        if size > MAX_INLINE_TEMPLATE_BYTES && s3_bucket.is_none() {
            anyhow::bail!(
                "Template is {} bytes, above the {} byte inline limit; pass --s3-bucket",
                size,
                MAX_INLINE_TEMPLATE_BYTES
            );
        }

        info!("Deploying stack {}...", stack_name);

        let mut command = self
            .command()
            .args(["deploy", "--template-file"])
            .arg(template_path)
            .args([
                "--stack-name",
                stack_name,
                "--capabilities",
                "CAPABILITY_NAMED_IAM",
                "--no-fail-on-empty-changeset",
            ]);
        if let Some(bucket) = s3_bucket {
            command = command.args(["--s3-bucket", bucket]);
        }
        if !tags.is_empty() {
            command = command
                .arg("--tags")
                .args(tags.iter().map(|(k, v)| format!("{}={}", k, v)));
        }

        let output = command
            .context("Failed to run aws cloudformation deploy")
            .output()
            .await?;

        if !output.success {
            self.report_failures(stack_name).await;
            anyhow::bail!("Stack deployment failed: {}", output.stderr.trim());
        }

        Ok(())
    }

    /// Current description, `None` if the stack does not exist
    pub async fn describe(&self, stack_name: &str) -> Result<Option<StackDescription>> {
        let output = self
            .command()
            .args(["describe-stacks", "--stack-name", stack_name, "--output", "json"])
            .context("Failed to run aws cloudformation describe-stacks")
            .output()
            .await?;

        if !output.success {
            if output.stderr.contains("does not exist") {
                return Ok(None);
            }
            anyhow::bail!("Failed to describe stack {}: {}", stack_name, output.stderr.trim());
        }

        let response: DescribeStacksResponse = output.into_json()?;
        Ok(response.stacks.into_iter().next())
    }

    /// Wait for the stack to leave every in-progress status
    pub async fn wait_for_stack(&self, stack_name: &str, timeout_secs: u64) -> Result<StackDescription> {
        let config = PollingConfig::new(
            timeout_secs,
            20,
            format!("Waiting for stack {} to settle", stack_name),
        );

        let stack = config
            .poll(|| async {
                let stack = self
                    .describe(stack_name)
                    .await?
                    .with_context(|| format!("Stack {} does not exist", stack_name))?;
                info!("Stack {}: {}", stack_name, stack.stack_status);
                Ok(stack.phase().is_terminal().then_some(stack))
            })
            .await?;

        match stack.phase() {
            StackPhase::Complete => Ok(stack),
            _ => {
                self.report_failures(stack_name).await;
                anyhow::bail!(
                    "Stack {} ended in {}{}",
                    stack_name,
                    stack.stack_status,
                    stack
                        .stack_status_reason
                        .as_deref()
                        .map(|r| format!(": {}", r))
                        .unwrap_or_default()
                )
            }
        }
    }

    /// Delete the stack and wait until it is gone
    pub async fn delete(&self, stack_name: &str, timeout_secs: u64) -> Result<()> {
        if self.describe(stack_name).await?.is_none() {
            warn!("Stack {} does not exist, nothing to delete", stack_name);
            return Ok(());
        }

        info!("Deleting stack {}...", stack_name);
        self.command()
            .args(["delete-stack", "--stack-name", stack_name])
            .context("Failed to run aws cloudformation delete-stack")
            .run_silent()
            .await?;

        let config = PollingConfig::new(
            timeout_secs,
            20,
            format!("Waiting for stack {} to be deleted", stack_name),
        );
        config
            .poll_until(|| async {
                match self.describe(stack_name).await? {
                    None => Ok(true),
                    Some(stack) => match stack.phase() {
                        StackPhase::Deleted => Ok(true),
                        StackPhase::InProgress => Ok(false),
                        _ => anyhow::bail!(
                            "Stack {} deletion stopped in {}",
                            stack_name,
                            stack.stack_status
                        ),
                    },
                }
            })
            .await
    }

    /// Account the current credentials belong to
    pub async fn caller_account(&self) -> Result<String> {
        let account = CommandBuilder::new("aws")
            .args(["sts", "get-caller-identity", "--query", "Account", "--output", "text"])
            .aws_region(self.region.as_deref())
            .context("Failed to run aws sts get-caller-identity")
            .run()
            .await?;
        Ok(account.trim().to_string())
    }

    /// Most recent failed resource events, newest first
    pub async fn failure_events(&self, stack_name: &str) -> Result<Vec<StackEvent>> {
        let response: DescribeStackEventsResponse = self
            .command()
            .args(["describe-stack-events", "--stack-name", stack_name, "--output", "json"])
            .context("Failed to run aws cloudformation describe-stack-events")
            .run_json()
            .await?;

        Ok(response
            .stack_events
            .into_iter()
            .filter(StackEvent::is_failure)
            .take(5)
            .collect())
    }

    async fn report_failures(&self, stack_name: &str) {
        match self.failure_events(stack_name).await {
            Ok(events) => {
                for event in events {
                    error!(
                        "{} ({}): {} {}",
                        event.logical_resource_id,
                        event.resource_type,
                        event.resource_status,
                        event.resource_status_reason.unwrap_or_default()
                    );
                }
            }
            Err(e) => warn!("Could not fetch stack events: {}", e),
        }
    }
}
