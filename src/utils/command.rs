/// External CLI execution (aws, kubectl, helm)
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Result from command execution with captured output
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CommandOutput {
    /// Create from tokio Command output
    fn from_output(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }

    /// Return Ok if successful, otherwise error with stderr
    pub fn into_result(self) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            anyhow::bail!("{}", self.stderr.trim())
        }
    }

    /// Parse stdout of a successful command as JSON
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        let stdout = self.into_result()?;
        serde_json::from_str(&stdout).context("Failed to parse command output as JSON")
    }
}

/// Builder for executing external commands with common patterns
pub struct CommandBuilder {
    command: Command,
    context_msg: Option<String>,
}

impl CommandBuilder {
    /// Create a new command builder
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let mut command = Command::new(program);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        Self {
            command,
            context_msg: None,
        }
    }

    /// Add a single argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.command.arg(arg);
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    /// Set an environment variable
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.command.env(key, val);
        self
    }

    /// Set KUBECONFIG environment variable
    pub fn kubeconfig(self, path: &Path) -> Self {
        self.env("KUBECONFIG", path)
    }

    /// Pass `--region` to the aws CLI when a region is known
    pub fn aws_region(self, region: Option<&str>) -> Self {
        match region {
            Some(region) => self.args(["--region", region]),
            None => self,
        }
    }

    /// Set context message for error reporting
    pub fn context<S: Into<String>>(mut self, msg: S) -> Self {
        self.context_msg = Some(msg.into());
        self
    }

    /// Execute and return raw output
    pub async fn output(mut self) -> Result<CommandOutput> {
        let output = if let Some(ctx) = &self.context_msg {
            self.command.output().await.context(ctx.clone())?
        } else {
            self.command.output().await?
        };
        Ok(CommandOutput::from_output(output))
    }

    /// Execute and return stdout on success, error on failure
    pub async fn run(self) -> Result<String> {
        self.output().await?.into_result()
    }

    /// Execute and ignore output (just check success)
    pub async fn run_silent(self) -> Result<()> {
        self.output().await?.into_result().map(|_| ())
    }

    /// Execute and deserialize stdout as JSON
    pub async fn run_json<T: DeserializeOwned>(self) -> Result<T> {
        self.output().await?.into_json()
    }
}

/// Check if a command-line tool is installed
pub async fn check_tool_installed(
    tool_name: &str,
    version_args: &[&str],
    install_url: &str,
) -> Result<()> {
    let output = CommandBuilder::new(tool_name)
        .args(version_args)
        .output()
        .await;

    match output {
        Ok(out) if out.success => Ok(()),
        _ => anyhow::bail!(
            "{} is not installed or not in PATH. Please install from {}",
            tool_name,
            install_url
        ),
    }
}
