//! Terraform command execution.
//!
//! The engine never talks to the terraform binary directly; everything goes
//! through [`TerraformExecutor`] so the orchestration logic can be exercised
//! without a terraform installation.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{EngineError, Result};

/// Captured result of a terraform invocation.
#[derive(Debug, Clone, Default)]
pub struct TerraformOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for TerraformOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

impl TerraformOutput {
    /// Converts a non-zero exit into [`EngineError::Terraform`].
    pub fn into_result(self, command: &str) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(EngineError::Terraform {
                command: command.to_string(),
                message: self.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
pub trait TerraformExecutor: Send + Sync {
    async fn apply(&self, refresh: bool) -> Result<TerraformOutput>;

    async fn refresh(&self) -> Result<TerraformOutput>;

    /// Legacy flattened dump of every resource in state.
    async fn show(&self) -> Result<TerraformOutput>;

    async fn state_show(&self, address: &str) -> Result<TerraformOutput>;

    async fn state_list(&self) -> Result<TerraformOutput>;

    async fn import(&self, address: &str, cloud_id: &str) -> Result<TerraformOutput>;

    async fn state_rm(&self, address: &str) -> Result<TerraformOutput>;
}

/// Runs the real terraform binary inside the resource file directory.
pub struct CliTerraform {
    binary: String,
    work_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl CliTerraform {
    pub fn new(binary: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: work_dir.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    async fn run(&self, args: &[&str]) -> Result<TerraformOutput> {
        tracing::debug!(binary = %self.binary, ?args, "running terraform");
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.work_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .map_err(|e| EngineError::Terraform {
                command: args.first().copied().unwrap_or_default().to_string(),
                message: format!("failed to execute {}: {e}", self.binary),
            })?;
        Ok(output.into())
    }
}

#[async_trait]
impl TerraformExecutor for CliTerraform {
    async fn apply(&self, refresh: bool) -> Result<TerraformOutput> {
        let mut args = vec!["apply", "-auto-approve", "-no-color"];
        if !refresh {
            args.push("-refresh=false");
        }
        self.run(&args).await
    }

    async fn refresh(&self) -> Result<TerraformOutput> {
        self.run(&["refresh", "-no-color"]).await
    }

    async fn show(&self) -> Result<TerraformOutput> {
        self.run(&["show", "-no-color"]).await
    }

    async fn state_show(&self, address: &str) -> Result<TerraformOutput> {
        self.run(&["state", "show", "-no-color", address]).await
    }

    async fn state_list(&self) -> Result<TerraformOutput> {
        self.run(&["state", "list", "-no-color"]).await
    }

    async fn import(&self, address: &str, cloud_id: &str) -> Result<TerraformOutput> {
        self.run(&["import", "-no-color", address, cloud_id]).await
    }

    async fn state_rm(&self, address: &str) -> Result<TerraformOutput> {
        self.run(&["state", "rm", address]).await
    }
}

/// Records every invocation instead of running terraform.
#[cfg(test)]
#[derive(Default)]
pub struct MockTerraform {
    pub calls: std::sync::Mutex<Vec<String>>,
    pub show_output: String,
    pub state_list_output: String,
    /// Returned by `state show` for every address.
    pub state_show_output: String,
    pub fail_apply: bool,
    pub fail_show: bool,
    pub fail_import: bool,
}

#[cfg(test)]
impl MockTerraform {
    pub fn with_show_output(mut self, output: impl Into<String>) -> Self {
        self.show_output = output.into();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(command))
            .count()
    }

    fn record(&self, call: String, success: bool, stdout: &str) -> Result<TerraformOutput> {
        self.calls.lock().unwrap().push(call);
        Ok(TerraformOutput {
            success,
            stdout: stdout.to_string(),
            stderr: if success { String::new() } else { "mock failure".to_string() },
        })
    }
}

#[cfg(test)]
#[async_trait]
impl TerraformExecutor for MockTerraform {
    async fn apply(&self, refresh: bool) -> Result<TerraformOutput> {
        self.record(format!("apply refresh={refresh}"), !self.fail_apply, "")
    }

    async fn refresh(&self) -> Result<TerraformOutput> {
        self.record("refresh".to_string(), true, "")
    }

    async fn show(&self) -> Result<TerraformOutput> {
        self.record("show".to_string(), !self.fail_show, &self.show_output)
    }

    async fn state_show(&self, address: &str) -> Result<TerraformOutput> {
        self.record(format!("state_show {address}"), true, &self.state_show_output)
    }

    async fn state_list(&self) -> Result<TerraformOutput> {
        self.record("state_list".to_string(), true, &self.state_list_output)
    }

    async fn import(&self, address: &str, cloud_id: &str) -> Result<TerraformOutput> {
        self.record(format!("import {address} {cloud_id}"), !self.fail_import, "")
    }

    async fn state_rm(&self, address: &str) -> Result<TerraformOutput> {
        self.record(format!("state_rm {address}"), true, "")
    }
}
