use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use terraform_instance::EngineConfig;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub struct StoreArgs {
    /// Directory holding the resource files and terraform state
    #[arg(long, env = "INFRAKIT_TERRAFORM_DIR", global = true)]
    pub dir: Option<PathBuf>,

    #[arg(
        long,
        env = "INFRAKIT_TERRAFORM_BIN",
        default_value = "terraform",
        global = true
    )]
    pub terraform: String,

    /// Seconds between background apply passes
    #[arg(
        long,
        env = "INFRAKIT_TERRAFORM_POLL_SECS",
        default_value_t = 120,
        global = true
    )]
    pub poll_secs: u64,

    /// Seconds to wait for related writes before the first apply
    #[arg(
        long,
        env = "INFRAKIT_TERRAFORM_SETTLE_SECS",
        default_value_t = 5,
        global = true
    )]
    pub settle_secs: u64,

    /// Refresh state during apply
    #[arg(long, env = "INFRAKIT_TERRAFORM_REFRESH", global = true)]
    pub refresh: bool,

    /// Extra KEY=VALUE environment for terraform
    #[arg(long = "env", value_parser = parse_key_val, global = true)]
    pub env: Vec<(String, String)>,
}

impl StoreArgs {
    pub fn into_config(self) -> EngineConfig {
        let dir = self.dir.unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join("infrakit").join("terraform"))
                .unwrap_or_else(|| PathBuf::from("."))
        });
        EngineConfig {
            terraform_bin: self.terraform,
            env: self.env,
            poll_interval: Duration::from_secs(self.poll_secs),
            settle_window: Duration::from_secs(self.settle_secs),
            refresh_on_apply: self.refresh,
            ..EngineConfig::new(dir)
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check an instance spec without writing anything
    Validate { spec: PathBuf },
    /// Write the resource files for a new instance
    Provision {
        spec: PathBuf,
        /// Apply in the foreground afterwards
        #[arg(long)]
        apply: bool,
    },
    /// Provision an instance and import an existing cloud resource as its VM
    Import { spec: PathBuf, cloud_id: String },
    /// Remove an instance and the files only it references
    Destroy {
        id: String,
        #[arg(long)]
        apply: bool,
    },
    /// Merge KEY=VALUE tags into an instance
    Label {
        id: String,
        #[arg(value_parser = parse_key_val, required = true)]
        tags: Vec<(String, String)>,
    },
    /// List instances, optionally filtered by KEY=VALUE tags
    Describe {
        #[arg(long = "tag", value_parser = parse_key_val)]
        tags: Vec<(String, String)>,
        /// Include live attributes from terraform state
        #[arg(long)]
        properties: bool,
    },
    /// Run a single terraform apply
    Apply,
    /// Refresh state and keep applying in the background until interrupted
    Run,
}

pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
