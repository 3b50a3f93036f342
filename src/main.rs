mod cli;
mod output;

use std::path::Path;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use terraform_instance::{InstanceEngine, InstanceId, InstanceSpec, Tags};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.store.into_config();
    std::fs::create_dir_all(&config.dir)
        .wrap_err_with(|| format!("cannot create {}", config.dir.display()))?;
    tracing::debug!(dir = %config.dir.display(), "using resource directory");
    let engine = InstanceEngine::new(config);

    match cli.command {
        Command::Validate { spec } => {
            engine.validate(&read_spec(&spec)?)?;
            println!("ok");
        }
        Command::Provision { spec, apply } => {
            let id = engine.provision(read_spec(&spec)?).await?;
            println!("{id}");
            if apply {
                engine.coordinator().apply_now().await?;
            }
        }
        Command::Import { spec, cloud_id } => {
            let id = engine.import_instance(read_spec(&spec)?, &cloud_id).await?;
            println!("{id}");
        }
        Command::Destroy { id, apply } => {
            engine.destroy(&InstanceId::new(id)).await?;
            if apply {
                engine.coordinator().apply_now().await?;
            }
        }
        Command::Label { id, tags } => {
            let tags: Tags = tags.into_iter().collect();
            engine.label(&InstanceId::new(id), &tags).await?;
        }
        Command::Describe { tags, properties } => {
            let filter: Tags = tags.into_iter().collect();
            let instances = engine.describe_instances(&filter, properties).await?;
            if properties {
                println!("{}", serde_json::to_string_pretty(&instances)?);
            } else {
                println!("{}", output::instances_table(&instances));
            }
            tracing::info!(count = instances.len(), "describe complete");
        }
        Command::Apply => {
            engine.coordinator().apply_now().await?;
        }
        Command::Run => {
            engine.start().await?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("interrupted, stopping apply loop");
            engine.coordinator().stop();
        }
    }

    Ok(())
}

fn read_spec(path: &Path) -> Result<InstanceSpec> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).wrap_err_with(|| format!("malformed spec {}", path.display()))
}
