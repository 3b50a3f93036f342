//! Terraform-backed instance lifecycle engine.
//!
//! Turns declarative instance specs into `*.tf.json` resource files, lets a
//! background loop run `terraform apply` over them, and rebuilds instance
//! descriptions from the files plus terraform's state dump.

pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod platform;
pub mod resource;
pub mod store;
pub mod tags;
pub mod terraform;

mod template;

pub use config::EngineConfig;
pub use engine::InstanceEngine;
pub use error::{EngineError, Result};
pub use platform::VmType;
pub use resource::{
    Attachment, InstanceDescription, InstanceId, InstanceSpec, ResourceDocument, ScopeValue,
};
pub use store::ResourceFileStore;
pub use tags::Tags;
pub use terraform::{
    ApplyCoordinator, CliTerraform, Leadership, Standalone, TerraformExecutor, TerraformOutput,
};
