pub mod apply;
pub mod executor;
pub mod state;

pub use apply::{ApplyCoordinator, ApplySettings, Leadership, Standalone};
pub use executor::{CliTerraform, TerraformExecutor, TerraformOutput};
pub use state::{FlatValue, Scalar, decode_resource, decode_resources};
