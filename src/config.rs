use std::path::PathBuf;
use std::time::Duration;

use crate::terraform::ApplySettings;

pub const DEFAULT_TERRAFORM_BIN: &str = "terraform";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_SETTLE_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_LOCK_RETRY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the `*.tf.json` files and terraform state.
    pub dir: PathBuf,
    pub terraform_bin: String,
    /// Extra environment passed to every terraform invocation.
    pub env: Vec<(String, String)>,
    pub poll_interval: Duration,
    pub settle_window: Duration,
    pub lock_retry: Duration,
    /// Run `apply` with state refresh (`-refresh=false` otherwise).
    pub refresh_on_apply: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            terraform_bin: DEFAULT_TERRAFORM_BIN.to_string(),
            env: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_window: DEFAULT_SETTLE_WINDOW,
            lock_retry: DEFAULT_LOCK_RETRY,
            refresh_on_apply: false,
        }
    }
}

impl EngineConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn apply_settings(&self) -> ApplySettings {
        ApplySettings {
            poll_interval: self.poll_interval,
            settle_window: self.settle_window,
            refresh: self.refresh_on_apply,
        }
    }
}
