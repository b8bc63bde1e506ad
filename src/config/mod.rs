use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Longest exit transition a surface may ask for
const MAX_EXIT_TRANSITION_MS: u64 = 60_000;

/// Overlay host configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Drop records from the registry once their overlay has fully closed
    pub prune_closed: bool,

    /// Duration of a surface's exit animation, in milliseconds
    pub exit_transition_ms: u64,

    /// Delay of the demo's before-close hook, in milliseconds
    pub hook_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prune_closed: false,
            exit_transition_ms: 150,
            hook_delay_ms: 50,
        }
    }
}

impl Config {
    /// Initialize configuration from the config file and the environment
    ///
    /// An explicit `path` must exist; otherwise the usual locations are tried
    /// and a missing file simply means defaults.
    pub async fn init(path: Option<&Path>) -> Result<Self> {
        debug!("Initializing configuration");

        let mut config = match path {
            Some(path) => Self::load_from_path(path).await?,
            None => Self::load_from_file().await?.unwrap_or_default(),
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Candidate config file locations, first match wins
    pub fn config_paths() -> Vec<PathBuf> {
        let mut config_paths = vec![
            PathBuf::from("./.overlay-kit.json"),
            PathBuf::from("./overlay-kit.json"),
        ];

        if let Some(config_dir) = dirs::config_dir() {
            config_paths.push(config_dir.join("overlay-kit").join("config.json"));
        }

        config_paths
    }

    /// Load the first config file found in [`Config::config_paths`]
    pub async fn load_from_file() -> Result<Option<Self>> {
        for path in Self::config_paths() {
            if path.exists() {
                return Self::load_from_path(&path).await.map(Some);
            }
        }
        Ok(None)
    }

    pub async fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Override values from `OVERLAY_*` environment variables
    pub fn load_from_env(&mut self) {
        if let Ok(prune) = std::env::var("OVERLAY_PRUNE_CLOSED") {
            self.prune_closed = prune.to_lowercase() == "true";
        }

        if let Ok(ms) = std::env::var("OVERLAY_EXIT_TRANSITION_MS") {
            if let Ok(ms) = ms.parse() {
                self.exit_transition_ms = ms;
            }
        }

        if let Ok(ms) = std::env::var("OVERLAY_HOOK_DELAY_MS") {
            if let Ok(ms) = ms.parse() {
                self.hook_delay_ms = ms;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.exit_transition_ms > MAX_EXIT_TRANSITION_MS {
            return Err(anyhow::anyhow!(
                "exit_transition_ms must be at most {} (got {})",
                MAX_EXIT_TRANSITION_MS,
                self.exit_transition_ms
            ));
        }
        Ok(())
    }

    pub fn exit_transition(&self) -> Duration {
        Duration::from_millis(self.exit_transition_ms)
    }

    pub fn hook_delay(&self) -> Duration {
        Duration::from_millis(self.hook_delay_ms)
    }
}
