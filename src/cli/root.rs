use anyhow::Result;
use clap::{Parser, Subcommand};
use overlay_kit::Config;
use std::path::PathBuf;
use tracing::debug;

use super::demo::DemoCommand;
use super::schema::SchemaCommand;

/// overlayctl - exercise the overlay lifecycle coordinator from a terminal
#[derive(Parser)]
#[command(
    name = "overlayctl",
    version,
    about = "Exercise the overlay lifecycle coordinator from a terminal",
    long_about = r#"overlayctl drives an overlay registry against a console surface, showing how
overlays open, wait for their before-close hooks and hand back results.

Examples:
  overlayctl                        # Run the scripted demo
  overlayctl demo --only drawer     # Run one demo scenario
  overlayctl config                 # Print the effective configuration
  overlayctl schema --pretty        # Print the configuration JSON schema"#
)]
pub struct Cli {
    /// Configuration file to load instead of the default locations
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scripted overlay demo
    Demo(DemoCommand),

    /// Print the effective configuration as JSON
    Config,

    /// Generate or check the configuration schema
    Schema(SchemaCommand),
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let config = Config::init(self.config.as_deref()).await?;
        debug!("Configuration initialized: {:?}", config);

        match self.command {
            Some(Commands::Demo(demo)) => demo.execute(&config).await,
            Some(Commands::Config) => {
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            Some(Commands::Schema(schema)) => schema.execute().await,
            None => DemoCommand::default().execute(&config).await,
        }
    }
}
