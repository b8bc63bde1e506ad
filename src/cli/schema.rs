//! Schema command for configuration validation and JSON schema generation

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use overlay_kit::Config;
use schemars::schema_for;
use serde_json::Value;
use std::{fs, path::PathBuf};

/// Generate and validate configuration schemas
#[derive(Debug, Args)]
pub struct SchemaCommand {
    /// Output file path (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Pretty print the output
    #[arg(short, long)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Option<SchemaSubcommand>,
}

#[derive(Debug, Subcommand)]
pub enum SchemaSubcommand {
    /// Generate JSON schema for configuration
    Generate,
    /// Check that a configuration file loads and validates
    Validate {
        /// Configuration file to validate
        config_file: PathBuf,
    },
}

impl SchemaCommand {
    pub async fn execute(&self) -> Result<()> {
        match &self.command {
            Some(SchemaSubcommand::Validate { config_file }) => self.validate_config(config_file).await,
            Some(SchemaSubcommand::Generate) | None => self.generate_schema(),
        }
    }

    fn generate_schema(&self) -> Result<()> {
        let schema = schema_for!(Config);
        let mut schema_value = serde_json::to_value(schema)
            .context("Failed to convert schema to JSON value")?;

        if let Some(obj) = schema_value.as_object_mut() {
            obj.insert(
                "description".to_string(),
                Value::String("Configuration for the overlay host and the overlayctl demo".to_string()),
            );
        }

        let output = if self.pretty {
            serde_json::to_string_pretty(&schema_value)?
        } else {
            serde_json::to_string(&schema_value)?
        };

        if let Some(ref output_path) = self.output {
            fs::write(output_path, output)
                .with_context(|| format!("Failed to write schema to: {}", output_path.display()))?;
            println!("Schema written to: {}", output_path.display());
        } else {
            println!("{}", output);
        }

        Ok(())
    }

    async fn validate_config(&self, config_file: &PathBuf) -> Result<()> {
        let config = Config::load_from_path(config_file)
            .await
            .with_context(|| format!("Failed to load config file: {}", config_file.display()))?;
        config.validate()?;

        println!("Configuration is valid: {}", config_file.display());
        Ok(())
    }
}
