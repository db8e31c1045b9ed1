use crate::core::config::{SEARCH_PATHS, TEMPERATURE};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

/// alphageist - Ask questions about your documents
#[derive(Parser, Debug)]
#[command(name = "alphageist")]
#[command(about = "Semantic search and question answering over local document folders", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file to use (default: <base dir>/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Custom base directory (default: the platform data directory)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the application directories and a default config file
    Init,
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Build the index for the configured search paths
    Index {
        /// Delete the existing index and build it again
        #[arg(short, long)]
        rebuild: bool,
    },
    /// Ask a question about your documents
    Ask {
        /// The question
        query: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the configuration (credential masked)
    Show,
    /// Set a configuration key
    Set {
        key: String,
        /// Comma-separated for search_paths
        value: String,
    },
}

/// Convert a command-line value to the JSON type stored for `key`
pub fn parse_config_value(key: &str, value: &str) -> Value {
    match key {
        SEARCH_PATHS => Value::Array(
            value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(Value::from)
                .collect(),
        ),
        TEMPERATURE => value
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(value)),
        _ => Value::from(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_paths() {
        let value = parse_config_value(SEARCH_PATHS, "/notes, /work/docs,");
        assert_eq!(value, serde_json::json!(["/notes", "/work/docs"]));
    }

    #[test]
    fn test_parse_temperature() {
        assert_eq!(parse_config_value(TEMPERATURE, "0.7"), serde_json::json!(0.7));
        // Left as a string so validation reports it
        assert_eq!(parse_config_value(TEMPERATURE, "warm"), serde_json::json!("warm"));
    }

    #[test]
    fn test_parse_plain_value() {
        assert_eq!(parse_config_value("model_name", "gpt-4"), serde_json::json!("gpt-4"));
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::parse_from(["alphageist", "index", "--rebuild", "--config", "/tmp/c.json"]);
        assert!(matches!(cli.command, Commands::Index { rebuild: true }));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
    }
}
