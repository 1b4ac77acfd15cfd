use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "seo-insights",
    about = "Compare SEO signals across reporting periods and email ranked insights"
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    /// Force debug-level logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Also write the report to this file (.json, .html, otherwise Markdown)
    #[arg(long, short, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Process the latest period if it has not been processed yet, then send the report
    Run {
        /// Run even if the current period was already processed
        #[arg(long)]
        force: bool,
    },

    /// Check the schedule periodically until interrupted (default)
    Daemon,

    /// Compare live current and prior data for one URL without storing anything
    TestUrl {
        url: String,
    },

    /// Like test-url for several URLs, aggregated into one report
    TestUrls {
        /// URLs to test; defaults to urls.test from the config
        urls: Vec<String>,
    },

    /// Send a short test message with the configured SMTP settings
    TestEmail,

    /// Inspect or edit the exclusion list
    Exclusions {
        #[command(subcommand)]
        command: ExclusionCommands,
    },
}

#[derive(Subcommand)]
pub enum ExclusionCommands {
    /// List excluded URLs
    List,
    /// Re-include a URL
    Remove { url: String },
}
