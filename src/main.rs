mod aggregate;
mod cli;
mod config;
mod connector;
mod connector_content;
mod connector_ga4;
mod connector_gsc;
mod connector_psi;
mod daemon;
mod db;
mod error;
mod exclusion;
mod google_auth;
mod insights;
mod logging;
mod mailer;
mod models;
mod oracle;
mod period;
mod pipeline;
mod report;
mod scheduler;
mod sitemap;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Cli, Commands, ExclusionCommands};
use crate::config::{Config, load_config, validate_config};
use crate::connector::ConnectorRegistry;
use crate::mailer::Mailer;
use crate::oracle::GeminiOracle;
use crate::period::today_in;
use crate::pipeline::PipelineContext;
use crate::report::ReportHeader;
use crate::scheduler::Delivery;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    let _log_guard = logging::init(&config, cli.debug)?;
    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    let config = Arc::new(config);

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Validate => {
            println!("Configuration is valid.");
        }
        Commands::Run { force } => {
            let ctx = build_context(config.clone()).await?;
            let delivery = delivery(&config, cli.output);

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing URLs in progress");
                    ctrl_c_cancel.cancel();
                }
            });

            match scheduler::run_once(&ctx, &delivery, force, cancel).await? {
                Some(result) => println!(
                    "Processed {}: {} stored, {} skipped, {} failed, {} newly excluded, {} insights reported.",
                    result.current.label(),
                    result.stored(),
                    result.skipped(),
                    result.failed(),
                    result.newly_excluded.len(),
                    result.report.insight_count()
                ),
                None => println!("Latest period already processed. Use --force to run anyway."),
            }
            ctx.pool.close().await;
        }
        Commands::Daemon => {
            let ctx = build_context(config.clone()).await?;
            let delivery = delivery(&config, cli.output);
            daemon::run(ctx, delivery).await?;
        }
        Commands::TestUrl { url } => {
            let ctx = build_context(config.clone()).await?;
            let today = today_in(config.timezone()?, Utc::now());
            let insights = pipeline::test_url(&ctx, &url, today).await?;

            let json = serde_json::to_string_pretty(&insights).context("serializing insights")?;
            match cli.output {
                Some(path) => {
                    tokio::fs::write(&path, &json)
                        .await
                        .with_context(|| format!("writing insights to {}", path.display()))?;
                    println!("Insights written to: {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::TestUrls { urls } => {
            let urls = if urls.is_empty() { config.urls.test.clone() } else { urls };
            if urls.is_empty() {
                anyhow::bail!("no URLs given and urls.test is empty");
            }

            let ctx = build_context(config.clone()).await?;
            let today = today_in(config.timezone()?, Utc::now());
            let report = pipeline::test_urls(&ctx, &urls, today).await;

            let period = config.periods().current(today);
            let header = ReportHeader {
                title: &config.report.subject,
                period: &period,
            };
            match cli.output {
                Some(path) => {
                    report::write_report(&path, &header, &report).await?;
                    println!("Report written to: {}", path.display());
                }
                None => println!("{}", report::render_markdown(&header, &report)),
            }
        }
        Commands::TestEmail => {
            let mailer = Mailer::new(config.require_email()?.clone());
            let subject = format!("{} (test)", config.report.subject);
            mailer
                .send(&subject, "<p>This is a test message from seo-insights.</p>")
                .await
                .context("sending test email")?;
            println!("Test email sent.");
        }
        Commands::Exclusions { command } => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            match command {
                ExclusionCommands::List => {
                    let records = store::list_exclusions(&pool).await?;
                    if records.is_empty() {
                        println!("No excluded URLs.");
                    }
                    for record in records {
                        println!("{}\t{}\t{}", record.excluded_on, record.reason, record.url);
                    }
                }
                ExclusionCommands::Remove { url } => {
                    if store::remove_exclusion(&pool, &url).await? {
                        println!("Removed exclusion for {url}");
                    } else {
                        println!("{url} was not excluded");
                    }
                }
            }
            pool.close().await;
        }
    }

    Ok(())
}

/// Open the store, build and authenticate connectors, and set up the oracle.
async fn build_context(config: Arc<Config>) -> Result<PipelineContext> {
    let gemini = config.require_gemini()?;
    let oracle = GeminiOracle::from_config(gemini).context("setting up Gemini client")?;

    let pool = db::create_pool(&config).await.context("creating database")?;
    info!(db_path = %config.db_path().display(), "database ready");

    let connectors = ConnectorRegistry::from_config(&config)?;
    connectors.authenticate_all().await?;
    info!(connectors = ?connectors.names(), "connectors ready");

    Ok(PipelineContext {
        pool,
        config,
        connectors: Arc::new(connectors),
        oracle: Arc::new(oracle),
    })
}

fn delivery(config: &Config, output: Option<PathBuf>) -> Delivery {
    Delivery {
        mailer: config.email.clone().map(|email| Arc::new(Mailer::new(email))),
        output,
    }
}
