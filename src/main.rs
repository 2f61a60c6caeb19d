#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::run::RunOptions;
use formpilot::errors::FormpilotError;

const EXIT_SUCCESS: i32 = 0;

#[derive(Parser)]
#[command(name = "formpilot")]
#[command(about = "Resilient web form automation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect, answer, fill and submit the form on a page
    Run {
        /// URL of the page holding the form
        url: String,

        /// Browser to use
        #[arg(short, long, default_value = "firefox")]
        browser: String,

        /// WebDriver server URL (defaults per browser)
        #[arg(long)]
        webdriver_url: Option<String>,

        /// Run browser in visible mode (disables headless)
        #[arg(long = "no-headless")]
        no_headless: bool,

        /// Config file (defaults to ~/.formpilot/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Reasoning service base URL
        #[arg(long)]
        service_url: Option<String>,

        /// Append per-attempt records to this JSON lines file
        #[arg(long)]
        records: Option<PathBuf>,

        /// Context forwarded with every question (e.g. a persona)
        #[arg(long)]
        context: Option<String>,

        /// Code to enter in verification tabs
        #[arg(long)]
        verification_code: Option<String>,

        /// Soften text answers so they read like a person wrote them
        #[arg(long)]
        humanize: bool,
    },

    /// Print the questions detected on a page
    Detect {
        /// URL to analyze
        url: String,

        /// Browser to use
        #[arg(short, long, default_value = "firefox")]
        browser: String,

        /// WebDriver server URL (defaults per browser)
        #[arg(long)]
        webdriver_url: Option<String>,

        /// Run browser in visible mode (disables headless)
        #[arg(long = "no-headless")]
        no_headless: bool,
    },

    /// Show the effective configuration
    Config {
        /// Config file (defaults to ~/.formpilot/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the default configuration first
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() {
    let result = run().await;

    match result {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(err) => {
            let formpilot_err: FormpilotError = err.into();

            // Output JSON error to stdout for programmatic consumption
            let error_json = json!({
                "error": true,
                "message": formpilot_err.to_string(),
                "exit_code": formpilot_err.exit_code()
            });
            println!(
                "{}",
                serde_json::to_string(&error_json).unwrap_or_else(|_| "{}".to_string())
            );

            eprintln!("Error: {}", formpilot_err);
            std::process::exit(formpilot_err.exit_code());
        }
    }
}

async fn run() -> Result<()> {
    // Initialize tracing to stderr (so JSON output to stdout remains clean)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "formpilot=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            url,
            browser,
            webdriver_url,
            no_headless,
            config,
            service_url,
            records,
            context,
            verification_code,
            humanize,
        } => {
            commands::run::handle_run(RunOptions {
                url,
                browser,
                webdriver_url,
                no_headless,
                config,
                service_url,
                records,
                context,
                verification_code,
                humanize,
            })
            .await?
        }

        Commands::Detect {
            url,
            browser,
            webdriver_url,
            no_headless,
        } => commands::detect::handle_detect(url, browser, webdriver_url, no_headless).await?,

        Commands::Config { config, init } => commands::config::handle_config(config, init)?,
    }

    Ok(())
}
