mod commands;
mod config;
mod obs;

use clap::{Parser, Subcommand};
use commands::{Command, CrawlOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(about = "Tidemark market-data pipeline CLI", version, arg_required_else_help = true)]
#[command(
    after_help = "Examples:\n  tidemark crawl --config configs/tidemark.toml --symbol SPY\n  tidemark load --config configs/tidemark.toml --mode incremental\n  tidemark verify --config configs/tidemark.toml\n  tidemark run --config configs/tidemark.toml --mode test\n  tidemark init-db --config configs/tidemark.toml\n"
)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Fetch bars from the providers into the CSV and Parquet trees.
    Crawl {
        #[arg(long)]
        config: PathBuf,
        /// Restrict to a single registry symbol.
        #[arg(long)]
        symbol: Option<String>,
        /// Only crawl symbols at or below this priority.
        #[arg(long)]
        priority: Option<i32>,
        /// Cap the number of symbols crawled.
        #[arg(long)]
        limit: Option<usize>,
        /// Override the registry's history depth in years.
        #[arg(long)]
        years: Option<u32>,
        /// full, incremental or test (defaults to the config's mode).
        #[arg(long)]
        mode: Option<String>,
    },
    /// Load CSV partitions into the database with watermark dedupe.
    Load {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Compare row counts and latest timestamps across CSV, Parquet and the database.
    Verify {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Crawl, sink, load and verify in one pass.
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        years: Option<u32>,
        #[arg(long)]
        mode: Option<String>,
    },
    /// Create the wide OHLCV table if it does not exist.
    InitDb {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let command = match cli.command {
        CliCommand::Crawl {
            config,
            symbol,
            priority,
            limit,
            years,
            mode,
        } => Command::Crawl {
            config,
            options: CrawlOptions {
                symbol,
                priority,
                limit,
                years,
                mode,
            },
        },
        CliCommand::Load {
            config,
            mode,
            symbol,
        } => Command::Load {
            config,
            mode,
            symbol,
        },
        CliCommand::Verify { config, symbol } => Command::Verify { config, symbol },
        CliCommand::Run {
            config,
            symbol,
            priority,
            limit,
            years,
            mode,
        } => Command::Run {
            config,
            options: CrawlOptions {
                symbol,
                priority,
                limit,
                years,
                mode,
            },
        },
        CliCommand::InitDb { config } => Command::InitDb { config },
    };

    if let Err(err) = commands::run(command) {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
