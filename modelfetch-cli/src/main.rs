//! ModelFetch CLI - download and manage local model artifacts.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;

use modelfetch::DownloadConfig;

#[derive(Debug, Parser)]
#[command(name = "modelfetch", version, about = "Resumable model downloads for local LLM runtimes")]
struct Cli {
    /// Directory models are downloaded into
    #[arg(long, global = true, value_name = "DIR")]
    models_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download a model repository (resumes automatically if interrupted)
    Get {
        /// Model repository id, e.g. Qwen/Qwen3-4B-GGUF
        model: String,
        /// Hub access token (defaults to HF_TOKEN or the hub CLI token file)
        #[arg(long)]
        token: Option<String>,
        /// Concurrent file transfers
        #[arg(long, short = 'j', default_value_t = 4)]
        concurrency: usize,
        /// Skip SHA-256 verification of completed files
        #[arg(long)]
        no_verify: bool,
    },
    /// Resume an interrupted download (same as `get`)
    Resume {
        /// Model repository id
        model: String,
        /// Hub access token
        #[arg(long)]
        token: Option<String>,
        /// Concurrent file transfers
        #[arg(long, short = 'j', default_value_t = 4)]
        concurrency: usize,
        /// Skip SHA-256 verification of completed files
        #[arg(long)]
        no_verify: bool,
    },
    /// Show the status of a download
    Status {
        /// Model repository id
        model: String,
    },
    /// List known downloads, active and resumable
    List,
    /// Cancel a download and discard its resume state
    Cancel {
        /// Model repository id
        model: String,
    },
}

fn build_config(cli: &Cli) -> DownloadConfig {
    match &cli.models_dir {
        Some(dir) => DownloadConfig::new(dir.clone()),
        None => DownloadConfig::default(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    modelfetch::telemetry::init();

    let cli = Cli::parse();
    let config = build_config(&cli);

    let result = match cli.command {
        Commands::Get {
            ref model,
            ref token,
            concurrency,
            no_verify,
        }
        | Commands::Resume {
            ref model,
            ref token,
            concurrency,
            no_verify,
        } => {
            let config = config
                .with_file_concurrency(concurrency)
                .with_verify_checksums(!no_verify);
            commands::get::run(config, model, token.clone()).await
        }
        Commands::Status { ref model } => commands::status::run(config, model),
        Commands::List => commands::list::run(config),
        Commands::Cancel { ref model } => commands::cancel::run(config, model),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
