//! Status command - report the state of one download.

use std::sync::Arc;

use console::style;

use modelfetch::config::format_size;
use modelfetch::download::{DownloadManager, HttpFileSource};
use modelfetch::{DownloadConfig, SessionStatus};

use crate::error::CliError;

pub fn run(config: DownloadConfig, model: &str) -> Result<(), CliError> {
    let manager = DownloadManager::new(Arc::new(HttpFileSource::new()?), config);

    let status = manager.status(model);
    println!("{}: {}", style(model).cyan(), super::status_label(status));

    if status == SessionStatus::NotFound {
        return Ok(());
    }

    if let Some(progress) = manager.progress(model) {
        println!("  {}", super::progress_summary(&progress));
        for file in &progress.active {
            match file.total_bytes {
                Some(total) => println!(
                    "  {:<40} {} / {}",
                    file.name,
                    format_size(file.bytes_downloaded),
                    format_size(total)
                ),
                None => println!(
                    "  {:<40} {}",
                    file.name,
                    format_size(file.bytes_downloaded)
                ),
            }
        }
    }

    if let Some(reason) = manager.last_error(model) {
        println!("  {} {}", style("error:").red(), reason);
    }

    Ok(())
}
