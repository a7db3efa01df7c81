//! List command - show every known download.

use std::sync::Arc;

use modelfetch::download::{DownloadManager, HttpFileSource};
use modelfetch::DownloadConfig;

use crate::error::CliError;

pub fn run(config: DownloadConfig) -> Result<(), CliError> {
    let manager = DownloadManager::new(Arc::new(HttpFileSource::new()?), config);

    let infos = manager.list();
    if infos.is_empty() {
        println!("No downloads found.");
        return Ok(());
    }

    for info in infos {
        let summary = info
            .progress
            .as_ref()
            .map(super::progress_summary)
            .unwrap_or_default();
        println!(
            "{:<45} {:<12} {}",
            info.key,
            super::status_label(info.status),
            summary
        );
    }
    Ok(())
}
