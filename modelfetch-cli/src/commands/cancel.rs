//! Cancel command - stop a download and discard its resume state.

use std::sync::Arc;

use console::style;

use modelfetch::download::{DownloadManager, HttpFileSource};
use modelfetch::DownloadConfig;

use crate::error::CliError;

pub fn run(config: DownloadConfig, model: &str) -> Result<(), CliError> {
    let manager = DownloadManager::new(Arc::new(HttpFileSource::new()?), config);

    let was_active = manager.cancel(model);
    if was_active {
        println!("Cancelled active download of {}.", style(model).cyan());
    } else {
        println!("Discarded resume state for {}.", style(model).cyan());
    }
    println!("Partial files remain in {}.", manager.session_dir(model).display());
    Ok(())
}
