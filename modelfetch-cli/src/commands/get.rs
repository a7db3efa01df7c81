//! Get command - download or resume a model repository.
//!
//! Progress is rendered with one `indicatif` bar per in-flight file plus an
//! overall file counter, all driven by the manager's progress snapshots.
//! Ctrl-C pauses rather than cancels: partial files and markers stay on
//! disk, and a later `get` of the same model picks up where this one
//! stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::info;

use modelfetch::config::format_size;
use modelfetch::download::{DownloadManager, HttpFileSource};
use modelfetch::hub::HubClient;
use modelfetch::{DownloadConfig, RepoProgress, SessionStatus};

use crate::error::CliError;

pub async fn run(
    config: DownloadConfig,
    model: &str,
    token: Option<String>,
) -> Result<(), CliError> {
    let mut hub = HubClient::new()?;
    if let Some(token) = token {
        hub = hub.with_token(token);
    }

    println!("Listing {}...", style(model).cyan());
    let files = hub.list_files(model).await?;
    if files.is_empty() {
        return Err(CliError::Config(format!(
            "repository '{model}' contains no files"
        )));
    }

    let mut source = HttpFileSource::new()?;
    if let Some(token) = hub.token() {
        source = source.with_bearer_token(token);
    }
    let manager = DownloadManager::new(Arc::new(source), config);
    let session_dir = manager.session_dir(model);
    let targets = hub.targets(model, &files, &session_dir);

    let total: u64 = files.iter().filter_map(|f| f.size).sum();
    println!(
        "{} files, {} -> {}",
        targets.len(),
        format_size(total),
        session_dir.display()
    );

    manager.start(model, targets)?;
    info!(model, "download session started");

    let Some(mut progress) = manager.watch(model) else {
        // The session finished before we could attach; fall through to the
        // final status check.
        return finish(&manager, model).await;
    };

    let bars = MultiProgress::new();
    let overall = bars.add(ProgressBar::new(files.len() as u64));
    overall.set_style(
        ProgressStyle::with_template("{prefix:<12} {pos}/{len} files [{bar:30}]")
            .map_err(|e| CliError::Config(e.to_string()))?
            .progress_chars("=> "),
    );
    overall.set_prefix("overall");

    let file_style = ProgressStyle::with_template(
        "{msg:<32} {bytes:>10}/{total_bytes:<10} {bytes_per_sec:>12} [{bar:30}]",
    )
    .map_err(|e| CliError::Config(e.to_string()))?
    .progress_chars("=> ");

    let mut file_bars: HashMap<String, ProgressBar> = HashMap::new();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    manager.pause(model);
                    // Give in-flight transfers a moment to flush their
                    // buffers so the resume point is as far along as it
                    // can be.
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    for bar in file_bars.values() {
                        bar.abandon();
                    }
                    overall.abandon();
                    println!();
                    println!(
                        "{} run `modelfetch get {model}` to resume",
                        style("paused.").yellow()
                    );
                    return Ok(());
                }
            }
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = progress.borrow().clone();
                render(&bars, &overall, &file_style, &mut file_bars, &snapshot);
                if snapshot.completed {
                    break;
                }
            }
        }
    }

    for bar in file_bars.values() {
        bar.finish_and_clear();
    }
    overall.finish_and_clear();

    finish(&manager, model).await
}

fn render(
    bars: &MultiProgress,
    overall: &ProgressBar,
    file_style: &ProgressStyle,
    file_bars: &mut HashMap<String, ProgressBar>,
    snapshot: &RepoProgress,
) {
    overall.set_position(snapshot.completed_files.len() as u64);

    for file in &snapshot.active {
        let bar = file_bars.entry(file.name.clone()).or_insert_with(|| {
            let bar = bars.insert_before(overall, ProgressBar::new(0));
            bar.set_style(file_style.clone());
            bar.set_message(file.name.clone());
            bar
        });
        if let Some(total) = file.total_bytes {
            bar.set_length(total);
        }
        bar.set_position(file.bytes_downloaded);
    }

    // Files that finished since the last snapshot.
    for name in &snapshot.completed_files {
        if let Some(bar) = file_bars.remove(name) {
            bar.finish_and_clear();
        }
    }
}

/// Settle on a terminal status once the progress channel closes.
async fn finish(manager: &DownloadManager, model: &str) -> Result<(), CliError> {
    // The session deregisters itself just after the last snapshot; give it
    // a moment to settle.
    let mut status = manager.status(model);
    for _ in 0..50 {
        if status != SessionStatus::Downloading {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = manager.status(model);
    }

    match status {
        SessionStatus::Completed => {
            println!("{} {}", style("done:").green().bold(), model);
            Ok(())
        }
        SessionStatus::Failed => {
            let reason = manager
                .last_error(model)
                .unwrap_or_else(|| "unknown error".to_string());
            Err(CliError::Session(reason))
        }
        other => Err(CliError::Session(format!(
            "download ended in unexpected state: {}",
            super::status_label(other)
        ))),
    }
}
