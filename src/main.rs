use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::debug;

use idxd_archive::{Extractor, ExtractorConfig, ExtractorEvent};

/// List or extract an archive through the concurrent extraction pipeline.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Only print the member names
    #[arg(short, long)]
    list: bool,

    /// Maximum extraction threads for non-solid archives
    #[arg(short, long)]
    workers: Option<usize>,

    /// Password for encrypted archives
    #[arg(short, long)]
    password: Option<String>,

    archive: PathBuf,

    /// Output directory (defaults to a per-archive cache directory)
    destination: Option<PathBuf>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idxd_archive=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ExtractorConfig::from_env();
    if let Some(workers) = cli.workers {
        config.max_extract_workers = workers;
    }
    config.password = cli.password;

    let destination = match cli.destination {
        Some(dir) => dir,
        None => ExtractorConfig::scratch_dir_for(&cli.archive)?,
    };

    let extractor = Extractor::builder().config(config).build();
    let events = extractor.subscribe();
    let handle = extractor
        .setup(&cli.archive, &destination)
        .with_context(|| format!("Failed to open {}", cli.archive.display()))?;

    let Some(contents) = handle.wait_for_listing(Duration::MAX) else {
        bail!("Failed to list {}", cli.archive.display());
    };

    if cli.list {
        for name in &contents {
            println!("{name}");
        }
        return Ok(());
    }

    debug!(files = contents.len(), destination = ?handle.destination(), "Extracting everything");
    extractor.select(contents.iter().cloned());
    extractor.begin_extraction();

    loop {
        // A failed bulk pass leaves members pending with no job left to run.
        let finished = !extractor.is_extracting() || handle.wait_until_idle(Duration::ZERO);
        let timeout = if finished { Duration::ZERO } else { POLL_INTERVAL };
        while let Ok(event) = events.recv_timeout(timeout) {
            if let ExtractorEvent::FileReady {
                destination_name, ..
            } = event
            {
                println!("{}", handle.destination().join(destination_name).display());
            }
        }
        if finished {
            break;
        }
    }

    let failed: Vec<&String> = contents.iter().filter(|n| !handle.is_ready(n)).collect();
    extractor.close();
    if !failed.is_empty() {
        bail!("{} of {} members could not be extracted", failed.len(), contents.len());
    }
    Ok(())
}
