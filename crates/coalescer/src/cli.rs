//! Exposes the command line application.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use coalescer_cache::config::Config;

use crate::logging;
use crate::workload::{self, Workload};

/// The format in which results are printed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One line per request, followed by a summary.
    #[default]
    Pretty,
    /// One JSON object per request, followed by the summary object.
    Json,
}

/// Computes Fibonacci numbers the slow way, coalescing duplicate requests.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The Fibonacci numbers to compute.
    ///
    /// All numbers of a round are requested concurrently. Duplicates within a round share a
    /// single computation.
    #[arg(default_values_t = [35u64, 40, 44, 40, 45, 94, 94])]
    jobs: Vec<u64>,

    /// How long every single computation takes.
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    delay: Duration,

    /// How often the whole batch of jobs is submitted.
    #[arg(long, default_value_t = 2)]
    rounds: usize,

    /// Overrides the TTL from the configuration file. `0s` keeps results forever.
    #[arg(long, value_parser = humantime::parse_duration)]
    ttl: Option<Duration>,

    /// The output format.
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    if let Some(ttl) = cli.ttl {
        config.cache.ttl = Some(ttl);
    }

    let dsn = config
        .sentry_dsn
        .as_deref()
        .map(str::parse::<sentry::types::Dsn>)
        .transpose()
        .context("invalid sentry DSN")?;
    let _sentry = sentry::init(sentry::ClientOptions {
        dsn,
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: Nothing else is running yet, the runtime is only built below.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone()
            && let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok())
        {
            tags.insert(tag, name);
        }
        configure_metrics(&config.metrics.prefix, statsd, tags)?;
    }

    let workload = Workload {
        jobs: cli.jobs,
        rounds: cli.rounds,
        delay: cli.delay,
        format: cli.format,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("coalescer-worker")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    runtime.block_on(workload::run(&config.cache, workload))?;
    Ok(())
}

fn configure_metrics(prefix: &str, statsd: &str, tags: BTreeMap<String, String>) -> Result<()> {
    coalescer_cache::metrics::configure_statsd(prefix, statsd, tags)
        .with_context(|| format!("failed to report metrics to {statsd}"))
}
