use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use coalescer_cache::config::CacheConfig;
use coalescer_cache::{CacheError, CoalescingCache};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::cli::OutputFormat;

/// Why a job could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("fibonacci({0}) does not fit into 64 bits")]
    Overflow(u64),
}

/// The batches of jobs submitted to the cache.
#[derive(Debug, Clone)]
pub struct Workload {
    pub jobs: Vec<u64>,
    pub rounds: usize,
    pub delay: Duration,
    pub format: OutputFormat,
}

/// The outcome of a single request.
#[derive(Debug, Serialize)]
pub struct Report {
    pub round: usize,
    pub job: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Totals over the whole workload.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Summary {
    pub requests: usize,
    pub computations: usize,
    pub failures: usize,
    pub cached: usize,
}

/// Computes the `n`th Fibonacci number, failing once it overflows.
pub fn fibonacci(n: u64) -> Result<u64, JobError> {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.checked_add(b).ok_or(JobError::Overflow(n))?;
        a = b;
        b = next;
    }
    Ok(a)
}

/// Submits all jobs of every round concurrently and prints one report per request.
pub async fn run(config: &CacheConfig, workload: Workload) -> Result<Summary> {
    let computations = Arc::new(AtomicUsize::new(0));
    let delay = workload.delay;
    let cache = CoalescingCache::from_config(config, {
        let computations = Arc::clone(&computations);
        move |n: u64| {
            computations.fetch_add(1, Ordering::Relaxed);
            async move {
                tokio::time::sleep(delay).await;
                fibonacci(n)
            }
        }
    });

    let mut failures = 0;
    for round in 1..=workload.rounds {
        tracing::info!(round, jobs = workload.jobs.len(), "submitting jobs");

        let tasks: Vec<_> = workload
            .jobs
            .iter()
            .map(|&job| {
                let cache = cache.clone();
                let ttl = config.ttl;
                tokio::spawn(async move {
                    let start = Instant::now();
                    let result = cache.get_or_compute(job, ttl).await;
                    (job, result, start.elapsed())
                })
            })
            .collect();

        for task in tasks {
            let (job, result, elapsed) = task.await.context("job panicked")?;
            let (value, error) = match result {
                Ok(value) => (Some(value), None),
                Err(error) => {
                    failures += 1;
                    if !matches!(error, CacheError::Compute(_)) {
                        tracing::warn!(job, error = %error, "request did not complete");
                    }
                    (None, Some(error.to_string()))
                }
            };
            let report = Report {
                round,
                job,
                value,
                error,
                elapsed_ms: elapsed.as_millis() as u64,
            };
            print_report(&report, workload.format)?;
        }
    }

    let summary = Summary {
        requests: workload.jobs.len() * workload.rounds,
        computations: computations.load(Ordering::Relaxed),
        failures,
        cached: cache.size(),
    };
    print_summary(&summary, workload.format)?;
    Ok(summary)
}

fn print_report(report: &Report, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(report)?),
        OutputFormat::Pretty => {
            let outcome = match (&report.value, &report.error) {
                (Some(value), _) => value.to_string(),
                (None, Some(error)) => format!("error: {error}"),
                (None, None) => "-".to_owned(),
            };
            println!(
                "round {:>2}  fib({:>3}) = {:<24} {:>6}ms",
                report.round, report.job, outcome, report.elapsed_ms
            );
        }
    }
    Ok(())
}

fn print_summary(summary: &Summary, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(summary)?),
        OutputFormat::Pretty => println!(
            "{} requests, {} computations, {} failed, {} results cached",
            summary.requests, summary.computations, summary.failures, summary.cached
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fibonacci() {
        assert_eq!(fibonacci(0), Ok(0));
        assert_eq!(fibonacci(1), Ok(1));
        assert_eq!(fibonacci(8), Ok(21));
        assert_eq!(fibonacci(93), Ok(12_200_160_415_121_876_738));
        assert_eq!(fibonacci(94), Err(JobError::Overflow(94)));
    }

    fn workload(jobs: &[u64], rounds: usize) -> Workload {
        Workload {
            jobs: jobs.to_vec(),
            rounds,
            delay: Duration::from_millis(100),
            format: OutputFormat::Json,
        }
    }

    #[tokio::test]
    async fn test_duplicates_are_coalesced() {
        tokio::time::pause();
        let config = CacheConfig::default();

        let summary = run(&config, workload(&[3, 4, 5, 5, 4, 8, 8, 8], 1))
            .await
            .unwrap();

        assert_eq!(
            summary,
            Summary {
                requests: 8,
                computations: 4,
                failures: 0,
                cached: 4,
            }
        );
    }

    #[tokio::test]
    async fn test_later_rounds_are_cached() {
        tokio::time::pause();
        let config = CacheConfig::default();

        let summary = run(&config, workload(&[35, 94, 94], 3)).await.unwrap();

        // the overflow is memoized like any other result
        assert_eq!(summary.requests, 9);
        assert_eq!(summary.computations, 2);
        assert_eq!(summary.failures, 6);
        assert_eq!(summary.cached, 2);
    }
}
