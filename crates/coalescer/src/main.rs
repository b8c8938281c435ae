//! Coalescer.
//!
//! Runs batches of slow jobs through a [`CoalescingCache`](coalescer_cache::CoalescingCache) and
//! reports how many computations were actually needed. Identical jobs submitted at the same time
//! share one computation, and jobs submitted again within the TTL are served from the cache.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod logging;
mod workload;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
