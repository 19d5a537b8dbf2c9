//! Bounded worker pool with a join barrier.
//!
//! Jobs run on plain threads, at most `max_workers` at a time. Results travel
//! over a channel; the barrier waits until every job of a wave reported or
//! the wave deadline passed. A job that misses the deadline is cancelled and
//! reported as timed out, and the wave still waits for its thread to exit, so
//! no worker outlives the call that spawned it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::ProducerFailure;
use crate::process::CancelToken;

/// A unit of work. It should return promptly once its token is cancelled.
pub type Job<T> = Box<dyn FnOnce(&CancelToken) -> anyhow::Result<T> + Send + 'static>;

/// Run `jobs` and return one result per job, in job order.
pub fn run_bounded<T: Send + 'static>(
    jobs: Vec<Job<T>>,
    max_workers: usize,
    timeout: Duration,
) -> Vec<Result<T, ProducerFailure>> {
    let total = jobs.len();
    let mut results: Vec<Option<Result<T, ProducerFailure>>> = (0..total).map(|_| None).collect();
    let mut jobs = jobs.into_iter().enumerate().peekable();

    while jobs.peek().is_some() {
        let (tx, rx) = mpsc::channel();
        let mut wave = Vec::new();
        for (index, job) in jobs.by_ref().take(max_workers.max(1)) {
            let tx = tx.clone();
            let cancel = CancelToken::new();
            wave.push((index, cancel.clone()));
            thread::spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| job(&cancel))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(ProducerFailure::Errored(format!("{err:#}"))),
                    Err(payload) => Err(ProducerFailure::Panicked(panic_message(payload.as_ref()))),
                };
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);
        debug!(workers = wave.len(), "worker wave started");

        let deadline = Instant::now() + timeout;
        let mut pending = wave.len();
        while pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((index, outcome)) => {
                    results[index] = Some(outcome);
                    pending -= 1;
                }
                Err(_) => break,
            }
        }

        for (index, cancel) in &wave {
            if results[*index].is_none() {
                warn!(
                    job = index,
                    timeout_secs = timeout.as_secs(),
                    "worker timed out, cancelling"
                );
                cancel.cancel();
            }
        }
        // Late results are discarded; the jobs already count as timed out.
        while pending > 0 && rx.recv().is_ok() {
            pending -= 1;
        }

        for (index, _) in wave {
            if results[index].is_none() {
                results[index] = Some(Err(ProducerFailure::TimedOut(timeout.as_secs())));
            }
        }
    }

    results
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(ProducerFailure::TimedOut(timeout.as_secs()))))
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
