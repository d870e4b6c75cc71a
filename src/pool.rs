//! A small fixed-size worker pool for fanning independent tasks out over
//! threads. Workers pull tasks from a shared counter, and once a task fails
//! the others stop picking up new work through a shared flag.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::debug;

use crate::error::{DocShredError, Result};

/// Runs `run` on every task using up to `workers` threads and returns the
/// first error encountered, if any.
pub fn fan_out<T, F>(workers: usize, tasks: &[T], run: F) -> Result<()>
where
    T: Sync,
    F: Fn(&T) -> Result<()> + Sync,
{
    let workers = workers.clamp(1, tasks.len().max(1));
    let next = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<DocShredError>> = Mutex::new(None);
    std::thread::scope(|scope| {
        for worker in 0..workers {
            let (next, failed, first_error, run) = (&next, &failed, &first_error, &run);
            scope.spawn(move || {
                let mut done = 0usize;
                while !failed.load(Ordering::Acquire) {
                    let position = next.fetch_add(1, Ordering::AcqRel);
                    let Some(task) = tasks.get(position) else { break };
                    if let Err(e) = run(task) {
                        failed.store(true, Ordering::Release);
                        if let Ok(mut slot) = first_error.lock() {
                            slot.get_or_insert(e);
                        }
                        break;
                    }
                    done += 1;
                }
                debug!(worker, done, "worker finished");
            });
        }
    });
    match first_error.into_inner()? {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
