//! Byte counting for the extraction stream and the periodic progress log.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

/// Shared, monotonically increasing byte counter.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter(Arc<AtomicU64>);

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Pass-through reader that adds every transferred byte to a [`ProgressCounter`].
///
/// Does no buffering of its own; EOF and errors from the inner reader are
/// returned unchanged.
pub struct MeteredReader<R> {
    inner: R,
    counter: ProgressCounter,
}

impl<R: Read> MeteredReader<R> {
    pub fn new(inner: R, counter: ProgressCounter) -> Self {
        Self { inner, counter }
    }

    pub fn counter(&self) -> &ProgressCounter {
        &self.counter
    }
}

impl<R: Read> Read for MeteredReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.add(n as u64);
        Ok(n)
    }
}

/// Background thread logging the counter at a fixed interval.
///
/// The thread stops when [`ProgressReporter::stop`] is called or the reporter
/// is dropped, so an early return from the pipeline cannot leave it running.
pub struct ProgressReporter {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(counter: ProgressCounter, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        // Log through whatever subscriber the caller is using.
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());
        let spawned = thread::Builder::new()
            .name("unpack-progress".into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            info!(bytes = counter.get(), "unpacking to disk");
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
            });

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                // Progress lines are informational; unpack without them.
                warn!(error = %err, "failed to start progress reporter");
                None
            }
        };

        Self {
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel and wakes the thread.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
