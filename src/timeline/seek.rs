//! Serialized time-shift requests
//!
//! Normalized seeks are queued to one dedicated worker thread and applied
//! strictly in submission order. A new request never cancels one in flight;
//! it simply runs after it.

use log::{debug, error, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

use super::store::TimelineStore;
use crate::error::{Error, Result};

/// Result of one applied normalized seek
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekOutcome {
    /// Submission order, starting at zero
    pub sequence: u64,
    pub ratio: f64,
    pub previous: i64,
    pub time_shift: i64,
    /// Channels re-pushed downstream because playback was paused
    pub pushed: usize,
}

enum SeekRequest {
    Normalized { sequence: u64, ratio: f64 },
    Flush(oneshot::Sender<()>),
}

struct Submitter {
    tx: Option<mpsc::UnboundedSender<SeekRequest>>,
    next_sequence: u64,
}

pub struct SeekController {
    store: Arc<TimelineStore>,
    submitter: Mutex<Submitter>,
    worker: Option<JoinHandle<()>>,
}

impl SeekController {
    pub fn new(store: Arc<TimelineStore>) -> Result<Self> {
        Self::spawn(store, None)
    }

    /// Like [`new`](Self::new), reporting every applied seek to `listener`.
    pub fn with_listener(
        store: Arc<TimelineStore>,
        listener: mpsc::UnboundedSender<SeekOutcome>,
    ) -> Result<Self> {
        Self::spawn(store, Some(listener))
    }

    fn spawn(
        store: Arc<TimelineStore>,
        listener: Option<mpsc::UnboundedSender<SeekOutcome>>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker_store = Arc::clone(&store);
        let worker = std::thread::Builder::new()
            .name("volcast-seek".into())
            .spawn(move || run_worker(worker_store, rx, listener))?;

        Ok(Self {
            store,
            submitter: Mutex::new(Submitter {
                tx: Some(tx),
                next_sequence: 0,
            }),
            worker: Some(worker),
        })
    }

    fn submitter(&self) -> MutexGuard<'_, Submitter> {
        self.submitter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<TimelineStore> {
        &self.store
    }

    /// Set the time shift synchronously, bypassing the queue.
    pub fn set_time_shift(&self, offset: i64) {
        self.store.set_time_shift(offset);
    }

    pub fn time_shift(&self) -> i64 {
        self.store.time_shift()
    }

    /// Queue a seek to `ratio` (clamped to `[-1, 1]`); returns its sequence number.
    pub fn set_time_shift_normalized(&self, ratio: f64) -> Result<u64> {
        if !ratio.is_finite() {
            return Err(Error::InvalidState("seek ratio must be finite"));
        }

        let mut submitter = self.submitter();
        let sequence = submitter.next_sequence;
        let tx = submitter
            .tx
            .as_ref()
            .ok_or(Error::InvalidState("seek controller shut down"))?;
        tx.send(SeekRequest::Normalized { sequence, ratio })
            .map_err(|_| Error::InvalidState("seek worker gone"))?;
        submitter.next_sequence += 1;
        Ok(sequence)
    }

    /// Block until every request submitted so far has been applied.
    ///
    /// Must not be called from within an async context.
    pub fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let submitter = self.submitter();
            let tx = submitter
                .tx
                .as_ref()
                .ok_or(Error::InvalidState("seek controller shut down"))?;
            tx.send(SeekRequest::Flush(done_tx))
                .map_err(|_| Error::InvalidState("seek worker gone"))?;
        }
        done_rx
            .blocking_recv()
            .map_err(|_| Error::InvalidState("seek worker gone"))
    }

    /// Stop accepting requests, let the worker drain the queue and join it.
    pub fn shutdown(&mut self) {
        self.submitter().tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("SeekController: worker panicked");
            }
            info!("SeekController: worker stopped");
        }
    }
}

impl Drop for SeekController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    store: Arc<TimelineStore>,
    mut rx: mpsc::UnboundedReceiver<SeekRequest>,
    listener: Option<mpsc::UnboundedSender<SeekOutcome>>,
) {
    debug!("SeekController: worker started");
    while let Some(request) = rx.blocking_recv() {
        match request {
            SeekRequest::Normalized { sequence, ratio } => {
                let outcome = SeekOutcome {
                    sequence,
                    ..store.apply_normalized_shift(ratio)
                };
                debug!(
                    "SeekController: request {} applied, time shift {} -> {}",
                    sequence, outcome.previous, outcome.time_shift
                );
                if let Some(listener) = &listener {
                    let _ = listener.send(outcome);
                }
            }
            SeekRequest::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
