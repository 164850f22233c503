//! Serialized executor for handler callbacks.
//!
//! When a connection routes callbacks through the default executor, every
//! `deliver`/`fail` runs on one dedicated task in submission order, so a slow
//! handler cannot stall frame demultiplexing while per-session ordering is
//! preserved.

use tokio::sync::mpsc;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub(crate) struct Executor {
    tx: mpsc::UnboundedSender<Job>,
}

impl Executor {
    /// Spawn the drain task. Must be called inside a tokio runtime.
    pub(crate) fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { tx }
    }

    /// Queue a job; hands it back if the drain task is gone.
    pub(crate) fn post(&self, job: Job) -> Result<(), Job> {
        self.tx.send(job).map_err(|err| err.0)
    }
}
