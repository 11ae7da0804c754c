use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::foundation::error::{ExportError, ExportResult};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::exporter::{ExportOutcome, Exporter};
use crate::pipeline::job::ExportJob;

/// What a session does when an export is requested while another one is running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Refuse the new request with a validation error.
    #[default]
    RejectWhileActive,
    /// Cancel the running export, wait for it to stop, then start the new one.
    CancelPrevious,
}

#[derive(Default)]
struct Done {
    finished: Mutex<bool>,
    signal: Condvar,
}

impl Done {
    fn set(&self) {
        *self.finished.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.signal.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.finished.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait(&self) {
        let guard = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        let _guard = self
            .signal
            .wait_while(guard, |finished| !*finished)
            .unwrap_or_else(|e| e.into_inner());
    }
}

/// Marks the job done even if the export thread unwinds.
struct DoneGuard(Arc<Done>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

struct ActiveJob {
    cancel: CancellationToken,
    done: Arc<Done>,
}

/// Owner of at most one running export.
pub struct EditingSession {
    exporter: Exporter,
    policy: SessionPolicy,
    active: Mutex<Option<ActiveJob>>,
}

impl EditingSession {
    pub fn new(exporter: Exporter, policy: SessionPolicy) -> Self {
        Self {
            exporter,
            policy,
            active: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn is_busy(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|job| !job.done.is_set())
    }

    /// Start `job` on a background thread.
    pub fn start_export(&self, job: ExportJob) -> ExportResult<ExportHandle> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = active.as_ref()
            && !prev.done.is_set()
        {
            match self.policy {
                SessionPolicy::RejectWhileActive => {
                    return Err(ExportError::validation(
                        "an export is already running in this session",
                    ));
                }
                SessionPolicy::CancelPrevious => {
                    tracing::debug!("cancelling previous export");
                    prev.cancel.cancel();
                    prev.done.wait();
                }
            }
        }

        job.validate()?;
        let cancel = CancellationToken::new();
        let done = Arc::new(Done::default());
        let (tx, rx) = std::sync::mpsc::channel();
        let exporter = self.exporter.clone();
        let worker_cancel = cancel.clone();
        let guard = DoneGuard(done.clone());
        let thread = std::thread::Builder::new()
            .name("burnin-export".to_string())
            .spawn(move || {
                let _guard = guard;
                let outcome = exporter.run(&job, &worker_cancel);
                let _ = tx.send(outcome);
            })
            .map_err(|e| ExportError::write(format!("failed to spawn export thread: {e}")))?;

        *active = Some(ActiveJob {
            cancel: cancel.clone(),
            done,
        });
        Ok(ExportHandle {
            cancel,
            rx,
            thread: Some(thread),
            outcome: None,
        })
    }
}

/// Caller's end of a running export.
pub struct ExportHandle {
    cancel: CancellationToken,
    rx: Receiver<ExportOutcome>,
    thread: Option<JoinHandle<()>>,
    outcome: Option<ExportOutcome>,
}

impl ExportHandle {
    /// Request cancellation; takes effect at the next frame boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// The outcome, if the export has already ended.
    pub fn try_outcome(&mut self) -> Option<&ExportOutcome> {
        if self.outcome.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => self.outcome = Some(lost_outcome()),
            }
        }
        self.outcome.as_ref()
    }

    /// Block until the export ends.
    pub fn wait(mut self) -> ExportOutcome {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => self.rx.recv().unwrap_or_else(|_| lost_outcome()),
        };
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        outcome
    }
}

fn lost_outcome() -> ExportOutcome {
    ExportOutcome::Failed(ExportError::Other(anyhow::anyhow!(
        "export thread ended without reporting an outcome"
    )))
}
