//! Per-connection test session state.
//!
//! The session is the single arbiter of a run's lifecycle. Whoever flips
//! `running` from true to false (the stop handler, a superseding start, or
//! the driver loop on timeout) gets a [`Completion`] back and is the one
//! that reports `final`. The `*_and` variants run a callback while the
//! lock is still held, which is how the caller queues its message so that
//! no `speed` can be queued after the run's `final`.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Monotonic identifier of a run within one session.
pub type RunId = u64;

/// What a driver loop captures when its run starts.
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub run_id: RunId,
    pub cancel: CancellationToken,
}

/// Result of ending a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Completion {
    pub run_id: RunId,
    pub samples: usize,
    pub average: f64,
}

/// Point-in-time copy of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub running: bool,
    pub run_id: RunId,
    pub samples: Vec<f64>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SessionInner {
    running: bool,
    run_id: RunId,
    samples: Vec<f64>,
    started_at: Option<DateTime<Utc>>,
    cancel: Option<CancellationToken>,
}

impl SessionInner {
    /// Flip running to false and cancel the run. `None` if already idle.
    fn end_run(&mut self) -> Option<Completion> {
        if !self.running {
            return None;
        }
        self.running = false;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        Some(Completion {
            run_id: self.run_id,
            samples: self.samples.len(),
            average: mean(&self.samples),
        })
    }

    fn is_current(&self, ticket: &RunTicket) -> bool {
        self.running && self.run_id == ticket.run_id && !ticket.cancel.is_cancelled()
    }
}

/// State of one connection's throughput test.
#[derive(Debug, Default)]
pub struct Session {
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new run: clear samples, stamp the start time and hand out a
    /// fresh cancellation token.
    pub async fn start(&self) -> RunTicket {
        self.start_and(|_| {}).await
    }

    /// Like [`Session::start`]. If a run was still active it is ended
    /// first and `on_superseded` receives its completion under the lock.
    pub async fn start_and<F>(&self, on_superseded: F) -> RunTicket
    where
        F: FnOnce(&Completion),
    {
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.end_run() {
            debug!(run_id = previous.run_id, "run superseded by new start");
            on_superseded(&previous);
        }

        let cancel = CancellationToken::new();
        inner.running = true;
        inner.run_id += 1;
        inner.samples.clear();
        inner.started_at = Some(Utc::now());
        inner.cancel = Some(cancel.clone());

        RunTicket {
            run_id: inner.run_id,
            cancel,
        }
    }

    /// End the current run. Idempotent: returns `None` and changes nothing
    /// when no run is active.
    pub async fn stop(&self) -> Option<Completion> {
        self.stop_and(|_| {}).await
    }

    /// Like [`Session::stop`], running `on_stopped` under the lock when
    /// this call is the one that ended the run.
    pub async fn stop_and<F>(&self, on_stopped: F) -> Option<Completion>
    where
        F: FnOnce(&Completion),
    {
        let mut inner = self.inner.lock().await;
        let completion = inner.end_run()?;
        on_stopped(&completion);
        Some(completion)
    }

    /// End the run described by `ticket` when its duration has elapsed.
    ///
    /// Returns `None` when that run was already ended by someone else or
    /// has been superseded; the caller must then report nothing.
    pub async fn finish_and<F>(&self, ticket: &RunTicket, on_finished: F) -> Option<Completion>
    where
        F: FnOnce(&Completion),
    {
        let mut inner = self.inner.lock().await;
        if !inner.is_current(ticket) {
            return None;
        }
        let completion = inner.end_run()?;
        on_finished(&completion);
        Some(completion)
    }

    /// Mark the run described by `ticket` idle without reporting it.
    ///
    /// Used when a run fails: no `final` follows, and a later stop finds
    /// nothing to end.
    pub async fn abort(&self, ticket: &RunTicket) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.is_current(ticket) {
            return false;
        }
        inner.end_run().is_some()
    }

    /// Append a sample if a run is active; otherwise discard it silently.
    pub async fn add_speed(&self, speed: f64) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.running {
            return false;
        }
        inner.samples.push(speed);
        true
    }

    /// Append a sample on behalf of the run described by `ticket`.
    ///
    /// Discards it when that run is no longer the active one. On success
    /// `on_recorded` runs under the lock.
    pub async fn record_and<F>(&self, ticket: &RunTicket, speed: f64, on_recorded: F) -> bool
    where
        F: FnOnce(),
    {
        let mut inner = self.inner.lock().await;
        if !inner.is_current(ticket) {
            return false;
        }
        inner.samples.push(speed);
        on_recorded();
        true
    }

    /// Mean of the collected samples; `0.0` when there are none.
    pub async fn average(&self) -> f64 {
        mean(&self.inner.lock().await.samples)
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.running
    }

    /// Whether `ticket` still names the active run.
    pub async fn is_current(&self, ticket: &RunTicket) -> bool {
        self.inner.lock().await.is_current(ticket)
    }

    pub async fn current_run_id(&self) -> RunId {
        self.inner.lock().await.run_id
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            running: inner.running,
            run_id: inner.run_id,
            samples: inner.samples.clone(),
            started_at: inner.started_at,
        }
    }
}

/// Arithmetic mean, `0.0` for an empty slice.
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
