//! Test driver: the per-run sampling loop.
//!
//! One driver task runs per active test. It samples until the run's
//! duration elapses or its ticket goes stale (stop, superseding start),
//! pushes a `speed` message per sample and, only when it is the one that
//! ends the run, a single `final`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::TestConfig;
use crate::control::outbox::{Delivery, Outbox};
use crate::control::rpc::ServerMessage;
use crate::session::{Completion, RunId, RunTicket, Session};

use super::{Measure, ThroughputError};

/// Timing knobs for a driver loop.
#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    /// Pacing delay between samples.
    pub sample_interval: Duration,
    /// Upper bound on waiting for a control message to be written.
    pub io_timeout: Duration,
}

impl DriverSettings {
    pub fn from_config(test: &TestConfig) -> Self {
        Self {
            sample_interval: test.sample_interval(),
            io_timeout: test.io_timeout(),
        }
    }
}

/// How a run ended, from the driver's point of view.
#[derive(Debug)]
pub enum RunOutcome {
    /// Duration elapsed and this loop reported `final`.
    Completed(Completion),
    /// An external stop ended the run; the stop handler reports `final`.
    Stopped,
    /// A newer run took over the session.
    Superseded,
    /// Sampling or delivery failed. No `final` is sent for this run.
    Aborted(ThroughputError),
}

/// Handle to a spawned driver loop, joined by the connection handler.
pub struct RunHandle {
    run_id: RunId,
    task: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit. `None` if the task panicked.
    pub async fn join(self) -> Option<RunOutcome> {
        match self.task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(run_id = self.run_id, error = %e, "driver task failed");
                None
            }
        }
    }
}

pub struct TestDriver {
    session: Arc<Session>,
    outbox: Outbox,
    measure: Arc<dyn Measure>,
    settings: DriverSettings,
}

impl TestDriver {
    pub fn new(
        session: Arc<Session>,
        outbox: Outbox,
        measure: Arc<dyn Measure>,
        settings: DriverSettings,
    ) -> Self {
        Self {
            session,
            outbox,
            measure,
            settings,
        }
    }

    /// Launch the loop for `ticket` as its own task.
    pub fn spawn(self, ticket: RunTicket, duration: Duration) -> RunHandle {
        let run_id = ticket.run_id;
        let task = tokio::spawn(self.run(ticket, duration));
        RunHandle { run_id, task }
    }

    /// Run the loop to completion.
    pub async fn run(self, ticket: RunTicket, duration: Duration) -> RunOutcome {
        info!(
            run_id = ticket.run_id,
            duration_sec = duration.as_secs(),
            interval_ms = self.settings.sample_interval.as_millis() as u64,
            "test run started"
        );
        let deadline = Instant::now() + duration;

        let outcome = match self.sample_until(&ticket, deadline).await {
            Ok(()) => self.complete(&ticket).await,
            Err(e) => {
                // Leave the session idle so a later stop has nothing to report.
                self.session.abort(&ticket).await;
                RunOutcome::Aborted(e)
            }
        };

        match &outcome {
            RunOutcome::Completed(c) => info!(
                run_id = ticket.run_id,
                samples = c.samples,
                average_mbps = c.average,
                "test run completed"
            ),
            RunOutcome::Stopped => debug!(run_id = ticket.run_id, "test run stopped"),
            RunOutcome::Superseded => debug!(run_id = ticket.run_id, "test run superseded"),
            RunOutcome::Aborted(e) => warn!(run_id = ticket.run_id, error = %e, "test run aborted"),
        }
        outcome
    }

    /// Sample until the deadline passes or the ticket goes stale.
    async fn sample_until(&self, ticket: &RunTicket, deadline: Instant) -> Result<(), ThroughputError> {
        while Instant::now() < deadline && self.session.is_current(ticket).await {
            let sample = match self.measure.sample(&ticket.cancel).await {
                Ok(sample) => sample,
                Err(ThroughputError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };

            // Record and queue the report in one step so a concurrent stop
            // cannot slip its `final` in between.
            let mut queued = None;
            let recorded = self
                .session
                .record_and(ticket, sample.mbps, || {
                    queued = Some(self.outbox.enqueue_message(&ServerMessage::Speed {
                        speed: sample.mbps,
                    }));
                })
                .await;
            if !recorded {
                debug!(run_id = ticket.run_id, speed_mbps = sample.mbps, "late sample discarded");
                return Ok(());
            }
            if let Some(queued) = queued {
                self.deliver(queued?, ticket).await?;
            }

            tokio::select! {
                biased;
                _ = ticket.cancel.cancelled() => return Ok(()),
                _ = sleep(self.settings.sample_interval) => {}
            }
        }
        Ok(())
    }

    /// Report `final` if this loop is the one ending the run.
    async fn complete(&self, ticket: &RunTicket) -> RunOutcome {
        let mut queued = None;
        let finished = self
            .session
            .finish_and(ticket, |c| {
                queued = Some(
                    self.outbox
                        .enqueue_message(&ServerMessage::Final { average: c.average }),
                );
            })
            .await;

        let Some(completion) = finished else {
            return if self.session.current_run_id().await == ticket.run_id {
                RunOutcome::Stopped
            } else {
                RunOutcome::Superseded
            };
        };

        if let Some(queued) = queued {
            let delivered = match queued {
                Ok(delivery) => self.wait_written(delivery).await,
                Err(e) => Err(e),
            };
            if let Err(e) = delivered {
                return RunOutcome::Aborted(e);
            }
        }
        RunOutcome::Completed(completion)
    }

    /// Wait for a queued `speed` to be written, giving up early on cancel.
    async fn deliver(&self, delivery: Delivery, ticket: &RunTicket) -> Result<(), ThroughputError> {
        tokio::select! {
            biased;
            // Already queued ahead of any `final`; nothing left to wait for.
            _ = ticket.cancel.cancelled() => Ok(()),
            res = self.wait_written(delivery) => res,
        }
    }

    async fn wait_written(&self, delivery: Delivery) -> Result<(), ThroughputError> {
        timeout(self.settings.io_timeout, delivery.wait())
            .await
            .map_err(|_| ThroughputError::Timeout {
                what: "control write",
                after: self.settings.io_timeout,
            })?
            .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::control::outbox::{decode_frame, ChannelSink, Frame};
    use crate::throughput::sampler::Sample;

    /// Returns scripted speeds in order, repeating the last one.
    struct ScriptedMeasure {
        speeds: Vec<f64>,
        fail_on_call: Option<usize>,
        calls: AtomicUsize,
    }

    impl ScriptedMeasure {
        fn new(speeds: Vec<f64>) -> Self {
            Self {
                speeds,
                fail_on_call: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing_on(mut self, call: usize) -> Self {
            self.fail_on_call = Some(call);
            self
        }
    }

    #[async_trait::async_trait]
    impl Measure for ScriptedMeasure {
        async fn sample(&self, _cancel: &CancellationToken) -> Result<Sample, ThroughputError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                return Err(ThroughputError::Generation("entropy source unavailable".into()));
            }
            let speed = self.speeds[call.min(self.speeds.len() - 1)];
            Ok(Sample {
                bytes: 0,
                elapsed: Duration::ZERO,
                mbps: speed,
            })
        }
    }

    fn settings() -> DriverSettings {
        DriverSettings {
            sample_interval: Duration::from_secs(1),
            io_timeout: Duration::from_secs(5),
        }
    }

    struct Harness {
        session: Arc<Session>,
        outbox: Outbox,
        frames: mpsc::UnboundedReceiver<Frame>,
    }

    impl Harness {
        fn new() -> Self {
            let (sink, frames) = ChannelSink::new();
            Self::with_sink(sink, frames)
        }

        fn with_sink(sink: ChannelSink, frames: mpsc::UnboundedReceiver<Frame>) -> Self {
            let (outbox, _task) = Outbox::spawn(sink);
            Self {
                session: Arc::new(Session::new()),
                outbox,
                frames,
            }
        }

        fn driver(&self, measure: ScriptedMeasure) -> TestDriver {
            TestDriver::new(
                Arc::clone(&self.session),
                self.outbox.clone(),
                Arc::new(measure),
                settings(),
            )
        }

        async fn next_message(&mut self) -> ServerMessage {
            let frame = self.frames.recv().await.expect("frame");
            decode_frame(&frame).expect("server message")
        }

        fn drain_messages(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                if let Some(msg) = decode_frame(&frame) {
                    out.push(msg);
                }
            }
            out
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_natural_completion_sends_speeds_then_one_final() {
        let mut h = Harness::new();
        let ticket = h.session.start().await;
        let handle = h
            .driver(ScriptedMeasure::new(vec![10.0, 20.0, 60.0]))
            .spawn(ticket, Duration::from_secs(3));

        let outcome = handle.join().await.expect("driver finished");
        let completion = match outcome {
            RunOutcome::Completed(c) => c,
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(completion.samples, 3);
        assert_eq!(completion.average, 30.0);

        // Let the send task flush the final frame.
        tokio::task::yield_now().await;
        let messages = h.drain_messages();
        assert_eq!(
            messages,
            vec![
                ServerMessage::Speed { speed: 10.0 },
                ServerMessage::Speed { speed: 20.0 },
                ServerMessage::Speed { speed: 60.0 },
                ServerMessage::Final { average: 30.0 },
            ]
        );
        assert!(!h.session.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_second_run_sends_two_speeds() {
        let mut h = Harness::new();
        let ticket = h.session.start().await;
        let outcome = h
            .driver(ScriptedMeasure::new(vec![5.0]))
            .run(ticket, Duration::from_secs(2))
            .await;
        assert!(matches!(outcome, RunOutcome::Completed(_)));

        tokio::task::yield_now().await;
        let messages = h.drain_messages();
        let speeds = messages
            .iter()
            .filter(|m| matches!(m, ServerMessage::Speed { .. }))
            .count();
        let finals = messages
            .iter()
            .filter(|m| matches!(m, ServerMessage::Final { .. }))
            .count();
        assert_eq!(speeds, 2);
        assert_eq!(finals, 1);
        assert_eq!(messages.last(), Some(&ServerMessage::Final { average: 5.0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_stop_leaves_final_to_stopper() {
        let mut h = Harness::new();
        let ticket = h.session.start().await;
        let handle = h
            .driver(ScriptedMeasure::new(vec![42.0, 7.0]))
            .spawn(ticket, Duration::from_secs(10));

        assert_eq!(h.next_message().await, ServerMessage::Speed { speed: 42.0 });

        // What the stop handler does.
        let mut queued = None;
        let completion = h
            .session
            .stop_and(|c| {
                queued = Some(
                    h.outbox
                        .enqueue_message(&ServerMessage::Final { average: c.average }),
                )
            })
            .await
            .expect("stop ends the run");
        queued.unwrap().unwrap().wait().await.unwrap();
        assert_eq!(completion.samples, 1);
        assert_eq!(completion.average, 42.0);

        let outcome = handle.join().await.expect("driver finished");
        assert!(matches!(outcome, RunOutcome::Stopped));

        tokio::task::yield_now().await;
        assert_eq!(h.drain_messages(), vec![ServerMessage::Final { average: 42.0 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_loop_exits_without_side_effects() {
        let mut h = Harness::new();
        let old = h.session.start().await;
        let handle = h
            .driver(ScriptedMeasure::new(vec![1.0]))
            .spawn(old, Duration::from_secs(10));
        assert_eq!(h.next_message().await, ServerMessage::Speed { speed: 1.0 });

        let new = h.session.start().await;
        let outcome = handle.join().await.expect("driver finished");
        assert!(matches!(outcome, RunOutcome::Superseded));

        assert!(h.session.is_current(&new).await);
        assert!(h.session.snapshot().await.samples.is_empty());
        tokio::task::yield_now().await;
        assert!(h.drain_messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_error_aborts_without_final() {
        let mut h = Harness::new();
        let ticket = h.session.start().await;
        let outcome = h
            .driver(ScriptedMeasure::new(vec![9.0]).failing_on(1))
            .run(ticket, Duration::from_secs(10))
            .await;
        assert!(matches!(
            outcome,
            RunOutcome::Aborted(ThroughputError::Generation(_))
        ));

        tokio::task::yield_now().await;
        assert_eq!(h.drain_messages(), vec![ServerMessage::Speed { speed: 9.0 }]);
        assert!(!h.session.is_running().await);
        // Nothing left to report for the aborted run.
        assert!(h.session.stop().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_aborts_without_final() {
        let (sink, frames) = ChannelSink::failing_after(1);
        let mut h = Harness::with_sink(sink, frames);
        let ticket = h.session.start().await;
        let outcome = h
            .driver(ScriptedMeasure::new(vec![3.0]))
            .run(ticket, Duration::from_secs(10))
            .await;
        assert!(matches!(
            outcome,
            RunOutcome::Aborted(ThroughputError::Transport(_))
        ));
        assert_eq!(h.drain_messages(), vec![ServerMessage::Speed { speed: 3.0 }]);
        assert!(!h.session.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_speed_samples_are_reported() {
        let mut h = Harness::new();
        let ticket = h.session.start().await;
        let outcome = h
            .driver(ScriptedMeasure::new(vec![0.0]))
            .run(ticket, Duration::from_secs(1))
            .await;
        assert!(matches!(outcome, RunOutcome::Completed(c) if c.average == 0.0));

        tokio::task::yield_now().await;
        assert_eq!(
            h.drain_messages(),
            vec![
                ServerMessage::Speed { speed: 0.0 },
                ServerMessage::Final { average: 0.0 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_handle_reports_run_id() {
        let h = Harness::new();
        let ticket = h.session.start().await;
        let run_id = ticket.run_id;
        let handle = h
            .driver(ScriptedMeasure::new(vec![1.0]))
            .spawn(ticket, Duration::from_secs(1));
        assert_eq!(handle.run_id(), run_id);
        handle.join().await.expect("driver finished");
    }

    #[test]
    fn test_settings_from_config() {
        let s = DriverSettings::from_config(&TestConfig::default());
        assert_eq!(s.sample_interval, Duration::from_secs(1));
        assert_eq!(s.io_timeout, Duration::from_secs(10));
    }
}
