use std::sync::Arc;
use std::time::Duration;

use cronctl_core::config::RunnerConfig;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::events::{DueEvent, Events};

/// Outcome tally for one polled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub ran: usize,
    /// Guard refusals; the event stays pending for a later batch.
    pub skipped: usize,
    pub failed: usize,
}

/// Polls [`Events::get_events`] and runs each due event on the blocking pool.
pub struct Runner {
    events: Arc<Events>,
    poll_interval: Duration,
    workers: usize,
}

impl Runner {
    pub fn new(events: Arc<Events>, config: &RunnerConfig) -> Self {
        Self {
            events,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            workers: config.workers.max(1),
        }
    }

    /// Main loop. Polls until `shutdown` broadcasts `true`.
    ///
    /// A batch in flight when shutdown arrives is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            workers = self.workers,
            "event runner started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.run_batch().await;
                    if report != BatchReport::default() {
                        info!(ran = report.ran, skipped = report.skipped, failed = report.failed, "batch finished");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("event runner shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fetch one due batch and run it, at most `workers` events at a time.
    pub async fn run_batch(&self) -> BatchReport {
        let events = self.events.clone();
        let due = match tokio::task::spawn_blocking(move || events.get_events()).await {
            Ok(Ok(due)) => due,
            Ok(Err(e)) => {
                error!(code = e.code(), "fetching due events failed: {e}");
                return BatchReport::default();
            }
            Err(e) => {
                error!("due-events task panicked: {e}");
                return BatchReport::default();
            }
        };

        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for event in due {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let events = self.events.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = events.run_event(event.timestamp, &event.action_hashed, &event.instance, false);
                (event, result)
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.ran += 1,
                Ok((event, Err(e))) if e.is_skip() => {
                    debug!(timestamp = event.timestamp, instance = %event.instance, code = e.code(), "event skipped");
                    report.skipped += 1;
                }
                Ok((event, Err(e))) => {
                    log_failure(&event, &e);
                    report.failed += 1;
                }
                Err(e) => {
                    error!("event task panicked: {e}");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn log_failure(event: &DueEvent, err: &crate::error::EventError) {
    warn!(
        timestamp = event.timestamp,
        action_hashed = %event.action_hashed,
        instance = %event.instance,
        code = err.code(),
        "event run failed: {err}"
    );
}
