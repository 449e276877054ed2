//! Cancellable periodic tasks.
//!
//! A [`ScheduledTask`] runs its tick on a fixed cadence until cancelled,
//! either explicitly, through its parent token, or by being dropped. A tick
//! in progress is abandoned on cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct ScheduledTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `tick` every `period`, first after one full period.
    pub fn every<F, Fut>(
        name: &'static str,
        period: Duration,
        parent: &CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = parent.child_token();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }
            debug!(task = name, "Scheduled task stopped");
        });

        info!(task = name, period_secs = period.as_secs(), "Scheduled task started");
        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for the task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
