//! Reconcile trigger publishers.
//!
//! Converts time and external signals into a single ordered stream of typed
//! triggers consumed by the engine loop. Publishers are clock-driven: the
//! periodic sync, the namespace-signal poll, the status-update cadence, and
//! the error-retry backoff. The sync timer is reset whenever any reconcile
//! attempt runs (whatever triggered it), so quiet periods yield exactly one
//! timed sync per period; status updates do not reset it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rudder_core::config::{BackoffConfig, SyncConfig};
use tokio::time::Instant;
use tracing::debug;

/// A reconcile trigger, handled in arrival order by the engine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Periodic re-evaluation of the source.
    Sync,
    /// The namespace controller requested an out-of-band resync.
    NamespaceSync,
    /// Backoff retry after a failed cycle.
    Retry,
    /// Surface sync status to the parent API.
    StatusUpdate,
}

/// Shared flag the namespace controller pings to request a resync.
#[derive(Debug, Clone, Default)]
pub struct NamespaceSignal {
    flag: Arc<AtomicBool>,
}

impl NamespaceSignal {
    /// Creates an unsignaled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a namespace resync; picked up at the next poll.
    pub fn ping(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct SyncPublisher {
    period: Duration,
    next: Instant,
}

impl SyncPublisher {
    fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    fn reset(&mut self) {
        self.next = Instant::now() + self.period;
    }
}

#[derive(Debug)]
struct TimeDelayPublisher {
    period: Duration,
    next: Instant,
}

impl TimeDelayPublisher {
    fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    fn rearm(&mut self) {
        self.next = Instant::now() + self.period;
    }
}

#[derive(Debug)]
struct RetryPublisher {
    backoff: BackoffConfig,
    attempt: u32,
    next: Option<Instant>,
}

impl RetryPublisher {
    fn new(backoff: BackoffConfig) -> Self {
        Self {
            backoff,
            attempt: 0,
            next: None,
        }
    }

    fn arm(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.backoff.delay_for_attempt(self.attempt);
        debug!(attempt = self.attempt, ?delay, "retry armed");
        self.next = Some(Instant::now() + delay);
    }

    fn disarm(&mut self) {
        self.attempt = 0;
        self.next = None;
    }
}

/// Configures which publishers exist. A publisher is created only when its
/// period is positive.
#[derive(Debug, Clone)]
pub struct PublishingGroupBuilder {
    /// Period of the timed sync.
    pub sync_period: Duration,
    /// Poll period of the namespace-controller signal.
    pub namespace_sync_period: Duration,
    /// Cadence of status surfacing.
    pub status_update_period: Duration,
    /// Backoff schedule for retries after a failed cycle.
    pub retry_backoff: BackoffConfig,
}

impl PublishingGroupBuilder {
    /// Extracts the publisher configuration from the engine configuration.
    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            sync_period: config.sync_period,
            namespace_sync_period: config.namespace_sync_period,
            status_update_period: config.status_update_period,
            retry_backoff: config.retry_backoff.clone(),
        }
    }

    /// Builds the publisher group, polling `signal` for namespace resyncs.
    #[must_use]
    pub fn build(&self, signal: NamespaceSignal) -> PublishingGroup {
        PublishingGroup {
            sync: (self.sync_period > Duration::ZERO).then(|| SyncPublisher::new(self.sync_period)),
            namespace: (self.namespace_sync_period > Duration::ZERO)
                .then(|| TimeDelayPublisher::new(self.namespace_sync_period)),
            status: (self.status_update_period > Duration::ZERO)
                .then(|| TimeDelayPublisher::new(self.status_update_period)),
            retry: (self.retry_backoff.delay_for_attempt(1) > Duration::ZERO)
                .then(|| RetryPublisher::new(self.retry_backoff.clone())),
            signal,
        }
    }
}

enum Due {
    Sync,
    Namespace,
    Status,
    Retry,
}

/// The live publisher set, yielding triggers in deadline order.
pub struct PublishingGroup {
    sync: Option<SyncPublisher>,
    namespace: Option<TimeDelayPublisher>,
    status: Option<TimeDelayPublisher>,
    retry: Option<RetryPublisher>,
    signal: NamespaceSignal,
}

impl PublishingGroup {
    /// Waits for the next trigger. Pends forever when no publisher is
    /// configured.
    pub async fn next(&mut self) -> Trigger {
        loop {
            let mut due: Option<(Instant, Due)> = None;
            let mut consider = |deadline: Option<Instant>, which: Due| {
                if let Some(deadline) = deadline {
                    if due.as_ref().map_or(true, |(best, _)| deadline < *best) {
                        due = Some((deadline, which));
                    }
                }
            };
            consider(self.retry.as_ref().and_then(|r| r.next), Due::Retry);
            consider(self.namespace.as_ref().map(|p| p.next), Due::Namespace);
            consider(self.sync.as_ref().map(|p| p.next), Due::Sync);
            consider(self.status.as_ref().map(|p| p.next), Due::Status);

            let Some((deadline, which)) = due else {
                std::future::pending::<()>().await;
                unreachable!("pending future never resolves");
            };
            tokio::time::sleep_until(deadline).await;

            match which {
                Due::Retry => {
                    if let Some(retry) = self.retry.as_mut() {
                        retry.next = None;
                    }
                    return Trigger::Retry;
                }
                Due::Namespace => {
                    if let Some(publisher) = self.namespace.as_mut() {
                        publisher.rearm();
                    }
                    // Poll the signal; absent a ping this deadline passes
                    // silently.
                    if self.signal.take() {
                        return Trigger::NamespaceSync;
                    }
                }
                Due::Sync => {
                    if let Some(publisher) = self.sync.as_mut() {
                        publisher.reset();
                    }
                    return Trigger::Sync;
                }
                Due::Status => {
                    if let Some(publisher) = self.status.as_mut() {
                        publisher.rearm();
                    }
                    return Trigger::StatusUpdate;
                }
            }
        }
    }

    /// Records the outcome of one reconcile attempt: resets the sync timer
    /// (the attempt just re-evaluated the source) and arms or disarms the
    /// retry backoff.
    pub fn cycle_finished(&mut self, success: bool) {
        if let Some(sync) = self.sync.as_mut() {
            sync.reset();
        }
        if let Some(retry) = self.retry.as_mut() {
            if success {
                retry.disarm();
            } else {
                retry.arm();
            }
        }
    }
}
