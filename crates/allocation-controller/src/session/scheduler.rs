//! Session scheduler.
//!
//! Drives the phase machine against the configured start instant: sleep until
//! the countdown window opens, feed `BeginCountdown` into the pipeline, tick
//! once per second with personalized countdown frames, and feed `OpenSession`
//! at the start instant. The transitions travel through the same mailbox as
//! claims, so a claim enqueued before `OpenSession` is still rejected as
//! not-open no matter how close to the instant it arrived.
//!
//! Arming is guarded by an atomic compare-exchange: the operator may POST the
//! start endpoint any number of times and exactly one timer task runs.

use super::pipeline::SessionHandle;
use super::registry::ConnectionRegistry;
use allocation_protocol::ServerMessage;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Diagnostic returned when [`SessionScheduler::start`] arms the timer.
pub const STARTED: &str = "session start scheduled";

/// Diagnostic returned when the timer was already armed by an earlier call.
pub const ALREADY_STARTED: &str = "session start already scheduled";

/// One-shot timer driving `Scheduled → CountingDown → Open`.
pub struct SessionScheduler {
    session: SessionHandle,
    registry: Arc<ConnectionRegistry>,
    start_time: DateTime<Utc>,
    countdown_seconds: u64,
    cancel_token: CancellationToken,
    started: AtomicBool,
}

impl SessionScheduler {
    #[must_use]
    pub fn new(
        session: SessionHandle,
        registry: Arc<ConnectionRegistry>,
        start_time: DateTime<Utc>,
        countdown_seconds: u64,
        cancel_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            registry,
            start_time,
            countdown_seconds,
            cancel_token,
            started: AtomicBool::new(false),
        })
    }

    /// Arm the scheduler. Idempotent: the first call spawns the timer task,
    /// every later call is a no-op. Returns a diagnostic for the operator
    /// response body.
    pub fn start(self: &Arc<Self>) -> &'static str {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return ALREADY_STARTED;
        }

        info!(
            target: "alloc.scheduler",
            start_time = %self.start_time.to_rfc3339(),
            countdown_seconds = self.countdown_seconds,
            "Session start scheduled"
        );
        let scheduler = Arc::clone(self);
        tokio::spawn(scheduler.run());
        STARTED
    }

    async fn run(self: Arc<Self>) {
        // Durations are computed once against the wall clock; a start instant
        // already in the past clamps to an immediate open.
        let until_open = (self.start_time - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let window = Duration::from_secs(self.countdown_seconds);
        let until_countdown = until_open.saturating_sub(window);

        tokio::select! {
            () = self.cancel_token.cancelled() => return,
            () = tokio::time::sleep(until_countdown) => {}
        }

        if let Err(e) = self.session.begin_countdown() {
            warn!(target: "alloc.scheduler", error = %e, "Pipeline gone before countdown");
            return;
        }

        // When the start instant is closer than the full window, count down
        // only the seconds actually left.
        let ticks = self.countdown_seconds.min(until_open.as_secs());
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        for remaining in (1..=ticks).rev() {
            tokio::select! {
                () = self.cancel_token.cancelled() => return,
                _ = interval.tick() => {}
            }
            self.tick(remaining).await;
        }
        tokio::select! {
            () = self.cancel_token.cancelled() => return,
            _ = interval.tick() => {}
        }

        if let Err(e) = self.session.open_session() {
            warn!(target: "alloc.scheduler", error = %e, "Pipeline gone before open");
        }
    }

    /// Send one personalized countdown frame to every connected claimant.
    async fn tick(&self, remaining_seconds: u64) {
        for (token, display_name) in self.registry.connected_claimants().await {
            let _ = self
                .registry
                .send_to(
                    &token,
                    ServerMessage::Countdown {
                        remaining_seconds,
                        claimant_display_name: display_name,
                    },
                )
                .await;
        }
    }
}
