//! `SessionActor` - the single-consumer admission pipeline.
//!
//! Every state-changing request in the process funnels through one unbounded
//! FIFO mailbox drained by this actor, which exclusively owns the
//! [`AllocationState`]. Strict arrival order decides contended claims: two
//! claims for the last resource resolve purely by which command was enqueued
//! first. Phase gating falls out of the same ordering, because the phase
//! transitions themselves travel through the mailbox.
//!
//! A failure while processing one command is contained to that command: the
//! requester gets a generic failure reply (internal details stay in the log)
//! and the actor moves on to the next command.

use super::quota::{self, Decision};
use super::registry::ConnectionRegistry;
use super::state::{AllocationState, Phase, StateReport};
use crate::errors::AllocError;
use allocation_protocol::{RejectReason, ServerMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Commands accepted by the admission pipeline.
#[derive(Debug)]
pub enum SessionCommand {
    /// A claimant asks for a resource.
    Claim {
        claimant_token: String,
        resource_id: String,
    },
    /// Scheduler: enter the counting-down phase.
    BeginCountdown,
    /// Scheduler: open the session and fan out start snapshots.
    OpenSession,
    /// A connection asks for its personalized start snapshot (sent on
    /// connect; answered only once the session is open).
    StartSnapshot { claimant_token: String },
    /// Operator: full observable state.
    GetState {
        respond_to: oneshot::Sender<StateReport>,
    },
    /// Current phase (used by tests and the operator surface).
    GetPhase { respond_to: oneshot::Sender<Phase> },
}

/// Handle to the admission pipeline.
///
/// Enqueueing is synchronous and infallible while the actor lives: the
/// mailbox is unbounded, so producers (connection tasks, the scheduler) never
/// block behind admission processing.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::UnboundedSender<SessionCommand>,
    cancel_token: CancellationToken,
}

impl SessionHandle {
    /// Enqueue a claim. Arrival order at the mailbox is the only tiebreaker
    /// between contending claimants.
    pub fn claim(&self, claimant_token: String, resource_id: String) -> Result<(), AllocError> {
        self.send(SessionCommand::Claim {
            claimant_token,
            resource_id,
        })
    }

    pub fn begin_countdown(&self) -> Result<(), AllocError> {
        self.send(SessionCommand::BeginCountdown)
    }

    pub fn open_session(&self) -> Result<(), AllocError> {
        self.send(SessionCommand::OpenSession)
    }

    /// Ask for the personalized start snapshot for one claimant. Ignored by
    /// the actor while the session is not yet open; the claimant will get its
    /// snapshot from the open-session fan-out instead.
    pub fn start_snapshot(&self, claimant_token: String) -> Result<(), AllocError> {
        self.send(SessionCommand::StartSnapshot { claimant_token })
    }

    /// Fetch the operator state report.
    pub async fn get_state(&self) -> Result<StateReport, AllocError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::GetState { respond_to: tx })?;
        rx.await
            .map_err(|e| AllocError::Internal(format!("response receive failed: {e}")))
    }

    /// Fetch the current phase.
    pub async fn get_phase(&self) -> Result<Phase, AllocError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::GetPhase { respond_to: tx })?;
        rx.await
            .map_err(|e| AllocError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the session actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Get a child token for connection tasks.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    fn send(&self, command: SessionCommand) -> Result<(), AllocError> {
        self.sender
            .send(command)
            .map_err(|e| AllocError::Internal(format!("channel send failed: {e}")))
    }
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    /// Command receiver (the admission queue).
    receiver: mpsc::UnboundedReceiver<SessionCommand>,
    /// Exclusively-owned session state.
    state: AllocationState,
    /// Registry of live claimant connections, for replies and fan-outs.
    registry: Arc<ConnectionRegistry>,
    /// Cancellation token (child of the process token).
    cancel_token: CancellationToken,
}

impl SessionActor {
    /// Spawn the admission pipeline.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        state: AllocationState,
        registry: Arc<ConnectionRegistry>,
        cancel_token: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();

        let actor = Self {
            receiver,
            state,
            registry,
            cancel_token: cancel_token.clone(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "alloc.pipeline")]
    async fn run(mut self) {
        info!(target: "alloc.pipeline", "SessionActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "alloc.pipeline", "SessionActor received cancellation signal");
                    break;
                }

                command = self.receiver.recv() => {
                    match command {
                        Some(command) => {
                            self.handle_command(command).await;
                            metrics::counter!("alloc_pipeline_commands_total").increment(1);
                        }
                        None => {
                            info!(target: "alloc.pipeline", "SessionActor channel closed, exiting");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "alloc.pipeline",
            phase = ?self.state.phase(),
            "SessionActor stopped"
        );
    }

    /// Handle a single command.
    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Claim {
                claimant_token,
                resource_id,
            } => {
                self.handle_claim(&claimant_token, &resource_id).await;
            }

            SessionCommand::BeginCountdown => {
                if self.state.begin_countdown() {
                    info!(target: "alloc.pipeline", "Session is now counting down");
                } else {
                    debug!(
                        target: "alloc.pipeline",
                        phase = ?self.state.phase(),
                        "BeginCountdown ignored, session already past Scheduled"
                    );
                }
            }

            SessionCommand::OpenSession => {
                self.handle_open_session().await;
            }

            SessionCommand::StartSnapshot { claimant_token } => {
                if self.state.phase() == Phase::Open {
                    self.send_start_snapshot(&claimant_token).await;
                }
            }

            SessionCommand::GetState { respond_to } => {
                let _ = respond_to.send(self.state.report());
            }

            SessionCommand::GetPhase { respond_to } => {
                let _ = respond_to.send(self.state.phase());
            }
        }
    }

    /// Process one claim end to end: phase gate, existence check, quota
    /// evaluation, then either commit-and-announce or a reject reply to the
    /// requester alone.
    async fn handle_claim(&mut self, claimant_token: &str, resource_id: &str) {
        if self.state.phase() != Phase::Open {
            self.reject(claimant_token, resource_id, RejectReason::NotOpen)
                .await;
            return;
        }

        // Unknown resource ids get an explicit reject rather than silence so
        // a buggy client learns something went wrong.
        let Some(resource) = self.state.resource(resource_id).cloned() else {
            self.reject(claimant_token, resource_id, RejectReason::UnknownResource)
                .await;
            return;
        };

        let Some(claimant) = self.state.claimant(claimant_token).cloned() else {
            // Connections are only registered for known tokens, so this is a
            // server-side inconsistency rather than client error.
            warn!(
                target: "alloc.pipeline",
                resource_id = %resource_id,
                "Claim from a token missing from the claimant table"
            );
            self.reject(claimant_token, resource_id, RejectReason::Internal)
                .await;
            return;
        };

        match quota::evaluate(&resource, &claimant, self.state.caps()) {
            Decision::Reject(reason) => {
                self.reject(claimant_token, resource_id, reason).await;
            }
            Decision::Accept => {
                let Some((resource_name, counters)) =
                    self.state.apply_claim(claimant_token, resource_id)
                else {
                    // Evaluate said yes over ids apply_claim cannot find.
                    warn!(
                        target: "alloc.pipeline",
                        resource_id = %resource_id,
                        "Accepted claim failed to apply"
                    );
                    self.reject(claimant_token, resource_id, RejectReason::Internal)
                        .await;
                    return;
                };

                info!(
                    target: "alloc.pipeline",
                    claimant = %claimant.display_name,
                    resource_id = %resource_id,
                    total_claimed = counters.total_claimed,
                    "Claim accepted"
                );
                metrics::counter!("alloc_claims_accepted_total").increment(1);

                // The requester is the only connection that sees its own
                // success; everyone else just learns the resource is gone.
                let _ = self
                    .registry
                    .send_to(
                        claimant_token,
                        ServerMessage::ClaimSuccess {
                            resource_id: resource_id.to_string(),
                            resource_name,
                            counters,
                        },
                    )
                    .await;
                self.registry
                    .broadcast_except(
                        claimant_token,
                        ServerMessage::ResourceNowUnavailable {
                            resource_id: resource_id.to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    /// Reply to the requester alone with a rejection. No state changed.
    async fn reject(&self, claimant_token: &str, resource_id: &str, reason: RejectReason) {
        debug!(
            target: "alloc.pipeline",
            resource_id = %resource_id,
            reason = ?reason,
            "Claim rejected"
        );
        metrics::counter!("alloc_claims_rejected_total", "reason" => format!("{reason:?}"))
            .increment(1);
        let _ = self
            .registry
            .send_to(
                claimant_token,
                ServerMessage::ClaimFailure {
                    resource_id: resource_id.to_string(),
                    reason,
                    message: reason.human_message().to_string(),
                },
            )
            .await;
    }

    /// Open the session and send every connected claimant its personalized
    /// start snapshot.
    async fn handle_open_session(&mut self) {
        if !self.state.open() {
            debug!(target: "alloc.pipeline", "OpenSession ignored, session already open");
            return;
        }

        let connected = self.registry.connected_claimants().await;
        info!(
            target: "alloc.pipeline",
            connected = connected.len(),
            "Session is now open"
        );
        for (token, _display_name) in connected {
            self.send_start_snapshot(&token).await;
        }
    }

    /// Best-effort delivery of one claimant's start snapshot.
    async fn send_start_snapshot(&self, claimant_token: &str) {
        let Some((claimed_resource_ids, counters)) = self.state.claimant_view(claimant_token)
        else {
            // Registered connection with a token outside the claimant table;
            // nothing sensible to send.
            warn!(
                target: "alloc.pipeline",
                "Start snapshot requested for a token missing from the claimant table"
            );
            return;
        };

        let _ = self
            .registry
            .send_to(
                claimant_token,
                ServerMessage::Start {
                    resources_by_location: self.state.resources_by_location(),
                    claimed_resource_ids,
                    counters,
                    caps: self.state.caps().clone(),
                },
            )
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use super::super::registry::OUTBOUND_CHANNEL_BUFFER;
    use crate::catalog::Catalog;
    use std::time::Duration;
    use tokio::time::timeout;

    const LOCATIONS: &str = r#"[
        {"name": "A", "cap": 2, "resources": [
            {"id": "a1", "name": "Slot A1"},
            {"id": "a2", "name": "Slot A2"},
            {"id": "a3", "name": "Slot A3"}
        ]},
        {"name": "B", "cap": 1, "resources": [
            {"id": "b1", "name": "Slot B1"}
        ]},
        {"name": "C", "cap": 1, "resources": [
            {"id": "c1", "name": "Slot C1"}
        ]}
    ]"#;

    const CLAIMANTS: &str = r#"[
        {"token": "tok-x", "display_name": "Team X"},
        {"token": "tok-y", "display_name": "Team Y"}
    ]"#;

    struct Fixture {
        handle: SessionHandle,
        registry: Arc<ConnectionRegistry>,
        _task: JoinHandle<()>,
    }

    async fn fixture(global_cap: u32) -> Fixture {
        let catalog = Catalog::from_documents(LOCATIONS, CLAIMANTS, "A").unwrap();
        let state = AllocationState::from_catalog(&catalog, global_cap, 1, "A");
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, task) =
            SessionActor::spawn(state, Arc::clone(&registry), CancellationToken::new());
        Fixture {
            handle,
            registry,
            _task: task,
        }
    }

    async fn connect(fx: &Fixture, token: &str, name: &str) -> mpsc::Receiver<ServerMessage> {
        let (tx, mut rx) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
        fx.registry
            .connect(token, name, tx, CancellationToken::new())
            .await;
        assert_eq!(recv(&mut rx).await, ServerMessage::Connected);
        rx
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    async fn open(fx: &Fixture) {
        fx.handle.begin_countdown().unwrap();
        fx.handle.open_session().unwrap();
        // The fan-out runs inside the actor; a phase query both confirms the
        // transition and flushes the mailbox.
        assert_eq!(fx.handle.get_phase().await.unwrap(), Phase::Open);
    }

    fn failure_reason(message: &ServerMessage) -> RejectReason {
        match message {
            ServerMessage::ClaimFailure { reason, .. } => *reason,
            other => panic!("expected ClaimFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn claims_before_open_are_rejected_not_open() {
        let fx = fixture(3).await;
        let mut rx = connect(&fx, "tok-x", "Team X").await;

        fx.handle.claim("tok-x".into(), "a1".into()).unwrap();
        assert_eq!(failure_reason(&recv(&mut rx).await), RejectReason::NotOpen);

        // Counting down is still not open.
        fx.handle.begin_countdown().unwrap();
        fx.handle.claim("tok-x".into(), "a1".into()).unwrap();
        assert_eq!(failure_reason(&recv(&mut rx).await), RejectReason::NotOpen);

        let report = fx.handle.get_state().await.unwrap();
        assert!(report.claimants.iter().all(|c| c.claimed_resource_ids.is_empty()));
    }

    #[tokio::test]
    async fn open_session_fans_out_personalized_snapshots() {
        let fx = fixture(3).await;
        let mut rx_x = connect(&fx, "tok-x", "Team X").await;
        let mut rx_y = connect(&fx, "tok-y", "Team Y").await;

        open(&fx).await;

        for rx in [&mut rx_x, &mut rx_y] {
            match recv(rx).await {
                ServerMessage::Start {
                    resources_by_location,
                    claimed_resource_ids,
                    counters,
                    caps,
                } => {
                    assert_eq!(resources_by_location.len(), 3);
                    assert!(claimed_resource_ids.is_empty());
                    assert_eq!(counters.total_claimed, 0);
                    assert_eq!(caps.global_cap, 3);
                }
                other => panic!("expected Start, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn late_connector_gets_a_snapshot_on_request() {
        let fx = fixture(3).await;
        open(&fx).await;

        let mut rx = connect(&fx, "tok-x", "Team X").await;
        fx.handle.start_snapshot("tok-x".into()).unwrap();
        assert!(matches!(recv(&mut rx).await, ServerMessage::Start { .. }));
    }

    #[tokio::test]
    async fn snapshot_request_before_open_is_ignored() {
        let fx = fixture(3).await;
        let mut rx = connect(&fx, "tok-x", "Team X").await;

        fx.handle.start_snapshot("tok-x".into()).unwrap();
        assert_eq!(fx.handle.get_phase().await.unwrap(), Phase::Scheduled);
        assert!(rx.try_recv().is_err(), "no snapshot before open");
    }

    #[tokio::test]
    async fn contended_claim_resolves_by_arrival_order() {
        let fx = fixture(3).await;
        let mut rx_x = connect(&fx, "tok-x", "Team X").await;
        let mut rx_y = connect(&fx, "tok-y", "Team Y").await;
        open(&fx).await;
        let _ = recv(&mut rx_x).await; // Start
        let _ = recv(&mut rx_y).await; // Start

        // Both want the only B slot; X enqueued first.
        fx.handle.claim("tok-x".into(), "b1".into()).unwrap();
        fx.handle.claim("tok-y".into(), "b1".into()).unwrap();

        match recv(&mut rx_x).await {
            ServerMessage::ClaimSuccess {
                resource_id,
                resource_name,
                counters,
            } => {
                assert_eq!(resource_id, "b1");
                assert_eq!(resource_name, "Slot B1");
                assert_eq!(counters.total_claimed, 1);
                assert_eq!(counters.off_home_claimed, 1);
            }
            other => panic!("expected ClaimSuccess, got {other:?}"),
        }

        // Y sees the unavailability notice from X's win, then its own reject.
        assert_eq!(
            recv(&mut rx_y).await,
            ServerMessage::ResourceNowUnavailable {
                resource_id: "b1".to_string()
            }
        );
        assert_eq!(
            failure_reason(&recv(&mut rx_y).await),
            RejectReason::AlreadyClaimed
        );

        // The winner never receives the broadcast about its own claim.
        assert!(rx_x.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_resource_is_rejected_explicitly() {
        let fx = fixture(3).await;
        let mut rx = connect(&fx, "tok-x", "Team X").await;
        open(&fx).await;
        let _ = recv(&mut rx).await; // Start

        fx.handle.claim("tok-x".into(), "z9".into()).unwrap();
        assert_eq!(
            failure_reason(&recv(&mut rx).await),
            RejectReason::UnknownResource
        );
    }

    #[tokio::test]
    async fn reclaiming_an_owned_resource_is_already_claimed() {
        let fx = fixture(3).await;
        let mut rx = connect(&fx, "tok-x", "Team X").await;
        open(&fx).await;
        let _ = recv(&mut rx).await; // Start

        fx.handle.claim("tok-x".into(), "a1".into()).unwrap();
        assert!(matches!(recv(&mut rx).await, ServerMessage::ClaimSuccess { .. }));

        fx.handle.claim("tok-x".into(), "a1".into()).unwrap();
        assert_eq!(
            failure_reason(&recv(&mut rx).await),
            RejectReason::AlreadyClaimed
        );
    }

    #[tokio::test]
    async fn cap_walkthrough_yields_the_expected_reject_reasons() {
        // Caps sized so every rejection kind is reachable in one sequence:
        // location cap 2 on home A, off-home cap 1, global cap 4.
        let fx = fixture(4).await;
        let mut rx = connect(&fx, "tok-x", "Team X").await;
        open(&fx).await;
        let _ = recv(&mut rx).await; // Start

        // Two home claims succeed.
        for id in ["a1", "a2"] {
            fx.handle.claim("tok-x".into(), id.into()).unwrap();
            assert!(matches!(recv(&mut rx).await, ServerMessage::ClaimSuccess { .. }));
        }

        // A third home claim hits the A location cap.
        fx.handle.claim("tok-x".into(), "a3".into()).unwrap();
        assert_eq!(
            failure_reason(&recv(&mut rx).await),
            RejectReason::LocationCapExceeded
        );

        // First off-home claim is allowed.
        fx.handle.claim("tok-x".into(), "b1".into()).unwrap();
        assert!(matches!(recv(&mut rx).await, ServerMessage::ClaimSuccess { .. }));

        // Second off-home claim, on a different location, hits the off-home
        // aggregate cap.
        fx.handle.claim("tok-x".into(), "c1".into()).unwrap();
        assert_eq!(
            failure_reason(&recv(&mut rx).await),
            RejectReason::OffsiteCapExceeded
        );

        let report = fx.handle.get_state().await.unwrap();
        let x = report
            .claimants
            .iter()
            .find(|c| c.display_name == "Team X")
            .unwrap();
        assert_eq!(x.claimed_resource_ids, vec!["a1", "a2", "b1"]);
        assert_eq!(x.counters.total_claimed, 3);
        assert_eq!(x.counters.off_home_claimed, 1);
    }

    #[tokio::test]
    async fn global_cap_wins_when_several_caps_apply() {
        // Global cap 2: after a1 and b1 the claimant is at the global cap
        // and at B's location cap; the global reason must be reported.
        let fx = fixture(2).await;
        let mut rx = connect(&fx, "tok-x", "Team X").await;
        open(&fx).await;
        let _ = recv(&mut rx).await; // Start

        for id in ["a1", "b1"] {
            fx.handle.claim("tok-x".into(), id.into()).unwrap();
            assert!(matches!(recv(&mut rx).await, ServerMessage::ClaimSuccess { .. }));
        }

        fx.handle.claim("tok-x".into(), "a2".into()).unwrap();
        assert_eq!(
            failure_reason(&recv(&mut rx).await),
            RejectReason::GlobalCapExceeded
        );
    }

    #[tokio::test]
    async fn offline_requester_does_not_stall_the_pipeline() {
        let fx = fixture(3).await;
        open(&fx).await;

        // tok-x never connects; its claim still commits and the broadcast
        // still reaches everyone else.
        let mut rx_y = connect(&fx, "tok-y", "Team Y").await;
        fx.handle.start_snapshot("tok-y".into()).unwrap();
        let _ = recv(&mut rx_y).await; // Start

        fx.handle.claim("tok-x".into(), "a1".into()).unwrap();
        assert_eq!(
            recv(&mut rx_y).await,
            ServerMessage::ResourceNowUnavailable {
                resource_id: "a1".to_string()
            }
        );

        let report = fx.handle.get_state().await.unwrap();
        let x = report
            .claimants
            .iter()
            .find(|c| c.display_name == "Team X")
            .unwrap();
        assert_eq!(x.claimed_resource_ids, vec!["a1"]);
    }

    #[tokio::test]
    async fn cancellation_stops_the_actor() {
        let fx = fixture(3).await;
        fx.handle.cancel();
        timeout(Duration::from_secs(1), fx._task)
            .await
            .expect("actor did not stop")
            .unwrap();
    }
}
