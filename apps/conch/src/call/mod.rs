//! Call task: one place where user commands, relay frames and peer events are
//! applied to the [`Negotiator`], strictly one at a time.

mod error;
mod negotiator;

pub use error::{CallError, FailureReason, NegotiationError, NegotiationStep};
pub use negotiator::{CallState, Negotiator};

use crate::media::{CaptureConstraints, MediaCapture, RenderSink};
use crate::peer::{IceServer, PeerConnectionFactory, PeerEvent};
use crate::signaling::{SignalSink, SignalingMessage};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Where user-facing failure notices go.
pub trait NoticeSink: Send + Sync {
    fn notify(&self, message: &str);
}

pub struct CallSetup {
    pub signaling: Arc<dyn SignalSink>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub capture: Arc<dyn MediaCapture>,
    pub local_view: Arc<dyn RenderSink>,
    pub remote_view: Arc<dyn RenderSink>,
    pub notices: Arc<dyn NoticeSink>,
    pub ice_servers: Vec<IceServer>,
    pub constraints: CaptureConstraints,
}

#[derive(Debug)]
enum CallCommand {
    AcquireMedia,
    StartCall,
    HangUp,
    PausePreview,
    ResumePreview,
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
#[error("call task has stopped")]
pub struct CallStopped;

#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    state: watch::Receiver<CallState>,
}

impl CallHandle {
    fn send(&self, command: CallCommand) -> Result<(), CallStopped> {
        self.commands.send(command).map_err(|_| CallStopped)
    }

    pub fn acquire_media(&self) -> Result<(), CallStopped> {
        self.send(CallCommand::AcquireMedia)
    }

    pub fn start_call(&self) -> Result<(), CallStopped> {
        self.send(CallCommand::StartCall)
    }

    pub fn hang_up(&self) -> Result<(), CallStopped> {
        self.send(CallCommand::HangUp)
    }

    pub fn pause_preview(&self) -> Result<(), CallStopped> {
        self.send(CallCommand::PausePreview)
    }

    pub fn resume_preview(&self) -> Result<(), CallStopped> {
        self.send(CallCommand::ResumePreview)
    }

    /// Asks the task to tear down and exit; await the join handle from
    /// [`CallController::spawn`] to know when it has.
    pub fn shutdown(&self) -> Result<(), CallStopped> {
        self.send(CallCommand::Shutdown)
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub async fn wait_for(&self, target: CallState) -> Result<(), CallStopped> {
        let mut state = self.state.clone();
        state
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| CallStopped)
    }
}

pub struct CallController;

impl CallController {
    pub fn spawn(
        setup: CallSetup,
        inbound: broadcast::Receiver<SignalingMessage>,
    ) -> (CallHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(setup, events_tx);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = CallHandle {
            commands: commands_tx,
            state: negotiator.subscribe(),
        };
        let task = tokio::spawn(run(negotiator, commands_rx, inbound, events_rx));
        (handle, task)
    }
}

async fn run(
    mut negotiator: Negotiator,
    mut commands: mpsc::UnboundedReceiver<CallCommand>,
    mut inbound: broadcast::Receiver<SignalingMessage>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) {
    let mut inbound_open = true;
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                tracing::debug!(target = "conch::call", ?command, "call command");
                match command {
                    CallCommand::AcquireMedia => negotiator.acquire_media().await,
                    CallCommand::StartCall => negotiator.start_call().await,
                    CallCommand::HangUp => negotiator.hang_up().await,
                    CallCommand::PausePreview => negotiator.pause_preview(),
                    CallCommand::ResumePreview => negotiator.resume_preview(),
                    CallCommand::Shutdown => break,
                }
            }
            message = inbound.recv(), if inbound_open => match message {
                Ok(message) => {
                    tracing::debug!(
                        target = "conch::call",
                        kind = %message.message_type(),
                        "signaling message"
                    );
                    negotiator.handle_signal(message).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target = "conch::call",
                        skipped,
                        "call task fell behind the relay; messages lost"
                    );
                    negotiator.signals_lost(skipped).await;
                }
                Err(RecvError::Closed) => {
                    tracing::warn!(target = "conch::call", "signaling stream ended");
                    inbound_open = false;
                }
            },
            Some(event) = events.recv() => negotiator.handle_peer_event(event).await,
        }
    }
    negotiator.shutdown().await;
    tracing::debug!(target = "conch::call", "call task stopped");
}

#[cfg(test)]
mod tests {
    use super::negotiator::tests::Harness;
    use super::*;
    use crate::media::tests::CountingCapture;
    use crate::peer::{IceCandidate, IceConnectionState, SessionDescription};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn reach(handle: &CallHandle, target: CallState) {
        timeout(Duration::from_secs(5), handle.wait_for(target))
            .await
            .unwrap_or_else(|_| panic!("never reached {target:?}"))
            .expect("call task alive");
    }

    #[test_timeout::tokio_timeout_test]
    async fn drives_offer_answer_and_hangup() {
        let harness = Harness::new(CountingCapture::ok());
        let (relay, inbound) = broadcast::channel(16);
        let (handle, task) = CallController::spawn(harness.setup(), inbound);

        handle.acquire_media().expect("acquire");
        handle.start_call().expect("start");
        reach(&handle, CallState::Negotiating).await;

        relay
            .send(SignalingMessage::Answer(SessionDescription::answer("remote")))
            .expect("relay answer");
        reach(&handle, CallState::Active).await;

        handle.hang_up().expect("hang up");
        reach(&handle, CallState::Idle).await;
        assert_eq!(harness.signals.sent().last(), Some(&SignalingMessage::Hangup));

        handle.shutdown().expect("shutdown");
        task.await.expect("join");
        assert!(handle.start_call().is_err());
        assert_eq!(harness.capture.calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn peer_events_flow_through_the_task() {
        let harness = Harness::new(CountingCapture::ok());
        let (_relay, inbound) = broadcast::channel(16);
        let (handle, task) = CallController::spawn(harness.setup(), inbound);

        handle.start_call().expect("start");
        reach(&handle, CallState::Negotiating).await;
        let observer = harness.factory.peer(0).observer().expect("observer");
        observer.on_ice_connection_state_change(IceConnectionState::Failed);
        reach(&handle, CallState::Idle).await;
        assert!(harness.factory.peer(0).ops().contains(&"close"));

        handle.shutdown().expect("shutdown");
        task.await.expect("join");
    }

    #[test_timeout::tokio_timeout_test]
    async fn lagging_behind_the_relay_abandons_negotiation() {
        let harness = Harness::new(CountingCapture::ok());
        let (relay, inbound) = broadcast::channel(2);
        let (handle, task) = CallController::spawn(harness.setup(), inbound);

        handle.start_call().expect("start");
        reach(&handle, CallState::Negotiating).await;
        // No await in between: the task cannot drain, so it lags.
        for _ in 0..5 {
            relay
                .send(SignalingMessage::IceCandidate(IceCandidate {
                    candidate: "candidate:1 1 udp 1 10.0.0.9 9 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                }))
                .expect("relay candidate");
        }
        reach(&handle, CallState::Idle).await;
        assert_eq!(harness.signals.sent().last(), Some(&SignalingMessage::Hangup));

        handle.shutdown().expect("shutdown");
        task.await.expect("join");
    }

    #[test_timeout::tokio_timeout_test]
    async fn survives_relay_going_away() {
        let harness = Harness::new(CountingCapture::ok());
        let (relay, inbound) = broadcast::channel(16);
        let (handle, task) = CallController::spawn(harness.setup(), inbound);
        drop(relay);

        handle.start_call().expect("start");
        reach(&handle, CallState::Negotiating).await;
        handle.shutdown().expect("shutdown");
        task.await.expect("join");
        assert!(harness.factory.peer(0).ops().contains(&"close"));
        assert_eq!(handle.state(), CallState::Idle);
    }
}
