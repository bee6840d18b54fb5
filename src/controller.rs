//! Call controller facade
//!
//! [`CallController`] is the public entry point: it owns the engine task
//! and exposes the user-facing operations (start, accept, decline, hang up,
//! mute toggles) plus two observation surfaces, a watch channel with the
//! latest [`CallSnapshot`] and a broadcast stream of [`CallEvent`]s.
//!
//! All operations are fire-and-forget commands into the engine's queue.
//! The snapshot a caller observes right after a command may therefore still
//! be the old one; observers should follow the watch channel rather than
//! poll.

use crate::call::{CallError, Input};
use crate::identity::PeerIdentity;
use crate::media::MediaFactory;
use crate::orchestrator::{Command, EngineHandles, Orchestrator};
use crate::signaling::SignalingChannel;
use crate::types::{CallEvent, CallSnapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

struct Engine<I: PeerIdentity> {
    cmd_tx: mpsc::UnboundedSender<Command<I>>,
    snapshot_rx: watch::Receiver<CallSnapshot<I>>,
    events_tx: broadcast::Sender<CallEvent<I>>,
    task: JoinHandle<()>,
}

/// Manages 1:1 calls over a signaling channel and a media engine
///
/// Generic over the signaling implementation; the media engine is a trait
/// object because exactly one is ever plugged in per process.
pub struct CallController<S: SignalingChannel> {
    signaling: Arc<S>,
    media_factory: Arc<dyn MediaFactory>,
    local_identity: S::PeerId,
    engine: Mutex<Option<Engine<S::PeerId>>>,
}

impl<S: SignalingChannel> CallController<S> {
    /// Create a controller; no task runs until [`start`](Self::start)
    pub fn new(
        signaling: Arc<S>,
        media_factory: Arc<dyn MediaFactory>,
        local_identity: S::PeerId,
    ) -> Self {
        Self {
            signaling,
            media_factory,
            local_identity,
            engine: Mutex::new(None),
        }
    }

    /// The local user's identity
    pub fn local_identity(&self) -> &S::PeerId {
        &self.local_identity
    }

    /// Spawn the engine task and begin listening for inbound calls
    ///
    /// # Errors
    ///
    /// Returns [`CallError::AlreadyStarted`] if the engine is running.
    pub fn start(&self) -> Result<(), CallError> {
        let mut guard = self.engine.lock();
        if guard.is_some() {
            return Err(CallError::AlreadyStarted);
        }

        let (orchestrator, handles) =
            Orchestrator::new(Arc::clone(&self.signaling), Arc::clone(&self.media_factory));
        let EngineHandles {
            cmd_tx,
            snapshot_rx,
            events_tx,
        } = handles;
        let task = tokio::spawn(orchestrator.run());

        tracing::info!(local = %self.local_identity, "call controller started");
        *guard = Some(Engine {
            cmd_tx,
            snapshot_rx,
            events_tx,
            task,
        });
        Ok(())
    }

    /// Stop the engine, hanging up any active call first
    ///
    /// Idempotent; stopping a controller that never started is a no-op.
    pub async fn stop(&self) {
        let engine = self.engine.lock().take();
        let Some(engine) = engine else {
            return;
        };
        let _ = engine.cmd_tx.send(Command::Shutdown);
        if engine.task.await.is_err() {
            tracing::warn!("call engine task ended abnormally");
        }
        tracing::info!(local = %self.local_identity, "call controller stopped");
    }

    /// Whether the engine task is running
    pub fn is_started(&self) -> bool {
        self.engine.lock().is_some()
    }

    /// Start an outbound call to `peer`
    ///
    /// # Errors
    ///
    /// Fails fast with [`CallError::CallInProgress`] while another call is
    /// active, and with [`CallError::InvalidPeer`] for an unusable peer.
    pub fn start_call(&self, peer: S::PeerId, is_video: bool) -> Result<(), CallError> {
        if peer.to_string_repr().is_empty() {
            return Err(CallError::InvalidPeer("empty identity".to_string()));
        }
        if peer.unique_id() == self.local_identity.unique_id() {
            return Err(CallError::InvalidPeer("cannot call yourself".to_string()));
        }
        if self.snapshot()?.state.is_active() {
            return Err(CallError::CallInProgress);
        }
        self.send_input(Input::Start { peer, is_video })
    }

    /// Accept the currently ringing inbound call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotStarted`] if the engine is not running.
    pub fn accept_call(&self) -> Result<(), CallError> {
        self.send_input(Input::Accept)
    }

    /// Decline the currently ringing inbound call
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotStarted`] if the engine is not running.
    pub fn decline_call(&self) -> Result<(), CallError> {
        self.send_input(Input::Decline)
    }

    /// Hang up the active call, or clear a failed one immediately
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotStarted`] if the engine is not running.
    pub fn end_call(&self) -> Result<(), CallError> {
        self.send_input(Input::HangUp)
    }

    /// Switch the connected call between audio-only and video
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotStarted`] if the engine is not running.
    pub fn switch_call_type(&self) -> Result<(), CallError> {
        self.send_input(Input::SwitchCallType)
    }

    /// Toggle the outbound audio mute flag
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotStarted`] if the engine is not running.
    pub fn toggle_audio_mute(&self) -> Result<(), CallError> {
        self.send_input(Input::ToggleAudioMute)
    }

    /// Toggle the outbound video mute flag
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotStarted`] if the engine is not running.
    pub fn toggle_video_mute(&self) -> Result<(), CallError> {
        self.send_input(Input::ToggleVideoMute)
    }

    /// Toggle local silencing of the peer's audio
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotStarted`] if the engine is not running.
    pub fn toggle_remote_audio_mute(&self) -> Result<(), CallError> {
        self.send_input(Input::ToggleRemoteAudioMute)
    }

    /// The latest published call snapshot
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotStarted`] if the engine is not running.
    pub fn snapshot(&self) -> Result<CallSnapshot<S::PeerId>, CallError> {
        let guard = self.engine.lock();
        let engine = guard.as_ref().ok_or(CallError::NotStarted)?;
        // Bound locally so the watch borrow ends before the lock guard drops.
        let snapshot = engine.snapshot_rx.borrow().clone();
        Ok(snapshot)
    }

    /// Watch channel carrying every published call snapshot
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotStarted`] if the engine is not running.
    pub fn watch_state(&self) -> Result<watch::Receiver<CallSnapshot<S::PeerId>>, CallError> {
        let guard = self.engine.lock();
        let engine = guard.as_ref().ok_or(CallError::NotStarted)?;
        Ok(engine.snapshot_rx.clone())
    }

    /// Subscribe to call events
    ///
    /// Slow subscribers lag rather than block the engine.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotStarted`] if the engine is not running.
    pub fn subscribe_events(&self) -> Result<broadcast::Receiver<CallEvent<S::PeerId>>, CallError> {
        let guard = self.engine.lock();
        let engine = guard.as_ref().ok_or(CallError::NotStarted)?;
        Ok(engine.events_tx.subscribe())
    }

    fn send_input(&self, input: Input<S::PeerId>) -> Result<(), CallError> {
        let cmd_tx = {
            let guard = self.engine.lock();
            guard
                .as_ref()
                .map(|e| e.cmd_tx.clone())
                .ok_or(CallError::NotStarted)?
        };
        cmd_tx
            .send(Command::Input(input))
            .map_err(|_| CallError::EngineGone)
    }
}
