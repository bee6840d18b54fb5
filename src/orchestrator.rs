//! Call engine event loop
//!
//! A single task owns the [`CallMachine`] and everything feeding it:
//! controller commands, inbound signaling, media session events and timer
//! expiries all converge here, get applied one at a time, and the resulting
//! actions are executed before the next input is taken. Serializing inputs
//! through one loop is what makes the state machine's transitions atomic
//! without any locking.
//!
//! Slow media operations (capture, offer and answer creation) run in
//! spawned pipelines that report back through a continuation channel. Each
//! continuation carries the session generation it was started under, so a
//! pipeline that outlives its call attempt is silently discarded instead of
//! corrupting the next one.

use crate::call::{Action, CallMachine, Input};
use crate::identity::PeerIdentity;
use crate::media::{MediaError, MediaEvent, MediaFactory, MediaSession, SessionDescription};
use crate::signaling::{SignalingChannel, SignalingError};
use crate::timer::{TimerExpiry, TimerRegistry};
use crate::types::{CallEvent, CallSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

/// Retry delay after a transient signaling receive error
const SIGNALING_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Broadcast buffer for call events; slow subscribers lag, they do not
/// block the engine
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Commands from the controller to the engine task
#[derive(Debug)]
pub(crate) enum Command<I: PeerIdentity> {
    /// Feed an input to the state machine
    Input(Input<I>),
    /// Stop the engine, ending any active call first
    Shutdown,
}

/// A deferred state-machine input produced by a spawned media pipeline
#[derive(Debug)]
struct Continuation<I: PeerIdentity> {
    generation: u64,
    input: Input<I>,
}

/// Channel endpoints the controller keeps after spawning the engine
pub(crate) struct EngineHandles<I: PeerIdentity> {
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command<I>>,
    pub(crate) snapshot_rx: watch::Receiver<CallSnapshot<I>>,
    pub(crate) events_tx: broadcast::Sender<CallEvent<I>>,
}

/// One select-loop iteration's outcome
enum Step<I: PeerIdentity> {
    Apply(Input<I>),
    Resume(Continuation<I>),
    Timer(TimerExpiry),
    MediaClosed,
    SignalRetry(String),
    Shutdown,
}

/// The engine task state
pub(crate) struct Orchestrator<S: SignalingChannel> {
    machine: CallMachine<S::PeerId>,
    signaling: Arc<S>,
    media_factory: Arc<dyn MediaFactory>,
    media: Option<Arc<dyn MediaSession>>,
    media_events: Option<mpsc::UnboundedReceiver<MediaEvent>>,
    timers: TimerRegistry,
    timer_rx: mpsc::UnboundedReceiver<TimerExpiry>,
    cmd_rx: mpsc::UnboundedReceiver<Command<S::PeerId>>,
    cont_tx: mpsc::UnboundedSender<Continuation<S::PeerId>>,
    cont_rx: mpsc::UnboundedReceiver<Continuation<S::PeerId>>,
    snapshot_tx: watch::Sender<CallSnapshot<S::PeerId>>,
    events_tx: broadcast::Sender<CallEvent<S::PeerId>>,
}

impl<S: SignalingChannel> Orchestrator<S> {
    /// Build an engine around the given signaling channel and media factory
    pub(crate) fn new(
        signaling: Arc<S>,
        media_factory: Arc<dyn MediaFactory>,
    ) -> (Self, EngineHandles<S::PeerId>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (cont_tx, cont_rx) = mpsc::unbounded_channel();
        let (timers, timer_rx) = TimerRegistry::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::idle());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let handles = EngineHandles {
            cmd_tx,
            snapshot_rx,
            events_tx: events_tx.clone(),
        };
        let engine = Self {
            machine: CallMachine::new(),
            signaling,
            media_factory,
            media: None,
            media_events: None,
            timers,
            timer_rx,
            cmd_rx,
            cont_tx,
            cont_rx,
            snapshot_tx,
            events_tx,
        };
        (engine, handles)
    }

    /// Run until shutdown or until the signaling channel closes
    pub(crate) async fn run(mut self) {
        tracing::debug!("call engine started");
        loop {
            let step = tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Input(input)) => Step::Apply(input),
                    Some(Command::Shutdown) | None => Step::Shutdown,
                },
                cont = self.cont_rx.recv() => match cont {
                    // Both ends live in this struct, so recv cannot fail
                    Some(c) => Step::Resume(c),
                    None => Step::Shutdown,
                },
                expiry = self.timer_rx.recv() => match expiry {
                    Some(e) => Step::Timer(e),
                    None => Step::Shutdown,
                },
                event = Self::next_media_event(&mut self.media_events) => match event {
                    Some(e) => Step::Apply(Self::media_input(e)),
                    None => Step::MediaClosed,
                },
                inbound = self.signaling.recv() => match inbound {
                    Ok(signal) => Step::Apply(Input::Signal {
                        from: signal.from,
                        event: signal.event,
                    }),
                    Err(SignalingError::Closed) => {
                        tracing::info!("signaling channel closed, stopping call engine");
                        Step::Shutdown
                    }
                    Err(e) => Step::SignalRetry(e.to_string()),
                },
            };

            match step {
                Step::Apply(input) => self.dispatch(input).await,
                Step::Resume(cont) => {
                    if cont.generation == self.machine.generation() {
                        self.dispatch(cont.input).await;
                    } else {
                        tracing::debug!(
                            stale = cont.generation,
                            current = self.machine.generation(),
                            "discarding continuation from a superseded session"
                        );
                    }
                }
                Step::Timer(expiry) => {
                    if expiry.generation == self.machine.generation() {
                        self.dispatch(Input::Timer(expiry.kind)).await;
                    } else {
                        tracing::debug!(timer = ?expiry.kind, "discarding stale timer expiry");
                    }
                }
                Step::MediaClosed => self.media_events = None,
                Step::SignalRetry(error) => {
                    tracing::warn!(error = %error, "signaling receive failed, retrying");
                    tokio::time::sleep(SIGNALING_RETRY_DELAY).await;
                }
                Step::Shutdown => break,
            }
        }

        if self.machine.state().is_active() {
            self.dispatch(Input::HangUp).await;
        }
        self.timers.cancel_all();
        if let Some(media) = self.media.take() {
            media.close().await;
        }
        tracing::debug!("call engine stopped");
    }

    async fn next_media_event(
        rx: &mut Option<mpsc::UnboundedReceiver<MediaEvent>>,
    ) -> Option<MediaEvent> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    fn media_input(event: MediaEvent) -> Input<S::PeerId> {
        match event {
            MediaEvent::TransportStateChanged(state) => Input::Transport(state),
            MediaEvent::IceCandidate(candidate) => Input::LocalCandidate(candidate),
            MediaEvent::RemoteTrack(kind) => Input::RemoteTrack(kind),
        }
    }

    /// Apply one input and execute its actions, then publish the snapshot
    async fn dispatch(&mut self, input: Input<S::PeerId>) {
        let actions = self.machine.apply(input);
        for action in actions {
            self.execute(action).await;
        }
        self.snapshot_tx.send_replace(self.machine.snapshot());
    }

    async fn execute(&mut self, action: Action<S::PeerId>) {
        let generation = self.machine.generation();
        match action {
            Action::NewSession => {
                if let Some(old) = self.media.take() {
                    // Left over from a session that ended without cleanup;
                    // close it out of band.
                    tokio::spawn(async move { old.close().await });
                }
                match self.media_factory.create() {
                    Ok((session, events)) => {
                        self.media = Some(session);
                        self.media_events = Some(events);
                    }
                    Err(error) => {
                        tracing::error!(error = %error, "failed to create media session");
                        self.push_continuation(generation, Input::MediaFailed { error });
                    }
                }
            }
            Action::AcquireMedia { constraints } => {
                let Some(media) = self.media.clone() else {
                    return;
                };
                let cont_tx = self.cont_tx.clone();
                tokio::spawn(async move {
                    let input = match media.acquire_local_media(constraints).await {
                        Ok(()) => Input::MediaAcquired,
                        Err(error) => Input::MediaFailed { error },
                    };
                    let _ = cont_tx.send(Continuation { generation, input });
                });
            }
            Action::CreateOffer => {
                let Some(media) = self.media.clone() else {
                    return;
                };
                let cont_tx = self.cont_tx.clone();
                tokio::spawn(async move {
                    let input = match Self::negotiate_offer(&media).await {
                        Ok(sdp) => Input::OfferReady(sdp),
                        Err(error) => Input::NegotiationFailed {
                            error: error.to_string(),
                        },
                    };
                    let _ = cont_tx.send(Continuation { generation, input });
                });
            }
            Action::CreateAnswer => {
                let Some(media) = self.media.clone() else {
                    return;
                };
                let cont_tx = self.cont_tx.clone();
                tokio::spawn(async move {
                    let input = match Self::negotiate_answer(&media).await {
                        Ok(sdp) => Input::AnswerReady(sdp),
                        Err(error) => Input::NegotiationFailed {
                            error: error.to_string(),
                        },
                    };
                    let _ = cont_tx.send(Continuation { generation, input });
                });
            }
            Action::SetRemoteDescription(sdp) => {
                let Some(media) = self.media.clone() else {
                    return;
                };
                if let Err(error) = media.set_remote_description(sdp).await {
                    self.push_continuation(
                        generation,
                        Input::NegotiationFailed {
                            error: error.to_string(),
                        },
                    );
                }
            }
            Action::AddIceCandidate(candidate) => {
                let Some(media) = self.media.clone() else {
                    return;
                };
                // Individual candidate failures are non-fatal; the pair that
                // works is the only one that matters.
                if let Err(error) = media.add_ice_candidate(candidate).await {
                    tracing::warn!(error = %error, "failed to apply remote candidate");
                }
            }
            Action::RestartIce => {
                let Some(media) = self.media.clone() else {
                    return;
                };
                if let Err(error) = media.restart_ice().await {
                    self.push_continuation(
                        generation,
                        Input::NegotiationFailed {
                            error: error.to_string(),
                        },
                    );
                }
            }
            Action::SetOutboundVideo(enabled) => {
                let Some(media) = self.media.clone() else {
                    return;
                };
                if let Err(error) = media.set_outbound_video(enabled).await {
                    tracing::warn!(error = %error, enabled, "failed to switch outbound video");
                }
            }
            Action::SetAudioEnabled(enabled) => {
                if let Some(media) = &self.media {
                    media.set_audio_enabled(enabled);
                }
            }
            Action::SetVideoEnabled(enabled) => {
                if let Some(media) = &self.media {
                    media.set_video_enabled(enabled);
                }
            }
            Action::SetRemoteAudioEnabled(enabled) => {
                if let Some(media) = &self.media {
                    media.set_remote_audio_enabled(enabled);
                }
            }
            Action::CloseSession => {
                self.media_events = None;
                if let Some(media) = self.media.take() {
                    media.close().await;
                }
            }
            Action::Send { to, event } => {
                // Best effort. The peer runs its own timers, so a lost
                // notification degrades to a timeout on the other side.
                if let Err(error) = self.signaling.send(&to, event.clone()).await {
                    tracing::warn!(to = %to, event = event.name(), error = %error, "failed to send signaling event");
                }
            }
            Action::Arm(kind) => self.timers.arm(kind, generation),
            Action::Cancel(kind) => self.timers.cancel(kind),
            Action::CancelAll => self.timers.cancel_all(),
            Action::Emit(event) => {
                let _ = self.events_tx.send(event);
            }
        }
    }

    async fn negotiate_offer(
        media: &Arc<dyn MediaSession>,
    ) -> Result<SessionDescription, MediaError> {
        let sdp = media.create_offer().await?;
        media.set_local_description(sdp.clone()).await?;
        Ok(sdp)
    }

    async fn negotiate_answer(
        media: &Arc<dyn MediaSession>,
    ) -> Result<SessionDescription, MediaError> {
        let sdp = media.create_answer().await?;
        media.set_local_description(sdp.clone()).await?;
        Ok(sdp)
    }

    fn push_continuation(&self, generation: u64, input: Input<S::PeerId>) {
        let _ = self.cont_tx.send(Continuation { generation, input });
    }
}
