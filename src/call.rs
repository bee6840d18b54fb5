//! Call state machine
//!
//! The machine owns the authoritative call state for at most one session at
//! a time. It is pure: every input produces a list of actions (signaling
//! sends, media requests, timer arm/cancel, observer notifications) that the
//! orchestrator executes. No I/O happens here, which keeps every transition
//! unit-testable.
//!
//! State machine (initial `Idle`; `Ended`/`Failed` reset to `Idle` after
//! cleanup):
//!
//! ```text
//!          start_call                    inbound call_request
//!     Idle ──────────► Calling     Idle ──────────────────► Ringing
//!                         │                                    │ accept
//!        inbound accept   ▼                                    ▼
//!                     Connecting ◄─────────────────────── Connecting
//!                         │ transport connected
//!                         ▼
//!                     Connected ──(reconnects exhausted)──► Failed ─► Idle
//!                         │ hang up / remote end
//!                         ▼
//!                      Ended ─► Idle
//! ```
//!
//! A transport `Disconnected`/`Failed` while `Connected` does not fail the
//! call; transient renegotiation is expected. Only a bounded number of
//! consecutive failed recovery attempts ends it. The caller-side answer
//! timeout is likewise non-fatal: the peer may still answer late.

use crate::identity::PeerIdentity;
use crate::media::{IceCandidateInit, MediaError, SessionDescription};
use crate::signaling::SignalEvent;
use crate::timer::TimerKind;
use crate::types::{
    CallEvent, CallId, CallNotice, CallSnapshot, CallState, LocalMute, MediaConstraints,
    PendingIncoming, TrackKind, TransportState, MAX_RECONNECT_ATTEMPTS,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the call controller boundary
#[derive(Error, Debug)]
pub enum CallError {
    /// A call attempt is already in progress
    #[error("A call is already in progress")]
    CallInProgress,

    /// The peer identity is unusable
    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    /// The controller has not been started
    #[error("Call controller not started")]
    NotStarted,

    /// The controller is already running
    #[error("Call controller already started")]
    AlreadyStarted,

    /// The orchestrator task is gone
    #[error("Call engine unavailable")]
    EngineGone,
}

/// Inputs driving the call state machine
#[derive(Debug, Clone)]
pub enum Input<I: PeerIdentity> {
    /// Local user starts an outbound call
    Start {
        /// Who to call
        peer: I,
        /// Whether to capture video
        is_video: bool,
    },
    /// Local user accepts the ringing call
    Accept,
    /// Local user declines the ringing call
    Decline,
    /// Local user hangs up
    HangUp,
    /// Local user switches between audio and video call
    SwitchCallType,
    /// Flip the outbound audio mute flag
    ToggleAudioMute,
    /// Flip the outbound video mute flag
    ToggleVideoMute,
    /// Flip local silencing of the inbound audio track
    ToggleRemoteAudioMute,
    /// An inbound signaling event
    Signal {
        /// Sender
        from: I,
        /// The event
        event: SignalEvent,
    },
    /// Local capture finished successfully
    MediaAcquired,
    /// Local capture failed
    MediaFailed {
        /// The failure
        error: MediaError,
    },
    /// The local offer was created and applied
    OfferReady(SessionDescription),
    /// The local answer was created and applied
    AnswerReady(SessionDescription),
    /// An asynchronous negotiation step failed
    NegotiationFailed {
        /// Error description
        error: String,
    },
    /// The media session discovered a local network-path candidate
    LocalCandidate(IceCandidateInit),
    /// A remote media track arrived
    RemoteTrack(TrackKind),
    /// The media transport reported a new state
    Transport(TransportState),
    /// An armed timer fired (generation already validated)
    Timer(TimerKind),
}

/// Actions requested by the state machine, executed by the orchestrator
#[derive(Debug, Clone)]
pub enum Action<I: PeerIdentity> {
    /// Create a fresh media session for the new call attempt
    NewSession,
    /// Acquire local capture on the current media session
    AcquireMedia {
        /// Capture constraints
        constraints: MediaConstraints,
    },
    /// Create and apply a local offer
    CreateOffer,
    /// Create and apply a local answer
    CreateAnswer,
    /// Apply the peer's session description
    SetRemoteDescription(SessionDescription),
    /// Apply a peer network-path candidate
    AddIceCandidate(IceCandidateInit),
    /// Restart network-path negotiation on the existing session
    RestartIce,
    /// Add or remove the outbound video track
    SetOutboundVideo(bool),
    /// Enable or disable the outbound audio track
    SetAudioEnabled(bool),
    /// Enable or disable the outbound video track
    SetVideoEnabled(bool),
    /// Enable or disable the inbound audio track
    SetRemoteAudioEnabled(bool),
    /// Stop capture and close the media session
    CloseSession,
    /// Send a signaling event
    Send {
        /// Recipient
        to: I,
        /// The event
        event: SignalEvent,
    },
    /// Arm a timer for its configured duration
    Arm(TimerKind),
    /// Cancel a timer
    Cancel(TimerKind),
    /// Cancel every armed timer
    CancelAll,
    /// Notify observers
    Emit(CallEvent<I>),
}

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    LocalHangUp,
    LocalDecline,
    RingTimedOut,
    RemoteEnded,
    RemoteDeclined,
    RemoteFailed,
}

/// The single mutable aggregate for one call attempt
#[derive(Debug, Clone)]
pub struct CallSession<I: PeerIdentity> {
    /// Call identifier, unique per attempt
    pub call_id: CallId,
    /// The other participant, immutable for the session's lifetime
    pub peer: I,
    /// Authoritative call state
    pub state: CallState,
    /// Transport state as last reported, never set directly
    pub transport_state: TransportState,
    /// Whether the call was negotiated with video
    pub is_video: bool,
    /// Reconnection attempts consumed for the current outage
    pub reconnect_attempts: u32,
    /// When the transport first connected
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds of connected call time
    pub duration_seconds: u64,
    /// Local track mute flags
    pub local_muted: LocalMute,
    /// Inbound audio silenced locally
    pub remote_audio_muted: bool,
    /// Inbound call awaiting the local user's decision
    pub pending_incoming: Option<PendingIncoming<I>>,
    /// True for calls the local user started
    pub outbound: bool,
    reconnect_pending: bool,
    candidates_ready: bool,
    queued_candidates: Vec<IceCandidateInit>,
}

impl<I: PeerIdentity> CallSession<I> {
    fn outbound(peer: I, is_video: bool) -> Self {
        Self {
            call_id: CallId::new(),
            peer,
            state: CallState::Calling,
            transport_state: TransportState::New,
            is_video,
            reconnect_attempts: 0,
            started_at: None,
            duration_seconds: 0,
            local_muted: LocalMute::default(),
            remote_audio_muted: false,
            pending_incoming: None,
            outbound: true,
            reconnect_pending: false,
            candidates_ready: false,
            queued_candidates: Vec::new(),
        }
    }

    fn inbound(peer: I, is_video: bool) -> Self {
        let pending = PendingIncoming {
            from: peer.clone(),
            is_video,
        };
        Self {
            call_id: CallId::new(),
            peer,
            state: CallState::Ringing,
            transport_state: TransportState::New,
            is_video,
            reconnect_attempts: 0,
            started_at: None,
            duration_seconds: 0,
            local_muted: LocalMute::default(),
            remote_audio_muted: false,
            pending_incoming: Some(pending),
            outbound: false,
            reconnect_pending: false,
            candidates_ready: false,
            queued_candidates: Vec::new(),
        }
    }
}

/// The call state machine
///
/// Holds at most one [`CallSession`] plus a monotonically incrementing
/// session generation. The generation changes whenever a session is created
/// or reset, so timer expiries armed under a superseded session can be
/// discarded by the orchestrator.
pub struct CallMachine<I: PeerIdentity> {
    session: Option<CallSession<I>>,
    last_error: Option<String>,
    generation: u64,
}

impl<I: PeerIdentity> Default for CallMachine<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: PeerIdentity> CallMachine<I> {
    /// Create an idle machine
    pub fn new() -> Self {
        Self {
            session: None,
            last_error: None,
            generation: 0,
        }
    }

    /// Current session generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current call state
    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map_or(CallState::Idle, |s| s.state)
    }

    /// The active session, if any
    pub fn session(&self) -> Option<&CallSession<I>> {
        self.session.as_ref()
    }

    /// Read-only snapshot for observers
    pub fn snapshot(&self) -> CallSnapshot<I> {
        match &self.session {
            Some(s) => CallSnapshot {
                call_id: Some(s.call_id),
                peer: Some(s.peer.clone()),
                state: s.state,
                transport_state: s.transport_state,
                is_video: s.is_video,
                reconnect_attempts: s.reconnect_attempts,
                started_at: s.started_at,
                duration_seconds: s.duration_seconds,
                local_muted: s.local_muted,
                remote_audio_muted: s.remote_audio_muted,
                pending_incoming: s.pending_incoming.clone(),
                call_error: self.last_error.clone(),
            },
            None => CallSnapshot {
                call_error: self.last_error.clone(),
                ..CallSnapshot::idle()
            },
        }
    }

    /// Apply one input, returning the actions to execute in order
    pub fn apply(&mut self, input: Input<I>) -> Vec<Action<I>> {
        match input {
            Input::Start { peer, is_video } => self.on_start(peer, is_video),
            Input::Accept => self.on_accept(),
            Input::Decline => self.on_decline(),
            Input::HangUp => self.on_hang_up(),
            Input::SwitchCallType => self.on_switch_call_type(),
            Input::ToggleAudioMute => self.on_toggle_audio_mute(),
            Input::ToggleVideoMute => self.on_toggle_video_mute(),
            Input::ToggleRemoteAudioMute => self.on_toggle_remote_audio_mute(),
            Input::Signal { from, event } => self.on_signal(from, event),
            Input::MediaAcquired => self.on_media_acquired(),
            Input::MediaFailed { error } => self.on_media_failed(error),
            Input::OfferReady(sdp) => self.on_offer_ready(sdp),
            Input::AnswerReady(sdp) => self.on_answer_ready(sdp),
            Input::NegotiationFailed { error } => self.on_negotiation_failed(error),
            Input::LocalCandidate(candidate) => self.on_local_candidate(candidate),
            Input::RemoteTrack(kind) => self.on_remote_track(kind),
            Input::Transport(state) => self.on_transport(state),
            Input::Timer(kind) => self.on_timer(kind),
        }
    }

    fn transition(session: &mut CallSession<I>, new_state: CallState) -> CallEvent<I> {
        let old_state = session.state;
        session.state = new_state;
        tracing::debug!(
            call_id = %session.call_id,
            old_state = ?old_state,
            new_state = ?new_state,
            "call state transition"
        );
        CallEvent::StateChanged {
            call_id: session.call_id,
            old_state,
            new_state,
        }
    }

    fn on_start(&mut self, peer: I, is_video: bool) -> Vec<Action<I>> {
        if self.session.as_ref().is_some_and(|s| s.state.is_active()) {
            tracing::warn!(peer = %peer, "start_call rejected, a call is already active");
            return Vec::new();
        }

        let mut actions = self.discard_inactive_session();
        self.last_error = None;
        self.generation += 1;

        let session = CallSession::outbound(peer.clone(), is_video);
        let call_id = session.call_id;
        tracing::info!(call_id = %call_id, peer = %peer, is_video, "starting outbound call");

        self.session = Some(session);
        actions.extend([
            Action::NewSession,
            Action::AcquireMedia {
                constraints: MediaConstraints::for_video(is_video),
            },
            Action::Arm(TimerKind::AnswerTimeout),
            Action::Emit(CallEvent::CallInitiated {
                call_id,
                callee: peer,
                is_video,
            }),
            Action::Emit(CallEvent::StateChanged {
                call_id,
                old_state: CallState::Idle,
                new_state: CallState::Calling,
            }),
        ]);
        actions
    }

    fn on_accept(&mut self) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            tracing::warn!("accept_call ignored, no active call");
            return Vec::new();
        };
        if session.state != CallState::Ringing {
            tracing::warn!(state = ?session.state, "accept_call ignored, call is not ringing");
            return Vec::new();
        }

        session.pending_incoming = None;
        let is_video = session.is_video;
        let changed = Self::transition(session, CallState::Connecting);
        vec![
            Action::Cancel(TimerKind::RingTimeout),
            Action::AcquireMedia {
                constraints: MediaConstraints::for_video(is_video),
            },
            Action::Emit(changed),
        ]
    }

    fn on_decline(&mut self) -> Vec<Action<I>> {
        match self.session.as_ref() {
            Some(s) if s.state == CallState::Ringing => self.end_session(EndReason::LocalDecline),
            Some(s) => {
                tracing::warn!(state = ?s.state, "decline_call ignored, call is not ringing");
                Vec::new()
            }
            None => {
                tracing::warn!("decline_call ignored, no active call");
                Vec::new()
            }
        }
    }

    fn on_hang_up(&mut self) -> Vec<Action<I>> {
        match self.session.as_ref() {
            Some(s) if s.state.is_active() => self.end_session(EndReason::LocalHangUp),
            Some(_) => {
                // Failed session waiting out its reset delay; reset it now.
                self.reset_to_idle()
            }
            None => {
                tracing::warn!("end_call ignored, no active call");
                Vec::new()
            }
        }
    }

    fn on_switch_call_type(&mut self) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            tracing::warn!("switch_call_type ignored, no active call");
            return Vec::new();
        };
        if session.state != CallState::Connected {
            tracing::warn!(state = ?session.state, "switch_call_type ignored, call not connected");
            return Vec::new();
        }

        session.is_video = !session.is_video;
        if session.is_video {
            session.local_muted.video = false;
        }
        tracing::info!(
            call_id = %session.call_id,
            is_video = session.is_video,
            "switching call type"
        );
        vec![Action::SetOutboundVideo(session.is_video)]
    }

    fn on_toggle_audio_mute(&mut self) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            tracing::warn!("toggle_audio_mute ignored, no active call");
            return Vec::new();
        };
        session.local_muted.audio = !session.local_muted.audio;
        vec![Action::SetAudioEnabled(!session.local_muted.audio)]
    }

    fn on_toggle_video_mute(&mut self) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            tracing::warn!("toggle_video_mute ignored, no active call");
            return Vec::new();
        };
        session.local_muted.video = !session.local_muted.video;
        vec![Action::SetVideoEnabled(!session.local_muted.video)]
    }

    fn on_toggle_remote_audio_mute(&mut self) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            tracing::warn!("toggle_remote_audio_mute ignored, no active call");
            return Vec::new();
        };
        session.remote_audio_muted = !session.remote_audio_muted;
        vec![Action::SetRemoteAudioEnabled(!session.remote_audio_muted)]
    }

    fn on_signal(&mut self, from: I, event: SignalEvent) -> Vec<Action<I>> {
        enum Route {
            NoSession,
            Active,
            Foreign,
        }

        let route = match self.session.as_ref() {
            Some(s) if s.state.is_active() => {
                if s.peer.unique_id() == from.unique_id() {
                    Route::Active
                } else {
                    Route::Foreign
                }
            }
            _ => Route::NoSession,
        };

        match route {
            Route::NoSession => match event {
                SignalEvent::CallRequest { is_video } => self.ring(from, is_video),
                other => {
                    tracing::debug!(
                        from = %from,
                        event = other.name(),
                        "ignoring signaling event, no active session"
                    );
                    Vec::new()
                }
            },
            Route::Foreign => match event {
                SignalEvent::CallRequest { .. } => {
                    // Busy: a 1:1 controller carries one session; decline so
                    // the caller does not wait out the full ring timeout.
                    tracing::info!(from = %from, "declining call request while busy");
                    vec![Action::Send {
                        to: from,
                        event: SignalEvent::CallDecline,
                    }]
                }
                other => {
                    tracing::debug!(
                        from = %from,
                        event = other.name(),
                        "ignoring signaling event from foreign peer"
                    );
                    Vec::new()
                }
            },
            Route::Active => self.on_peer_signal(event),
        }
    }

    fn ring(&mut self, from: I, is_video: bool) -> Vec<Action<I>> {
        let mut actions = self.discard_inactive_session();
        self.last_error = None;
        self.generation += 1;

        // The media session is created up front so an offer and candidates
        // buffered behind the call request have somewhere to land before the
        // user decides.
        let session = CallSession::inbound(from.clone(), is_video);
        let call_id = session.call_id;
        tracing::info!(call_id = %call_id, from = %from, is_video, "incoming call ringing");

        self.session = Some(session);
        actions.extend([
            Action::NewSession,
            Action::Arm(TimerKind::RingTimeout),
            Action::Emit(CallEvent::IncomingCall {
                call_id,
                from,
                is_video,
            }),
            Action::Emit(CallEvent::StateChanged {
                call_id,
                old_state: CallState::Idle,
                new_state: CallState::Ringing,
            }),
        ]);
        actions
    }

    fn on_peer_signal(&mut self, event: SignalEvent) -> Vec<Action<I>> {
        let state = self.state();
        match event {
            SignalEvent::CallRequest { .. } => {
                tracing::debug!("ignoring duplicate call request from tracked peer");
                Vec::new()
            }
            SignalEvent::Offer { sdp, .. } => {
                // Only honored while ringing: the matching call request has
                // already created the session, so an early offer cannot race
                // the ring decision.
                if state == CallState::Ringing {
                    self.apply_remote_description(sdp)
                } else {
                    tracing::debug!(state = ?state, "ignoring offer outside ringing state");
                    Vec::new()
                }
            }
            SignalEvent::Answer { sdp } => {
                if state == CallState::Calling {
                    self.apply_remote_description(sdp)
                } else {
                    tracing::debug!(state = ?state, "ignoring answer outside calling state");
                    Vec::new()
                }
            }
            SignalEvent::IceCandidate { candidate } => self.on_remote_candidate(candidate),
            SignalEvent::CallAccept => match self.session.as_mut() {
                Some(session) if session.state == CallState::Calling => {
                    let changed = Self::transition(session, CallState::Connecting);
                    vec![
                        Action::Cancel(TimerKind::AnswerTimeout),
                        Action::CreateAnswer,
                        Action::Emit(changed),
                    ]
                }
                _ => {
                    tracing::debug!(state = ?state, "ignoring call accept outside calling state");
                    Vec::new()
                }
            },
            SignalEvent::CallDecline => self.end_session(EndReason::RemoteDeclined),
            SignalEvent::CallEnd => self.end_session(EndReason::RemoteEnded),
            SignalEvent::CallFailed { call_id } => {
                tracing::warn!(call_id = %call_id, "peer reported call failure");
                self.last_error = Some("Call failed on the remote side".to_string());
                self.end_session(EndReason::RemoteFailed)
            }
            SignalEvent::CallTimeout { call_id } => {
                tracing::debug!(call_id = %call_id, "peer reported answer timeout");
                Vec::new()
            }
        }
    }

    fn apply_remote_description(&mut self, sdp: SessionDescription) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        session.candidates_ready = true;
        let mut actions = vec![Action::SetRemoteDescription(sdp)];
        actions.extend(
            session
                .queued_candidates
                .drain(..)
                .map(Action::AddIceCandidate),
        );
        actions
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidateInit) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.candidates_ready {
            vec![Action::AddIceCandidate(candidate)]
        } else {
            // Candidates can legitimately arrive before a description on
            // either side; they are flushed as soon as one lands.
            session.queued_candidates.push(candidate);
            Vec::new()
        }
    }

    fn on_media_acquired(&mut self) -> Vec<Action<I>> {
        let Some(session) = self.session.as_ref() else {
            tracing::debug!("media acquired for a superseded session, ignoring");
            return Vec::new();
        };
        match (session.outbound, session.state) {
            (true, CallState::Calling) => vec![
                Action::Send {
                    to: session.peer.clone(),
                    event: SignalEvent::CallRequest {
                        is_video: session.is_video,
                    },
                },
                Action::CreateOffer,
            ],
            (false, CallState::Connecting) => vec![Action::Send {
                to: session.peer.clone(),
                event: SignalEvent::CallAccept,
            }],
            _ => {
                tracing::debug!(state = ?session.state, "media acquired in unexpected state");
                Vec::new()
            }
        }
    }

    fn on_media_failed(&mut self, error: MediaError) -> Vec<Action<I>> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        match session.state {
            CallState::Calling | CallState::Connecting => {
                tracing::error!(call_id = %session.call_id, error = %error, "local media failed");
                self.fail_session(error.to_string())
            }
            state => {
                tracing::warn!(state = ?state, error = %error, "media failure in inactive state");
                Vec::new()
            }
        }
    }

    fn on_offer_ready(&mut self, sdp: SessionDescription) -> Vec<Action<I>> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        if session.outbound && session.state == CallState::Calling {
            vec![Action::Send {
                to: session.peer.clone(),
                event: SignalEvent::Offer {
                    sdp,
                    is_video: session.is_video,
                },
            }]
        } else {
            tracing::debug!(state = ?session.state, "discarding offer for a stale state");
            Vec::new()
        }
    }

    fn on_answer_ready(&mut self, sdp: SessionDescription) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.state == CallState::Connecting {
            // The local answer completes negotiation on this side, so any
            // candidates buffered while it was pending can flow now.
            session.candidates_ready = true;
            let mut actions = vec![Action::Send {
                to: session.peer.clone(),
                event: SignalEvent::Answer { sdp },
            }];
            actions.extend(
                session
                    .queued_candidates
                    .drain(..)
                    .map(Action::AddIceCandidate),
            );
            actions
        } else {
            tracing::debug!(state = ?session.state, "discarding answer for a stale state");
            Vec::new()
        }
    }

    fn on_negotiation_failed(&mut self, error: String) -> Vec<Action<I>> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        if session.state == CallState::Connected {
            // A failed ICE restart counts like a failed recovery cycle.
            self.handle_connected_outage(TransportState::Failed)
        } else {
            tracing::error!(call_id = %session.call_id, error = %error, "negotiation failed");
            self.fail_session(error)
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidateInit) -> Vec<Action<I>> {
        match self.session.as_ref() {
            Some(session) => vec![Action::Send {
                to: session.peer.clone(),
                event: SignalEvent::IceCandidate { candidate },
            }],
            None => Vec::new(),
        }
    }

    fn on_remote_track(&mut self, kind: TrackKind) -> Vec<Action<I>> {
        match self.session.as_ref() {
            Some(session) => vec![Action::Emit(CallEvent::RemoteTrack {
                call_id: session.call_id,
                kind,
            })],
            None => Vec::new(),
        }
    }

    fn on_transport(&mut self, transport: TransportState) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(transport = ?transport, "transport report without a session");
            return Vec::new();
        };
        session.transport_state = transport;
        let call_connected = session.state == CallState::Connected;

        match transport {
            TransportState::Connected => {
                let was_reconnecting = session.reconnect_pending;
                session.reconnect_pending = false;
                session.reconnect_attempts = 0;

                if session.state == CallState::Connected {
                    let mut actions = vec![Action::Cancel(TimerKind::ReconnectDelay)];
                    if was_reconnecting {
                        actions.push(Action::Emit(CallEvent::Notice {
                            call_id: session.call_id,
                            notice: CallNotice::Reconnected,
                        }));
                    }
                    return actions;
                }

                session.started_at.get_or_insert_with(Utc::now);
                session.pending_incoming = None;
                let call_id = session.call_id;
                let changed = Self::transition(session, CallState::Connected);
                vec![
                    Action::Cancel(TimerKind::AnswerTimeout),
                    Action::Cancel(TimerKind::RingTimeout),
                    Action::Cancel(TimerKind::ReconnectDelay),
                    Action::Arm(TimerKind::DurationTick),
                    Action::Emit(changed),
                    Action::Emit(CallEvent::ConnectionEstablished { call_id }),
                ]
            }
            TransportState::Disconnected | TransportState::Failed if call_connected => {
                self.handle_connected_outage(transport)
            }
            state => {
                tracing::debug!(transport = ?state, call_state = ?self.state(), "transport state recorded");
                Vec::new()
            }
        }
    }

    /// One step of the bounded reconnection loop (§ connected transport
    /// degradation). Each scheduled recovery consumes one attempt; the
    /// transport reconnecting resets the count to zero.
    fn handle_connected_outage(&mut self, transport: TransportState) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        if transport == TransportState::Disconnected && session.reconnect_pending {
            // Already mid-cycle; wait for the restart to resolve.
            return Vec::new();
        }

        let next = session.reconnect_attempts + 1;
        if next > MAX_RECONNECT_ATTEMPTS {
            tracing::error!(
                call_id = %session.call_id,
                attempts = session.reconnect_attempts,
                "reconnection attempts exhausted"
            );
            return self.fail_session("Connection lost".to_string());
        }

        session.reconnect_attempts = next;
        session.reconnect_pending = true;
        tracing::warn!(
            call_id = %session.call_id,
            attempt = next,
            max = MAX_RECONNECT_ATTEMPTS,
            transport = ?transport,
            "transport degraded, scheduling reconnection"
        );
        vec![
            Action::Emit(CallEvent::Notice {
                call_id: session.call_id,
                notice: CallNotice::Reconnecting {
                    attempt: next,
                    max: MAX_RECONNECT_ATTEMPTS,
                },
            }),
            Action::Arm(TimerKind::ReconnectDelay),
        ]
    }

    fn on_timer(&mut self, kind: TimerKind) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(timer = ?kind, "timer fired without a session");
            return Vec::new();
        };
        match kind {
            TimerKind::AnswerTimeout => {
                if session.state == CallState::Calling {
                    // Non-fatal: the peer may still answer late. The call
                    // stays live until the user ends it.
                    tracing::info!(call_id = %session.call_id, "call not answered within timeout");
                    vec![
                        Action::Emit(CallEvent::Notice {
                            call_id: session.call_id,
                            notice: CallNotice::NotAnswered,
                        }),
                        Action::Send {
                            to: session.peer.clone(),
                            event: SignalEvent::CallTimeout {
                                call_id: session.call_id,
                            },
                        },
                    ]
                } else {
                    Vec::new()
                }
            }
            TimerKind::RingTimeout => {
                if session.state == CallState::Ringing {
                    tracing::info!(call_id = %session.call_id, "incoming call timed out, auto-declining");
                    self.end_session(EndReason::RingTimedOut)
                } else {
                    Vec::new()
                }
            }
            TimerKind::ReconnectDelay => {
                if session.state == CallState::Connected && session.reconnect_pending {
                    tracing::info!(
                        call_id = %session.call_id,
                        attempt = session.reconnect_attempts,
                        "requesting network-path restart"
                    );
                    vec![Action::RestartIce]
                } else {
                    Vec::new()
                }
            }
            TimerKind::DurationTick => {
                if session.state == CallState::Connected {
                    session.duration_seconds += 1;
                }
                Vec::new()
            }
            TimerKind::FailedReset => {
                if session.state == CallState::Failed {
                    self.reset_to_idle()
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Tear the session down and reset to idle. Cleanup is unconditional:
    /// timers cancelled, media closed, peer notified where the reason calls
    /// for it.
    fn end_session(&mut self, reason: EndReason) -> Vec<Action<I>> {
        let Some(session) = self.session.take() else {
            return Vec::new();
        };
        self.generation += 1;

        let old_state = session.state;
        tracing::info!(
            call_id = %session.call_id,
            old_state = ?old_state,
            reason = ?reason,
            "ending call session"
        );

        let mut actions = vec![Action::CancelAll];
        let notify = match reason {
            EndReason::LocalHangUp => Some(SignalEvent::CallEnd),
            EndReason::LocalDecline | EndReason::RingTimedOut => Some(SignalEvent::CallDecline),
            EndReason::RemoteEnded | EndReason::RemoteDeclined | EndReason::RemoteFailed => None,
        };
        if let Some(event) = notify {
            actions.push(Action::Send {
                to: session.peer.clone(),
                event,
            });
        }
        actions.push(Action::CloseSession);
        actions.push(Action::Emit(CallEvent::StateChanged {
            call_id: session.call_id,
            old_state,
            new_state: CallState::Ended,
        }));
        if reason == EndReason::RemoteFailed {
            actions.push(Action::Emit(CallEvent::CallFailed {
                call_id: session.call_id,
                error: self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Call failed".to_string()),
            }));
        } else {
            actions.push(Action::Emit(CallEvent::CallEnded {
                call_id: session.call_id,
            }));
        }
        actions
    }

    /// Move the session to `Failed`, notify the peer, tear down media, and
    /// arm the delayed reset to idle.
    fn fail_session(&mut self, error: String) -> Vec<Action<I>> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        self.last_error = Some(error.clone());

        let call_id = session.call_id;
        let peer = session.peer.clone();
        session.pending_incoming = None;
        session.reconnect_pending = false;
        let changed = Self::transition(session, CallState::Failed);

        vec![
            Action::CancelAll,
            Action::Send {
                to: peer,
                event: SignalEvent::CallFailed { call_id },
            },
            Action::CloseSession,
            Action::Emit(changed),
            Action::Emit(CallEvent::CallFailed { call_id, error }),
            Action::Arm(TimerKind::FailedReset),
        ]
    }

    fn reset_to_idle(&mut self) -> Vec<Action<I>> {
        let Some(session) = self.session.take() else {
            return Vec::new();
        };
        self.generation += 1;
        let old_state = session.state;
        tracing::debug!(call_id = %session.call_id, old_state = ?old_state, "resetting to idle");
        vec![
            Action::CancelAll,
            Action::CloseSession,
            Action::Emit(CallEvent::StateChanged {
                call_id: session.call_id,
                old_state,
                new_state: CallState::Idle,
            }),
        ]
    }

    /// Drop a lingering terminal session (e.g. `Failed` waiting out its
    /// reset delay) before a new attempt replaces it.
    fn discard_inactive_session(&mut self) -> Vec<Action<I>> {
        if self.session.take().is_some() {
            self.generation += 1;
            vec![Action::CancelAll, Action::CloseSession]
        } else {
            Vec::new()
        }
    }
}
