//! Call types and data structures

use crate::identity::PeerIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Maximum consecutive failed reconnection attempts before a call is failed
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// How long the caller waits for an answer before surfacing a notice
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

/// How long an unanswered incoming call rings before auto-declining
pub const RING_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before requesting an ICE restart after the transport degrades
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Interval of the call-duration ticker while connected
pub const DURATION_TICK: Duration = Duration::from_secs(1);

/// Grace period a failed session stays visible before resetting to idle
pub const FAILED_RESET_DELAY: Duration = Duration::from_secs(2);

/// Unique identifier for a call attempt
///
/// Locally generated; unique enough to disambiguate stale timeout and
/// failure events, not guaranteed globally unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No active call
    Idle,
    /// Outbound call waiting for the peer to accept
    Calling,
    /// Inbound call waiting for the local user to accept or decline
    Ringing,
    /// Negotiating the media transport
    Connecting,
    /// Call is live
    Connected,
    /// Call terminated normally
    Ended,
    /// Call terminated by an error
    Failed,
}

impl CallState {
    /// Whether a call attempt is in progress
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ended | Self::Failed)
    }
}

/// Lifecycle state of the underlying media transport
///
/// Reported by the media session handle; observed by the call state
/// machine, never set directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Transport created, negotiation not started
    New,
    /// Negotiating a network path
    Connecting,
    /// Media is flowing
    Connected,
    /// Network path lost, possibly recoverable
    Disconnected,
    /// Network path negotiation failed
    Failed,
    /// Transport torn down
    Closed,
}

impl Default for TransportState {
    fn default() -> Self {
        Self::New
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio capture
    pub audio: bool,
    /// Enable video capture
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// Constraints for a call with the given video flag
    pub fn for_video(is_video: bool) -> Self {
        Self {
            audio: true,
            video: is_video,
        }
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }
}

/// Local track mute flags, independent of call state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMute {
    /// Outbound audio track disabled
    pub audio: bool,
    /// Outbound video track disabled
    pub video: bool,
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// An inbound call waiting for the local user's decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIncoming<I: PeerIdentity> {
    /// Who is calling
    pub from: I,
    /// Whether the caller requested video
    pub is_video: bool,
}

/// Read-only view of the call session for rendering
///
/// Published through a watch channel after every state-machine input, so
/// observers always see a consistent snapshot rather than intermediate
/// mutation.
#[derive(Debug, Clone)]
pub struct CallSnapshot<I: PeerIdentity> {
    /// Identifier of the current call attempt, if any
    pub call_id: Option<CallId>,
    /// The remote participant, if a session exists
    pub peer: Option<I>,
    /// Current call state
    pub state: CallState,
    /// Current transport state as last reported
    pub transport_state: TransportState,
    /// Whether the call carries video
    pub is_video: bool,
    /// Reconnection attempts consumed for the current outage
    pub reconnect_attempts: u32,
    /// When the transport first connected
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds since the call connected
    pub duration_seconds: u64,
    /// Local track mute flags
    pub local_muted: LocalMute,
    /// Inbound audio silenced locally
    pub remote_audio_muted: bool,
    /// Inbound call awaiting accept/decline
    pub pending_incoming: Option<PendingIncoming<I>>,
    /// Human-readable error from the last failed attempt
    pub call_error: Option<String>,
}

impl<I: PeerIdentity> CallSnapshot<I> {
    /// Snapshot of an idle controller
    pub fn idle() -> Self {
        Self {
            call_id: None,
            peer: None,
            state: CallState::Idle,
            transport_state: TransportState::New,
            is_video: false,
            reconnect_attempts: 0,
            started_at: None,
            duration_seconds: 0,
            local_muted: LocalMute::default(),
            remote_audio_muted: false,
            pending_incoming: None,
            call_error: None,
        }
    }
}

impl<I: PeerIdentity> Default for CallSnapshot<I> {
    fn default() -> Self {
        Self::idle()
    }
}

/// Transient user-facing notices that do not change the call state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    /// The peer has not answered within the timeout; the call stays live
    NotAnswered,
    /// A reconnection attempt is in progress
    Reconnecting {
        /// Current attempt, 1-based
        attempt: u32,
        /// Maximum attempts before the call fails
        max: u32,
    },
    /// The transport recovered after a reconnection attempt
    Reconnected,
}

/// Call event for observers
#[derive(Debug, Clone)]
pub enum CallEvent<I: PeerIdentity> {
    /// An inbound call is ringing
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        from: I,
        /// Whether the caller requested video
        is_video: bool,
    },
    /// An outbound call was started
    CallInitiated {
        /// Call identifier
        call_id: CallId,
        /// Who is being called
        callee: I,
        /// Whether video was requested
        is_video: bool,
    },
    /// The call state changed
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        old_state: CallState,
        /// New state
        new_state: CallState,
    },
    /// The media transport connected
    ConnectionEstablished {
        /// Call identifier
        call_id: CallId,
    },
    /// A remote media track arrived
    RemoteTrack {
        /// Call identifier
        call_id: CallId,
        /// Track kind
        kind: TrackKind,
    },
    /// A transient notice for the UI layer
    Notice {
        /// Call identifier
        call_id: CallId,
        /// The notice
        notice: CallNotice,
    },
    /// The call ended normally
    CallEnded {
        /// Call identifier
        call_id: CallId,
    },
    /// The call failed
    CallFailed {
        /// Call identifier
        call_id: CallId,
        /// Error description
        error: String,
    },
}
