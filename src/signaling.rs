//! Signaling wire format and channel contract
//!
//! The signaling channel is a named-event, peer-addressed, best-effort
//! message path between exactly two logged-in users. Delivery is only
//! guaranteed while both peers are online; the call machinery observes
//! delivery failure indirectly through timeouts, never through acks.

use crate::identity::PeerIdentity;
use crate::media::{IceCandidateInit, SessionDescription};
use crate::types::CallId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The channel is gone and will not deliver further events
    #[error("Signaling channel closed")]
    Closed,

    /// Transient transport failure
    #[error("Signaling transport error: {0}")]
    Transport(String),
}

/// Named signaling events exchanged during call setup and teardown
///
/// The serialized `type` tag is the on-wire event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEvent {
    /// Ask the peer to ring for an inbound call
    CallRequest {
        /// Whether the caller wants video
        is_video: bool,
    },
    /// Session description offer
    Offer {
        /// The description
        sdp: SessionDescription,
        /// Whether the call carries video
        is_video: bool,
    },
    /// Session description answer
    Answer {
        /// The description
        sdp: SessionDescription,
    },
    /// One locally discovered network-path candidate
    IceCandidate {
        /// The candidate
        candidate: IceCandidateInit,
    },
    /// The callee accepted the call
    CallAccept,
    /// The callee declined the call
    CallDecline,
    /// Either side hung up
    CallEnd,
    /// The caller's answer timeout expired (diagnostic, non-terminal)
    CallTimeout {
        /// Which call attempt timed out
        call_id: CallId,
    },
    /// The sender's call attempt failed fatally
    CallFailed {
        /// Which call attempt failed
        call_id: CallId,
    },
}

impl SignalEvent {
    /// The on-wire event name, as used in the serialized `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallRequest { .. } => "call_request",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::CallAccept => "call_accept",
            Self::CallDecline => "call_decline",
            Self::CallEnd => "call_end",
            Self::CallTimeout { .. } => "call_timeout",
            Self::CallFailed { .. } => "call_failed",
        }
    }

    /// Whether this event terminates the peer's session when received
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CallDecline | Self::CallEnd | Self::CallFailed { .. })
    }
}

/// An inbound signaling event with its sender
#[derive(Debug, Clone)]
pub struct InboundSignal<I: PeerIdentity> {
    /// Who sent the event
    pub from: I,
    /// The event
    pub event: SignalEvent,
}

/// Best-effort named-event channel between two identified peers
///
/// Implement this for your concrete transport (websocket, socket.io-style
/// hub, in-process router for tests). Inbound events from a given peer must
/// be yielded in receipt order; no other ordering or delivery guarantee is
/// assumed.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Peer identifier type
    type PeerId: PeerIdentity;

    /// Send an event to a peer, fire-and-forget
    ///
    /// # Errors
    ///
    /// Returns error if the channel rejects the send; silent drops (peer
    /// offline) are not reported.
    async fn send(&self, to: &Self::PeerId, event: SignalEvent) -> Result<(), SignalingError>;

    /// Receive the next inbound event
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Closed`] once the channel is permanently
    /// gone; transient failures surface as [`SignalingError::Transport`].
    async fn recv(&self) -> Result<InboundSignal<Self::PeerId>, SignalingError>;
}
