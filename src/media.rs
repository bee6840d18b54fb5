//! Media session handle contract
//!
//! The media transport primitive (a WebRTC-style peer connection plus local
//! capture) is an external collaborator. This module defines the contract
//! the call machinery consumes: offer/answer exchange, network-path
//! candidates, track-level mute control and transport state reporting. The
//! crate never reimplements the primitive itself.

use crate::types::{MediaConstraints, TrackKind, TransportState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Media session errors
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// Camera or microphone access was denied
    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    /// No usable capture device
    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Offer/answer/candidate processing failed
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// The session was already closed
    #[error("Media session closed")]
    Closed,
}

impl MediaError {
    /// Whether this error is a capture permission/device failure, fatal to
    /// the current call attempt
    pub fn is_capture_failure(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::DeviceUnavailable(_)
        )
    }
}

/// Which half of the offer/answer exchange a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer from the session initiator
    Offer,
    /// Answer responding to an offer
    Answer,
}

/// A session description exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// Raw SDP payload
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A discovered network-path candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    /// Candidate string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u32>,
}

/// Events emitted by a media session
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// The transport moved to a new lifecycle state
    TransportStateChanged(TransportState),
    /// A local network-path candidate was discovered
    IceCandidate(IceCandidateInit),
    /// A remote media track arrived
    RemoteTrack(TrackKind),
}

/// Handle to one media session, exclusively owned by one call attempt
///
/// Created fresh for every call attempt and closed unconditionally when the
/// session resets, including on every error path.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Acquire local capture and attach tracks per the constraints
    ///
    /// # Errors
    ///
    /// Returns a capture failure if permission is denied or no device is
    /// available.
    async fn acquire_local_media(&self, constraints: MediaConstraints) -> Result<(), MediaError>;

    /// Create a local offer
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot produce a description.
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Create a local answer
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot produce a description.
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    /// Apply a locally created description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected.
    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), MediaError>;

    /// Apply the peer's description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected.
    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), MediaError>;

    /// Apply a network-path candidate received from the peer
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is malformed.
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), MediaError>;

    /// Restart network-path negotiation on the existing session
    ///
    /// # Errors
    ///
    /// Returns error if the restart cannot be requested.
    async fn restart_ice(&self) -> Result<(), MediaError>;

    /// Add, replace or remove the outbound video track without restarting
    /// the negotiation handshake
    ///
    /// # Errors
    ///
    /// Returns error if capture for the new track fails.
    async fn set_outbound_video(&self, enabled: bool) -> Result<(), MediaError>;

    /// Enable or disable the outbound audio track
    fn set_audio_enabled(&self, enabled: bool);

    /// Enable or disable the outbound video track
    fn set_video_enabled(&self, enabled: bool);

    /// Enable or disable the inbound audio track (local-only silencing)
    fn set_remote_audio_enabled(&self, enabled: bool);

    /// Stop capture and close the transport
    async fn close(&self);
}

/// Factory producing one fresh media session per call attempt
///
/// The returned receiver carries that session's events; it is dropped
/// together with the session when the call resets.
pub trait MediaFactory: Send + Sync {
    /// Create a new media session and its event stream
    ///
    /// # Errors
    ///
    /// Returns error if the underlying engine cannot allocate a session.
    fn create(
        &self,
    ) -> Result<(Arc<dyn MediaSession>, mpsc::UnboundedReceiver<MediaEvent>), MediaError>;
}
