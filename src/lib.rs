//! Peercall - 1:1 call session management over pluggable signaling
//!
//! This library manages the full lifecycle of a peer-to-peer audio or video
//! call: outbound and inbound call setup, offer/answer and candidate
//! exchange over an application-provided signaling channel, bounded
//! reconnection when the media transport degrades, and orderly teardown.
//! The media engine itself (capture, encoding, transport) is plugged in
//! behind the [`MediaSession`] trait. It features:
//!
//! - **Single-task engine**: One event loop owns the call state machine, so
//!   transitions are atomic without locks
//! - **Pluggable signaling**: Any ordered message channel works via the
//!   [`SignalingChannel`] trait
//! - **Bounded reconnection**: Transient transport outages trigger up to
//!   five recovery attempts before the call fails
//! - **Observable state**: A watch channel publishes a consistent snapshot
//!   after every transition, plus a broadcast stream of call events
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall::{CallController, PeerIdentityString};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     signaling: Arc<impl peercall::SignalingChannel<PeerId = PeerIdentityString>>,
//! #     media: Arc<dyn peercall::MediaFactory>,
//! # ) -> anyhow::Result<()> {
//! let controller = CallController::new(signaling, media, PeerIdentityString::new("alice"));
//! controller.start()?;
//!
//! // Start a video call and watch it progress
//! let mut state = controller.watch_state()?;
//! controller.start_call(PeerIdentityString::new("bob"), true)?;
//! state.changed().await?;
//! println!("call state: {:?}", state.borrow().state);
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and constants
pub mod types;

/// Call state machine
pub mod call;

/// Call controller facade
pub mod controller;

/// Peer identity abstraction
pub mod identity;

/// Media engine abstraction
pub mod media;

/// Signaling channel abstraction and wire events
pub mod signaling;

/// Call timers
pub mod timer;

mod orchestrator;

// Re-export main types at crate root
pub use call::{CallError, CallMachine, Input as CallInput};
pub use controller::CallController;
pub use identity::{PeerIdentity, PeerIdentityString};
pub use media::{
    IceCandidateInit, MediaError, MediaEvent, MediaFactory, MediaSession, SdpKind,
    SessionDescription,
};
pub use signaling::{InboundSignal, SignalEvent, SignalingChannel, SignalingError};
pub use types::{
    CallEvent, CallId, CallNotice, CallSnapshot, CallState, LocalMute, MediaConstraints,
    PendingIncoming, TrackKind, TransportState, ANSWER_TIMEOUT, DURATION_TICK,
    FAILED_RESET_DELAY, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY, RING_TIMEOUT,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::CallError;
    pub use crate::controller::CallController;
    pub use crate::identity::{PeerIdentity, PeerIdentityString};
    pub use crate::media::{MediaFactory, MediaSession};
    pub use crate::signaling::{SignalEvent, SignalingChannel};
    pub use crate::types::{
        CallEvent, CallId, CallSnapshot, CallState, MediaConstraints, TransportState,
    };
}
