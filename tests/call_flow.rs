//! End-to-end call flows between two controllers wired through an
//! in-process signaling hub with mock media engines.

mod common;

use common::{settle, test_peer, wait_for, wait_for_state, SignalingHub, TestPeer};
use peercall::{CallError, CallEvent, CallNotice, CallState, PeerIdentityString, TransportState};
use std::time::Duration;

/// Drive a pair to a connected audio call
async fn connect_pair(alice: &TestPeer, bob: &TestPeer) {
    alice
        .controller
        .start_call(bob.id(), false)
        .expect("start call");
    wait_for_state(&bob.state, CallState::Ringing).await;
    bob.controller.accept_call().expect("accept call");
    wait_for_state(&alice.state, CallState::Connecting).await;

    alice.media.transport(TransportState::Connected);
    bob.media.transport(TransportState::Connected);
    wait_for_state(&alice.state, CallState::Connected).await;
    wait_for_state(&bob.state, CallState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn happy_path_audio_call() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");

    alice
        .controller
        .start_call(bob.id(), false)
        .expect("start call");
    wait_for_state(&alice.state, CallState::Calling).await;
    wait_for(&bob.state, |s| {
        s.pending_incoming
            .as_ref()
            .is_some_and(|p| p.from == alice.id() && !p.is_video)
    })
    .await;
    assert_eq!(bob.state.borrow().state, CallState::Ringing);

    bob.controller.accept_call().expect("accept call");
    wait_for_state(&alice.state, CallState::Connecting).await;
    wait_for_state(&bob.state, CallState::Connecting).await;

    // The callee applied the caller's offer
    assert!(bob
        .media
        .calls()
        .iter()
        .any(|c| c == "set_remote_description"));

    alice.media.transport(TransportState::Connected);
    bob.media.transport(TransportState::Connected);
    wait_for_state(&alice.state, CallState::Connected).await;
    wait_for_state(&bob.state, CallState::Connected).await;

    let snap = alice.state.borrow().clone();
    assert!(snap.started_at.is_some());
    assert_eq!(snap.reconnect_attempts, 0);

    // Duration accumulates while connected
    wait_for(&alice.state, |s| s.duration_seconds >= 3).await;

    let wire: Vec<&'static str> = hub.sent_log().iter().map(|(_, _, name)| *name).collect();
    for expected in ["call_request", "offer", "call_accept", "answer"] {
        assert!(wire.contains(&expected), "missing {expected} in {wire:?}");
    }

    alice.controller.end_call().expect("end call");
    wait_for_state(&alice.state, CallState::Idle).await;
    wait_for_state(&bob.state, CallState::Idle).await;
    assert_eq!(hub.sent_count("call_end"), 1);
    assert!(alice.media.closes() >= 1);
    assert!(bob.media.closes() >= 1);
}

#[tokio::test(start_paused = true)]
async fn video_flag_propagates_to_callee() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");

    alice
        .controller
        .start_call(bob.id(), true)
        .expect("start call");
    wait_for(&bob.state, |s| {
        s.pending_incoming.as_ref().is_some_and(|p| p.is_video)
    })
    .await;
    assert!(bob.state.borrow().is_video);
    assert!(alice.state.borrow().is_video);

    // The caller captured with video constraints
    assert!(alice.media.calls().iter().any(|c| c == "acquire(video=true)"));
}

#[tokio::test(start_paused = true)]
async fn declined_call_resets_both_sides() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");

    alice
        .controller
        .start_call(bob.id(), false)
        .expect("start call");
    wait_for_state(&bob.state, CallState::Ringing).await;

    bob.controller.decline_call().expect("decline call");
    wait_for_state(&bob.state, CallState::Idle).await;
    wait_for_state(&alice.state, CallState::Idle).await;

    assert_eq!(hub.sent_count("call_decline"), 1);
    assert!(alice.state.borrow().call_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn unanswered_ring_declines_after_timeout() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");

    alice
        .controller
        .start_call(bob.id(), false)
        .expect("start call");
    wait_for_state(&bob.state, CallState::Ringing).await;

    // Nobody touches bob; his ring timer declines for him.
    wait_for_state(&bob.state, CallState::Idle).await;
    wait_for_state(&alice.state, CallState::Idle).await;
    assert_eq!(hub.sent_count("call_decline"), 1);
}

#[tokio::test(start_paused = true)]
async fn answer_timeout_is_a_notice_not_an_end() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    // "ghost" has no endpoint; sends to it fail silently at the hub.

    let mut events = alice.controller.subscribe_events().expect("events");
    alice
        .controller
        .start_call(PeerIdentityString::new("ghost"), false)
        .expect("start call");
    wait_for_state(&alice.state, CallState::Calling).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;

    assert_eq!(alice.state.borrow().state, CallState::Calling);

    let mut saw_notice = false;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            CallEvent::Notice {
                notice: CallNotice::NotAnswered,
                ..
            }
        ) {
            saw_notice = true;
        }
    }
    assert!(saw_notice, "expected a not-answered notice");

    alice.controller.end_call().expect("end call");
    wait_for_state(&alice.state, CallState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn caller_cancel_stops_the_ring() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");

    alice
        .controller
        .start_call(bob.id(), false)
        .expect("start call");
    wait_for_state(&bob.state, CallState::Ringing).await;

    alice.controller.end_call().expect("end call");
    wait_for_state(&alice.state, CallState::Idle).await;
    wait_for_state(&bob.state, CallState::Idle).await;
    assert!(bob.state.borrow().pending_incoming.is_none());
}

#[tokio::test(start_paused = true)]
async fn second_caller_gets_busy_decline() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");
    let carol = test_peer(&hub, "carol");

    connect_pair(&alice, &bob).await;

    carol
        .controller
        .start_call(bob.id(), false)
        .expect("start call");
    wait_for_state(&carol.state, CallState::Idle).await;

    // Bob never rang for carol and kept his call
    assert_eq!(bob.state.borrow().state, CallState::Connected);
    assert_eq!(
        bob.state.borrow().peer.clone().map(|p| p.to_string()),
        Some("alice".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn mute_and_call_type_controls_reach_media() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");
    connect_pair(&alice, &bob).await;

    alice.controller.toggle_audio_mute().expect("mute");
    wait_for(&alice.state, |s| s.local_muted.audio).await;
    assert!(alice
        .media
        .calls()
        .iter()
        .any(|c| c == "set_audio_enabled(false)"));

    alice.controller.toggle_audio_mute().expect("unmute");
    wait_for(&alice.state, |s| !s.local_muted.audio).await;

    alice
        .controller
        .toggle_remote_audio_mute()
        .expect("remote mute");
    wait_for(&alice.state, |s| s.remote_audio_muted).await;
    assert!(alice
        .media
        .calls()
        .iter()
        .any(|c| c == "set_remote_audio_enabled(false)"));

    alice.controller.switch_call_type().expect("switch");
    wait_for(&alice.state, |s| s.is_video).await;
    assert!(alice
        .media
        .calls()
        .iter()
        .any(|c| c == "set_outbound_video(true)"));
}

#[tokio::test(start_paused = true)]
async fn capture_failure_fails_then_resets() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");

    alice.media.set_fail_acquire(true);
    alice
        .controller
        .start_call(bob.id(), true)
        .expect("start call");

    wait_for_state(&alice.state, CallState::Failed).await;
    assert!(alice.state.borrow().call_error.is_some());

    // The failed attempt clears itself after the grace delay
    wait_for_state(&alice.state, CallState::Idle).await;
    assert!(alice.state.borrow().call_error.is_some());

    // And a fresh attempt works once capture recovers
    alice.media.set_fail_acquire(false);
    alice
        .controller
        .start_call(bob.id(), false)
        .expect("second attempt");
    wait_for_state(&bob.state, CallState::Ringing).await;
    assert!(alice.state.borrow().call_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn fail_fast_guards_on_start_call() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");

    assert!(matches!(
        alice
            .controller
            .start_call(PeerIdentityString::new(""), false),
        Err(CallError::InvalidPeer(_))
    ));
    assert!(matches!(
        alice.controller.start_call(alice.id(), false),
        Err(CallError::InvalidPeer(_))
    ));

    alice
        .controller
        .start_call(bob.id(), false)
        .expect("start call");
    wait_for_state(&alice.state, CallState::Calling).await;
    assert!(matches!(
        alice.controller.start_call(bob.id(), false),
        Err(CallError::CallInProgress)
    ));
}

#[tokio::test(start_paused = true)]
async fn snapshot_reads_track_the_call() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");

    let idle = alice.controller.snapshot().expect("snapshot");
    assert_eq!(idle.state, CallState::Idle);
    assert!(idle.peer.is_none());

    connect_pair(&alice, &bob).await;

    let connected = alice.controller.snapshot().expect("snapshot");
    assert_eq!(connected.state, CallState::Connected);
    assert_eq!(connected.peer, Some(bob.id()));
}

#[tokio::test(start_paused = true)]
async fn superseded_session_timers_stay_silent() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");

    alice
        .controller
        .start_call(bob.id(), false)
        .expect("first call");
    wait_for_state(&alice.state, CallState::Calling).await;
    alice.controller.end_call().expect("cancel");
    wait_for_state(&alice.state, CallState::Idle).await;
    wait_for_state(&bob.state, CallState::Idle).await;

    alice
        .controller
        .start_call(bob.id(), false)
        .expect("second call");
    wait_for_state(&bob.state, CallState::Ringing).await;

    // Past both sessions' answer timeouts: only the live session's timer
    // may have produced a diagnostic.
    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;
    assert!(hub.sent_count("call_timeout") <= 1);
}

#[tokio::test(start_paused = true)]
async fn stop_hangs_up_and_rejects_further_commands() {
    let hub = SignalingHub::new();
    let alice = test_peer(&hub, "alice");
    let bob = test_peer(&hub, "bob");
    connect_pair(&alice, &bob).await;

    alice.controller.stop().await;
    assert!(!alice.controller.is_started());
    wait_for_state(&bob.state, CallState::Idle).await;
    assert_eq!(hub.sent_count("call_end"), 1);

    assert!(matches!(
        alice.controller.start_call(bob.id(), false),
        Err(CallError::NotStarted)
    ));
    assert!(matches!(
        alice.controller.end_call(),
        Err(CallError::NotStarted)
    ));

    // Stop is idempotent
    alice.controller.stop().await;
}
