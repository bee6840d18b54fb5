//! In-process test doubles: a signaling hub routing events between named
//! endpoints, and a controllable mock media engine.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peercall::{
    CallController, CallSnapshot, CallState, IceCandidateInit, InboundSignal, MediaConstraints,
    MediaError, MediaEvent, MediaFactory, MediaSession, PeerIdentity, PeerIdentityString,
    SessionDescription, SignalEvent, SignalingChannel, SignalingError, TransportState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Install a per-test log subscriber honoring RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory signaling router between named endpoints
pub struct SignalingHub {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<InboundSignal<PeerIdentityString>>>>,
    log: Mutex<Vec<(String, String, &'static str)>>,
}

impl SignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Register an endpoint for `name`
    pub fn endpoint(self: &Arc<Self>, name: &str) -> Arc<HubEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(name.to_string(), tx);
        Arc::new(HubEndpoint {
            hub: Arc::clone(self),
            local: PeerIdentityString::new(name),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Drop the route for `name`; further sends to it fail as transport errors
    pub fn disconnect(&self, name: &str) {
        self.routes.lock().remove(name);
    }

    /// (from, to, event name) tuples for every send attempted through the hub
    pub fn sent_log(&self) -> Vec<(String, String, &'static str)> {
        self.log.lock().clone()
    }

    /// Count of sends of a given event name, any direction
    pub fn sent_count(&self, event_name: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(_, _, name)| *name == event_name)
            .count()
    }
}

/// One peer's view of the hub
pub struct HubEndpoint {
    hub: Arc<SignalingHub>,
    local: PeerIdentityString,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundSignal<PeerIdentityString>>>,
}

#[async_trait]
impl SignalingChannel for HubEndpoint {
    type PeerId = PeerIdentityString;

    async fn send(
        &self,
        to: &PeerIdentityString,
        event: SignalEvent,
    ) -> Result<(), SignalingError> {
        self.hub.log.lock().push((
            self.local.to_string_repr(),
            to.to_string_repr(),
            event.name(),
        ));
        let tx = self
            .hub
            .routes
            .lock()
            .get(&to.to_string_repr())
            .cloned()
            .ok_or_else(|| SignalingError::Transport(format!("no route to {to}")))?;
        tx.send(InboundSignal {
            from: self.local.clone(),
            event,
        })
        .map_err(|_| SignalingError::Transport("peer receiver gone".to_string()))
    }

    async fn recv(&self) -> Result<InboundSignal<PeerIdentityString>, SignalingError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(SignalingError::Closed)
    }
}

#[derive(Default)]
struct MockMediaInner {
    fail_acquire: AtomicBool,
    sessions_created: AtomicUsize,
    restarts: AtomicUsize,
    closes: AtomicUsize,
    calls: Mutex<Vec<String>>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<MediaEvent>>>,
}

/// Controllable mock media engine shared between a factory and its sessions
#[derive(Clone, Default)]
pub struct MockMedia {
    inner: Arc<MockMediaInner>,
}

impl MockMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn MediaFactory> {
        Arc::new(MockFactory {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Make the next acquire_local_media call fail
    pub fn set_fail_acquire(&self, fail: bool) {
        self.inner.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Inject a transport state report into the latest session's stream
    pub fn transport(&self, state: TransportState) {
        self.emit(MediaEvent::TransportStateChanged(state));
    }

    /// Inject an arbitrary media event into the latest session's stream
    pub fn emit(&self, event: MediaEvent) {
        let guard = self.inner.event_tx.lock();
        let tx = guard
            .as_ref()
            .expect("no media session was created");
        tx.send(event).expect("media event receiver dropped");
    }

    pub fn sessions_created(&self) -> usize {
        self.inner.sessions_created.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.inner.restarts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Method-call log across all sessions, in call order
    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().clone()
    }
}

struct MockFactory {
    inner: Arc<MockMediaInner>,
}

impl MediaFactory for MockFactory {
    fn create(&self) -> Result<(Arc<dyn MediaSession>, mpsc::UnboundedReceiver<MediaEvent>), MediaError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.sessions_created.fetch_add(1, Ordering::SeqCst);
        *self.inner.event_tx.lock() = Some(tx);
        Ok((
            Arc::new(MockSession {
                inner: Arc::clone(&self.inner),
            }),
            rx,
        ))
    }
}

struct MockSession {
    inner: Arc<MockMediaInner>,
}

impl MockSession {
    fn log(&self, call: impl Into<String>) {
        self.inner.calls.lock().push(call.into());
    }
}

#[async_trait]
impl MediaSession for MockSession {
    async fn acquire_local_media(&self, constraints: MediaConstraints) -> Result<(), MediaError> {
        self.log(format!("acquire(video={})", constraints.video));
        if self.inner.fail_acquire.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("mock capture".to_string()));
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.log("create_offer");
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.log("create_answer");
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(&self, _sdp: SessionDescription) -> Result<(), MediaError> {
        self.log("set_local_description");
        Ok(())
    }

    async fn set_remote_description(&self, _sdp: SessionDescription) -> Result<(), MediaError> {
        self.log("set_remote_description");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), MediaError> {
        self.log(format!("add_candidate({})", candidate.candidate));
        Ok(())
    }

    async fn restart_ice(&self) -> Result<(), MediaError> {
        self.log("restart_ice");
        self.inner.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_outbound_video(&self, enabled: bool) -> Result<(), MediaError> {
        self.log(format!("set_outbound_video({enabled})"));
        Ok(())
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.log(format!("set_audio_enabled({enabled})"));
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.log(format!("set_video_enabled({enabled})"));
    }

    fn set_remote_audio_enabled(&self, enabled: bool) {
        self.log(format!("set_remote_audio_enabled({enabled})"));
    }

    async fn close(&self) {
        self.log("close");
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A controller wired to the hub with a mock media engine
pub struct TestPeer {
    pub controller: Arc<CallController<HubEndpoint>>,
    pub media: MockMedia,
    pub state: watch::Receiver<CallSnapshot<PeerIdentityString>>,
}

impl TestPeer {
    pub fn id(&self) -> PeerIdentityString {
        self.controller.local_identity().clone()
    }
}

/// Spawn a started controller named `name` on the hub
pub fn test_peer(hub: &Arc<SignalingHub>, name: &str) -> TestPeer {
    init_tracing();
    let endpoint = hub.endpoint(name);
    let media = MockMedia::new();
    let controller = Arc::new(CallController::new(
        endpoint,
        media.factory(),
        PeerIdentityString::new(name),
    ));
    controller.start().expect("controller start");
    let state = controller.watch_state().expect("watch channel");
    TestPeer {
        controller,
        media,
        state,
    }
}

/// Virtual-time budget for condition waits; generous because paused-clock
/// tests advance through multi-second timers.
const WAIT_BUDGET: Duration = Duration::from_secs(300);

/// Poll the watch channel until the snapshot satisfies `pred`
///
/// Polling (rather than `changed()`) keeps paused-clock tests deterministic:
/// each idle poll advances virtual time by one small step, so armed call
/// timers fire exactly when their durations elapse.
pub async fn wait_for<F>(rx: &watch::Receiver<CallSnapshot<PeerIdentityString>>, pred: F)
where
    F: Fn(&CallSnapshot<PeerIdentityString>) -> bool,
{
    let poll = async {
        loop {
            if pred(&rx.borrow()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT_BUDGET, poll)
        .await
        .expect("condition not reached within wait budget");
}

/// Wait until the peer's call state equals `want`
pub async fn wait_for_state(
    rx: &watch::Receiver<CallSnapshot<PeerIdentityString>>,
    want: CallState,
) {
    wait_for(rx, |snap| snap.state == want).await;
}

/// Run the scheduler without advancing virtual time meaningfully
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
