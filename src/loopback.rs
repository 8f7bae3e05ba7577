//! In-process signaling stack.
//!
//! Answers every request locally and records what the softphone asked for,
//! so the demo binary runs without a PBX and tests can play the far end:
//! answer or hang up remotely, ring the phone, or make requests fail.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    AgentId, AgentOptions, AudioOutput, CallDirection, HoldModifier, InviteDelegate, Invitation,
    Inviter, MediaConnection, MediaTrack, PlaybackStream, Registerer, RegistererListener,
    RegistererState, Session, SessionListener, SessionState, SignalingAgent, SignalingStack,
    SipUri, TrackKind, TransportError, TransportResult,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request the softphone made of the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackOp {
    AgentCreated {
        id: AgentId,
        uri: String,
        server: String,
    },
    AgentStarted(AgentId),
    AgentStopped(AgentId),
    Register(AgentId),
    Unregister(AgentId),
    Invite(String),
    Cancel(String),
    Accept(String),
    Reject(String),
    Bye(String),
    Reinvite {
        target: String,
        modifier: HoldModifier,
    },
    Dtmf(char),
}

#[derive(Default)]
struct Knobs {
    auto_answer: AtomicBool,
    fail_register: AtomicBool,
    fail_unregister: AtomicBool,
    fail_invite: AtomicBool,
    fail_answer: AtomicBool,
    fail_hangup: AtomicBool,
    fail_hold: AtomicBool,
    fail_dtmf: AtomicBool,
}

#[derive(Default)]
struct Shared {
    ops: Mutex<Vec<LoopbackOp>>,
    knobs: Knobs,
    agents: Mutex<Vec<Arc<LoopbackAgent>>>,
    sessions: Mutex<Vec<Arc<LoopbackSession>>>,
    unregister_gate: Mutex<Option<Arc<Notify>>>,
    next_track: AtomicU64,
}

impl Shared {
    fn record(&self, op: LoopbackOp) {
        debug!("loopback: {:?}", op);
        lock(&self.ops).push(op);
    }

    fn hangup_failure(&self) -> TransportResult<()> {
        if self.knobs.fail_hangup.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn track(&self, kind: TrackKind, side: &str) -> Arc<LoopbackTrack> {
        let n = self.next_track.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(LoopbackTrack {
            id: format!("loopback-{}-{}", side, n),
            kind,
            enabled: AtomicBool::new(true),
        })
    }
}

#[derive(Clone, Default)]
pub struct LoopbackStack {
    shared: Arc<Shared>,
}

impl LoopbackStack {
    pub fn new() -> Self {
        LoopbackStack::default()
    }

    /// Outbound calls are answered as soon as they are sent.
    pub fn set_auto_answer(&self, enabled: bool) {
        self.shared.knobs.auto_answer.store(enabled, Ordering::SeqCst);
    }

    pub fn set_register_failure(&self, fail: bool) {
        self.shared.knobs.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn set_unregister_failure(&self, fail: bool) {
        self.shared.knobs.fail_unregister.store(fail, Ordering::SeqCst);
    }

    pub fn set_invite_failure(&self, fail: bool) {
        self.shared.knobs.fail_invite.store(fail, Ordering::SeqCst);
    }

    pub fn set_answer_failure(&self, fail: bool) {
        self.shared.knobs.fail_answer.store(fail, Ordering::SeqCst);
    }

    /// CANCEL, reject and BYE all fail and leave the session as it was.
    pub fn set_hangup_failure(&self, fail: bool) {
        self.shared.knobs.fail_hangup.store(fail, Ordering::SeqCst);
    }

    pub fn set_hold_failure(&self, fail: bool) {
        self.shared.knobs.fail_hold.store(fail, Ordering::SeqCst);
    }

    pub fn set_dtmf_failure(&self, fail: bool) {
        self.shared.knobs.fail_dtmf.store(fail, Ordering::SeqCst);
    }

    /// Makes un-REGISTER requests wait until the returned gate is notified.
    pub fn gate_unregister(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.shared.unregister_gate) = Some(gate.clone());
        gate
    }

    pub fn ops(&self) -> Vec<LoopbackOp> {
        lock(&self.shared.ops).clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.shared.ops).clear();
    }

    pub fn agents_created(&self) -> usize {
        lock(&self.shared.agents).len()
    }

    pub fn running_agents(&self) -> usize {
        lock(&self.shared.agents)
            .iter()
            .filter(|a| a.is_running())
            .count()
    }

    fn current_agent(&self) -> Option<Arc<LoopbackAgent>> {
        lock(&self.shared.agents)
            .iter()
            .rev()
            .find(|a| a.is_running())
            .cloned()
    }

    /// The registrar drops the binding of the running agent.
    pub fn drop_registration(&self) {
        if let Some(registerer) = self.current_agent().and_then(|a| a.current_registerer()) {
            registerer.notify(RegistererState::Terminated);
        }
    }

    /// Rings the running agent with a call from `from`.
    pub fn incoming_call(&self, from: &str) -> Option<Arc<LoopbackSession>> {
        let agent = self.current_agent()?;
        let remote = SipUri::parse(&format!("sip:{}@{}", from, agent.uri.host)).ok()?;
        let session = LoopbackSession::new(&self.shared, agent.id, CallDirection::Inbound, remote);
        agent.delegate.on_invite(session.clone());
        Some(session)
    }

    pub fn sessions(&self) -> Vec<Arc<LoopbackSession>> {
        lock(&self.shared.sessions).clone()
    }

    pub fn last_session(&self) -> Option<Arc<LoopbackSession>> {
        lock(&self.shared.sessions).last().cloned()
    }
}

impl SignalingStack for LoopbackStack {
    fn create_agent(&self, options: AgentOptions) -> TransportResult<Arc<dyn SignalingAgent>> {
        self.shared.record(LoopbackOp::AgentCreated {
            id: options.id,
            uri: options.uri.to_string(),
            server: options.server.clone(),
        });
        let agent = Arc::new(LoopbackAgent {
            id: options.id,
            uri: options.uri,
            delegate: options.delegate,
            shared: self.shared.clone(),
            running: Arc::new(AtomicBool::new(false)),
            registerer: Mutex::new(None),
        });
        lock(&self.shared.agents).push(agent.clone());
        Ok(agent as Arc<dyn SignalingAgent>)
    }
}

pub struct LoopbackAgent {
    id: AgentId,
    uri: SipUri,
    delegate: InviteDelegate,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    registerer: Mutex<Option<Arc<LoopbackRegisterer>>>,
}

impl LoopbackAgent {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn current_registerer(&self) -> Option<Arc<LoopbackRegisterer>> {
        lock(&self.registerer).clone()
    }
}

impl SignalingAgent for LoopbackAgent {
    fn id(&self) -> AgentId {
        self.id
    }

    fn start(&self) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            self.shared.record(LoopbackOp::AgentStarted(self.id));
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }

    fn stop(&self) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            self.running.store(false, Ordering::SeqCst);
            self.shared.record(LoopbackOp::AgentStopped(self.id));

            // Sessions die with their agent
            let sessions: Vec<_> = lock(&self.shared.sessions)
                .iter()
                .filter(|s| s.agent == self.id && !s.state().is_terminal())
                .cloned()
                .collect();
            for session in sessions {
                session.set_state(SessionState::Terminated);
            }
            Ok(())
        }
        .boxed()
    }

    fn registerer(&self) -> TransportResult<Arc<dyn Registerer>> {
        let mut slot = lock(&self.registerer);
        let registerer = slot
            .get_or_insert_with(|| {
                Arc::new(LoopbackRegisterer {
                    agent: self.id,
                    running: self.running.clone(),
                    shared: self.shared.clone(),
                    listener: Mutex::new(None),
                })
            })
            .clone();
        Ok(registerer as Arc<dyn Registerer>)
    }

    fn inviter(&self, target: &SipUri) -> TransportResult<Arc<dyn Inviter>> {
        if !self.is_running() {
            return Err(TransportError::Closed);
        }
        let session = LoopbackSession::new(
            &self.shared,
            self.id,
            CallDirection::Outbound,
            target.clone(),
        );
        Ok(session as Arc<dyn Inviter>)
    }
}

pub struct LoopbackRegisterer {
    agent: AgentId,
    running: Arc<AtomicBool>,
    shared: Arc<Shared>,
    listener: Mutex<Option<RegistererListener>>,
}

impl LoopbackRegisterer {
    fn notify(&self, state: RegistererState) {
        let listener = lock(&self.listener).clone();
        if let Some(listener) = listener {
            listener.notify(state);
        }
    }
}

impl Registerer for LoopbackRegisterer {
    fn set_listener(&self, listener: RegistererListener) {
        *lock(&self.listener) = Some(listener);
    }

    fn register(&self) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            if !self.running.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.shared.record(LoopbackOp::Register(self.agent));
            if self.shared.knobs.fail_register.load(Ordering::SeqCst) {
                return Err(TransportError::Rejected {
                    code: 403,
                    reason: "Forbidden".to_string(),
                });
            }
            self.notify(RegistererState::Registered);
            Ok(())
        }
        .boxed()
    }

    fn unregister(&self) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            let gate = lock(&self.shared.unregister_gate).clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.shared.record(LoopbackOp::Unregister(self.agent));
            if self.shared.knobs.fail_unregister.load(Ordering::SeqCst) {
                return Err(TransportError::Rejected {
                    code: 408,
                    reason: "Request Timeout".to_string(),
                });
            }
            self.notify(RegistererState::Unregistered);
            Ok(())
        }
        .boxed()
    }
}

/// One call leg, either orientation.
pub struct LoopbackSession {
    agent: AgentId,
    direction: CallDirection,
    remote: SipUri,
    shared: Arc<Shared>,
    state: Mutex<SessionState>,
    listener: Mutex<Option<SessionListener>>,
    media: Arc<LoopbackMedia>,
}

impl LoopbackSession {
    fn new(
        shared: &Arc<Shared>,
        agent: AgentId,
        direction: CallDirection,
        remote: SipUri,
    ) -> Arc<Self> {
        let session = Arc::new(LoopbackSession {
            agent,
            direction,
            remote,
            shared: shared.clone(),
            state: Mutex::new(SessionState::Initial),
            listener: Mutex::new(None),
            media: Arc::new(LoopbackMedia {
                shared: shared.clone(),
                local: shared.track(TrackKind::Audio, "local"),
                remote: shared.track(TrackKind::Audio, "remote"),
                dtmf: Mutex::new(Vec::new()),
            }),
        });
        lock(&shared.sessions).push(session.clone());
        session
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
        let listener = lock(&self.listener).clone();
        if let Some(listener) = listener {
            listener.notify(state);
        }
    }

    fn target(&self) -> String {
        self.remote.to_string()
    }

    /// The far end picks up an outbound call.
    pub fn remote_answer(&self) {
        if matches!(self.state(), SessionState::Initial | SessionState::Establishing) {
            self.set_state(SessionState::Established);
        }
    }

    /// The far end hangs up.
    pub fn remote_hangup(&self) {
        if !self.state().is_terminal() {
            self.set_state(SessionState::Terminated);
        }
    }

    /// Reports `state` regardless of what came before.
    pub fn force_state(&self, state: SessionState) {
        self.set_state(state);
    }

    pub fn local_audio(&self) -> Arc<dyn MediaTrack> {
        self.media.local.clone()
    }

    pub fn dtmf_sent(&self) -> Vec<char> {
        lock(&self.media.dtmf).clone()
    }
}

impl Session for LoopbackSession {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn remote_uri(&self) -> SipUri {
        self.remote.clone()
    }

    fn set_listener(&self, listener: SessionListener) {
        *lock(&self.listener) = Some(listener);
    }

    fn bye(&self) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            let state = self.state();
            if state != SessionState::Established {
                return Err(TransportError::InvalidState(state));
            }
            self.shared.record(LoopbackOp::Bye(self.target()));
            self.shared.hangup_failure()?;
            self.set_state(SessionState::Terminating);
            self.set_state(SessionState::Terminated);
            Ok(())
        }
        .boxed()
    }

    fn reinvite(&self, modifier: HoldModifier) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            let state = self.state();
            if state != SessionState::Established {
                return Err(TransportError::InvalidState(state));
            }
            self.shared.record(LoopbackOp::Reinvite {
                target: self.target(),
                modifier,
            });
            if self.shared.knobs.fail_hold.load(Ordering::SeqCst) {
                return Err(TransportError::Rejected {
                    code: 488,
                    reason: "Not Acceptable Here".to_string(),
                });
            }
            Ok(())
        }
        .boxed()
    }

    fn media(&self) -> Option<Arc<dyn MediaConnection>> {
        Some(self.media.clone() as Arc<dyn MediaConnection>)
    }
}

impl Inviter for LoopbackSession {
    fn invite(&self) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            self.shared.record(LoopbackOp::Invite(self.target()));
            if self.shared.knobs.fail_invite.load(Ordering::SeqCst) {
                self.set_state(SessionState::Terminated);
                return Err(TransportError::Rejected {
                    code: 503,
                    reason: "Service Unavailable".to_string(),
                });
            }
            self.set_state(SessionState::Establishing);
            if self.shared.knobs.auto_answer.load(Ordering::SeqCst) {
                self.set_state(SessionState::Established);
            }
            Ok(())
        }
        .boxed()
    }

    fn cancel(&self) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            let state = self.state();
            if !matches!(state, SessionState::Initial | SessionState::Establishing) {
                return Err(TransportError::InvalidState(state));
            }
            self.shared.record(LoopbackOp::Cancel(self.target()));
            self.shared.hangup_failure()?;
            self.set_state(SessionState::Terminated);
            Ok(())
        }
        .boxed()
    }
}

impl Invitation for LoopbackSession {
    fn accept(&self) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            let state = self.state();
            if state != SessionState::Initial {
                return Err(TransportError::InvalidState(state));
            }
            self.shared.record(LoopbackOp::Accept(self.target()));
            if self.shared.knobs.fail_answer.load(Ordering::SeqCst) {
                return Err(TransportError::Media("no microphone".to_string()));
            }
            self.set_state(SessionState::Establishing);
            self.set_state(SessionState::Established);
            Ok(())
        }
        .boxed()
    }

    fn reject(&self) -> BoxFuture<'_, TransportResult<()>> {
        async move {
            let state = self.state();
            if !matches!(state, SessionState::Initial | SessionState::Establishing) {
                return Err(TransportError::InvalidState(state));
            }
            self.shared.record(LoopbackOp::Reject(self.target()));
            self.shared.hangup_failure()?;
            self.set_state(SessionState::Terminated);
            Ok(())
        }
        .boxed()
    }
}

struct LoopbackMedia {
    shared: Arc<Shared>,
    local: Arc<LoopbackTrack>,
    remote: Arc<LoopbackTrack>,
    dtmf: Mutex<Vec<char>>,
}

impl MediaConnection for LoopbackMedia {
    fn sender_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        vec![self.local.clone() as Arc<dyn MediaTrack>]
    }

    fn receiver_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        vec![self.remote.clone() as Arc<dyn MediaTrack>]
    }

    fn send_dtmf(&self, digit: char) -> TransportResult<()> {
        if self.shared.knobs.fail_dtmf.load(Ordering::SeqCst) {
            return Err(TransportError::Media("no DTMF sender".to_string()));
        }
        self.shared.record(LoopbackOp::Dtmf(digit));
        lock(&self.dtmf).push(digit);
        Ok(())
    }
}

struct LoopbackTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
}

impl MediaTrack for LoopbackTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Audio output that just remembers what it was told to play.
#[derive(Default)]
pub struct LoopbackAudio {
    source: Mutex<Option<PlaybackStream>>,
}

impl LoopbackAudio {
    pub fn new() -> Self {
        LoopbackAudio::default()
    }

    pub fn current(&self) -> Option<PlaybackStream> {
        lock(&self.source).clone()
    }
}

impl AudioOutput for LoopbackAudio {
    fn set_source(&self, stream: Option<PlaybackStream>) {
        match &stream {
            Some(stream) => debug!("audio: playing {:?}", stream),
            None => debug!("audio: detached"),
        }
        *lock(&self.source) = stream;
    }
}
