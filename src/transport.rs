//! Signaling and media capability consumed by the softphone.
//!
//! The softphone does not speak SIP itself. It drives whatever stack sits
//! behind these traits (SIP over secure websocket plus a WebRTC media engine
//! in production, [`crate::loopback`] in the demo and in tests) and learns
//! about asynchronous progress through [`TransportEvent`]s pushed into an
//! [`EventSink`]. Every listener handed to the stack is tagged with the agent
//! or session it was registered against, so late notifications from an old
//! agent or session can be recognised and dropped.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{AgentId, RegistererState, SessionId, SessionState, SipUri};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("request failed with status {code}: {reason}")]
    Rejected { code: u16, reason: String },

    #[error("invalid operation in state {0:?}")]
    InvalidState(SessionState),

    #[error("media error: {0}")]
    Media(String),

    #[error("{0}")]
    Other(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Channel end the stack pushes notifications into.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

// Asynchronous notifications from the signaling stack
pub enum TransportEvent {
    Registration {
        agent: AgentId,
        state: RegistererState,
    },
    Invitation {
        agent: AgentId,
        invitation: Arc<dyn Invitation>,
    },
    Session {
        session: SessionId,
        state: SessionState,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Registration { agent, state } => f
                .debug_struct("Registration")
                .field("agent", agent)
                .field("state", state)
                .finish(),
            TransportEvent::Invitation { agent, invitation } => f
                .debug_struct("Invitation")
                .field("agent", agent)
                .field("from", &invitation.remote_uri().to_string())
                .finish(),
            TransportEvent::Session { session, state } => f
                .debug_struct("Session")
                .field("session", session)
                .field("state", state)
                .finish(),
        }
    }
}

/// Inbound-call delegate installed once per agent.
#[derive(Clone, Debug)]
pub struct InviteDelegate {
    agent: AgentId,
    sink: EventSink,
}

impl InviteDelegate {
    pub fn new(agent: AgentId, sink: EventSink) -> Self {
        InviteDelegate { agent, sink }
    }

    pub fn on_invite(&self, invitation: Arc<dyn Invitation>) {
        let _ = self.sink.send(TransportEvent::Invitation {
            agent: self.agent,
            invitation,
        });
    }
}

#[derive(Clone, Debug)]
pub struct RegistererListener {
    agent: AgentId,
    sink: EventSink,
}

impl RegistererListener {
    pub fn new(agent: AgentId, sink: EventSink) -> Self {
        RegistererListener { agent, sink }
    }

    pub fn notify(&self, state: RegistererState) {
        let _ = self.sink.send(TransportEvent::Registration {
            agent: self.agent,
            state,
        });
    }
}

#[derive(Clone, Debug)]
pub struct SessionListener {
    session: SessionId,
    sink: EventSink,
}

impl SessionListener {
    pub fn new(session: SessionId, sink: EventSink) -> Self {
        SessionListener { session, sink }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn notify(&self, state: SessionState) {
        let _ = self.sink.send(TransportEvent::Session {
            session: self.session,
            state,
        });
    }
}

/// Everything needed to construct a signaling agent for one device.
#[derive(Clone)]
pub struct AgentOptions {
    pub id: AgentId,
    pub uri: SipUri,
    pub server: String,
    pub authorization_username: String,
    pub authorization_password: String,
    pub user_agent: String,
    pub audio_only: bool,
    pub delegate: InviteDelegate,
}

impl fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentOptions")
            .field("id", &self.id)
            .field("uri", &self.uri.to_string())
            .field("server", &self.server)
            .field("authorization_username", &self.authorization_username)
            .field("authorization_password", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .field("audio_only", &self.audio_only)
            .finish()
    }
}

// Factory for signaling agents
pub trait SignalingStack: Send + Sync {
    fn create_agent(&self, options: AgentOptions) -> TransportResult<Arc<dyn SignalingAgent>>;
}

pub trait SignalingAgent: Send + Sync {
    fn id(&self) -> AgentId;
    fn start(&self) -> BoxFuture<'_, TransportResult<()>>;
    fn stop(&self) -> BoxFuture<'_, TransportResult<()>>;
    fn registerer(&self) -> TransportResult<Arc<dyn Registerer>>;
    /// Creates an outbound session; nothing is sent until [`Inviter::invite`].
    fn inviter(&self, target: &SipUri) -> TransportResult<Arc<dyn Inviter>>;
}

pub trait Registerer: Send + Sync {
    fn set_listener(&self, listener: RegistererListener);
    fn register(&self) -> BoxFuture<'_, TransportResult<()>>;
    fn unregister(&self) -> BoxFuture<'_, TransportResult<()>>;
}

/// Hold/resume modifier applied to a re-INVITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldModifier {
    Hold,
    Resume,
}

// Operations common to both call orientations
pub trait Session: Send + Sync {
    fn state(&self) -> SessionState;
    fn remote_uri(&self) -> SipUri;
    fn set_listener(&self, listener: SessionListener);
    fn bye(&self) -> BoxFuture<'_, TransportResult<()>>;
    fn reinvite(&self, modifier: HoldModifier) -> BoxFuture<'_, TransportResult<()>>;
    fn media(&self) -> Option<Arc<dyn MediaConnection>>;
}

pub trait Inviter: Session {
    fn invite(&self) -> BoxFuture<'_, TransportResult<()>>;
    fn cancel(&self) -> BoxFuture<'_, TransportResult<()>>;
}

pub trait Invitation: Session {
    fn accept(&self) -> BoxFuture<'_, TransportResult<()>>;
    fn reject(&self) -> BoxFuture<'_, TransportResult<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
}

// Peer connection behind an established session
pub trait MediaConnection: Send + Sync {
    /// Tracks attached to outgoing senders; senders without a track are skipped.
    fn sender_tracks(&self) -> Vec<Arc<dyn MediaTrack>>;
    /// Tracks attached to incoming receivers.
    fn receiver_tracks(&self) -> Vec<Arc<dyn MediaTrack>>;
    fn send_dtmf(&self, digit: char) -> TransportResult<()>;
}

/// Remote media gathered for playback.
#[derive(Clone, Default)]
pub struct PlaybackStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl PlaybackStream {
    pub fn new() -> Self {
        PlaybackStream::default()
    }

    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) {
        self.tracks.push(track);
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id()).collect()
    }
}

impl fmt::Debug for PlaybackStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackStream")
            .field("tracks", &self.track_ids())
            .finish()
    }
}

/// The single shared audio output element.
pub trait AudioOutput: Send + Sync {
    fn set_source(&self, stream: Option<PlaybackStream>);
}
