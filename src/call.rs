use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::{
    call_state_for, validate_target, AudioOutput, CallDirection, CallSession, CallState,
    HoldModifier, Invitation, Inviter, MediaConnection, PhoneContext, PhoneError, PlaybackStream,
    RegistrationState, Result, Session, SessionId, SessionListener, SessionState, SignalingAgent,
    SipUri, TrackKind, TransportResult,
};

/// The session behind the call slot, in either orientation.
#[derive(Clone)]
pub enum CallLeg {
    Outbound(Arc<dyn Inviter>),
    Inbound(Arc<dyn Invitation>),
}

impl CallLeg {
    pub fn direction(&self) -> CallDirection {
        match self {
            CallLeg::Outbound(_) => CallDirection::Outbound,
            CallLeg::Inbound(_) => CallDirection::Inbound,
        }
    }

    pub fn state(&self) -> SessionState {
        match self {
            CallLeg::Outbound(s) => s.state(),
            CallLeg::Inbound(s) => s.state(),
        }
    }

    pub fn media(&self) -> Option<Arc<dyn MediaConnection>> {
        match self {
            CallLeg::Outbound(s) => s.media(),
            CallLeg::Inbound(s) => s.media(),
        }
    }

    fn set_listener(&self, listener: SessionListener) {
        match self {
            CallLeg::Outbound(s) => s.set_listener(listener),
            CallLeg::Inbound(s) => s.set_listener(listener),
        }
    }

    async fn bye(&self) -> TransportResult<()> {
        match self {
            CallLeg::Outbound(s) => s.bye().await,
            CallLeg::Inbound(s) => s.bye().await,
        }
    }

    async fn reinvite(&self, modifier: HoldModifier) -> TransportResult<()> {
        match self {
            CallLeg::Outbound(s) => s.reinvite(modifier).await,
            CallLeg::Inbound(s) => s.reinvite(modifier).await,
        }
    }

    // Gives up on a session that never got established
    async fn abandon(&self) -> TransportResult<()> {
        match self {
            CallLeg::Outbound(s) => s.cancel().await,
            CallLeg::Inbound(s) => s.reject().await,
        }
    }
}

#[derive(Clone)]
struct ActiveCall {
    id: SessionId,
    leg: CallLeg,
}

pub fn is_dtmf_digit(c: char) -> bool {
    matches!(c, '0'..='9' | '*' | '#' | 'A'..='D')
}

/// Drives the single call slot: outbound and inbound setup, teardown, media
/// controls and the duration clock.
pub struct CallManager {
    ctx: PhoneContext,
    audio: Arc<dyn AudioOutput>,
    tick: Duration,
    next_session: AtomicU64,
    active: RwLock<Option<ActiveCall>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
    pub fn new(ctx: PhoneContext, audio: Arc<dyn AudioOutput>, tick: Duration) -> Self {
        CallManager {
            ctx,
            audio,
            tick,
            next_session: AtomicU64::new(0),
            active: RwLock::new(None),
            ticker: Mutex::new(None),
        }
    }

    pub async fn active_session(&self) -> Option<SessionId> {
        self.active.read().await.as_ref().map(|a| a.id)
    }

    pub async fn active_leg(&self) -> Option<CallLeg> {
        self.active.read().await.as_ref().map(|a| a.leg.clone())
    }

    fn next_id(&self) -> SessionId {
        SessionId(self.next_session.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Places an outbound call to `target` at the selected device's domain.
    pub async fn make_call(
        &self,
        agent: Option<Arc<dyn SignalingAgent>>,
        target: &str,
    ) -> Result<SessionId> {
        let snapshot = self.ctx.snapshot();
        let agent = match (agent, snapshot.registration_state) {
            (Some(agent), RegistrationState::Registered) => agent,
            _ => return Err(PhoneError::NotRegistered),
        };
        let device = snapshot
            .selected_device()
            .cloned()
            .ok_or(PhoneError::NotRegistered)?;

        let target = validate_target(target)?;
        let target_uri = SipUri::for_target(target, &device.domain)?;

        let id = self.next_id();
        let inviter = {
            let mut active = self.active.write().await;
            if active.is_some() {
                return Err(PhoneError::CallInProgress);
            }
            let inviter = agent
                .inviter(&target_uri)
                .map_err(|e| PhoneError::CallSetupFailed(e.to_string()))?;
            *active = Some(ActiveCall {
                id,
                leg: CallLeg::Outbound(inviter.clone()),
            });
            self.ctx.update(|s| {
                s.call = CallSession::new(
                    CallState::Connecting,
                    CallDirection::Outbound,
                    target.to_string(),
                )
            });
            inviter
        };

        inviter.set_listener(SessionListener::new(id, self.ctx.events()));
        info!("Calling {} ({})", target_uri, id);

        if let Err(e) = inviter.invite().await {
            warn!("INVITE to {} failed: {}", target_uri, e);
            self.finish(id).await;
            return Err(PhoneError::CallSetupFailed(e.to_string()));
        }
        Ok(id)
    }

    /// Takes an incoming INVITE into the call slot, or rejects it when the
    /// slot is busy.
    pub async fn handle_invitation(&self, invitation: Arc<dyn Invitation>) {
        let caller = invitation
            .remote_uri()
            .user
            .unwrap_or_else(|| "Unknown".to_string());

        let id = {
            let mut active = self.active.write().await;
            if active.is_some() {
                None
            } else {
                let id = self.next_id();
                *active = Some(ActiveCall {
                    id,
                    leg: CallLeg::Inbound(invitation.clone()),
                });
                self.ctx.update(|s| {
                    s.call = CallSession::new(CallState::Ringing, CallDirection::Inbound, caller.clone())
                });
                Some(id)
            }
        };

        match id {
            Some(id) => {
                invitation.set_listener(SessionListener::new(id, self.ctx.events()));
                info!("Incoming call from {} ({})", caller, id);
            }
            None => {
                warn!("Rejecting call from {} while another call is active", caller);
                if let Err(e) = invitation.reject().await {
                    warn!("Failed to reject call from {}: {}", caller, e);
                }
            }
        }
    }

    pub async fn answer_call(&self) -> Result<()> {
        let call = self.ctx.call();
        if call.state != CallState::Ringing || call.direction != Some(CallDirection::Inbound) {
            debug!("No ringing inbound call to answer");
            return Ok(());
        }
        let Some(ActiveCall {
            leg: CallLeg::Inbound(invitation),
            ..
        }) = self.active.read().await.clone()
        else {
            return Ok(());
        };

        invitation
            .accept()
            .await
            .map_err(|e| PhoneError::AnswerFailed(e.to_string()))
    }

    /// Ends the call however far it got: cancel or reject before it is
    /// established, BYE afterwards.
    pub async fn hangup_call(&self) -> Result<()> {
        let Some(active) = self.active.read().await.clone() else {
            debug!("No call to hang up");
            return Ok(());
        };

        self.stop_ticker().await;
        self.ctx.update(|s| {
            if !s.call.is_idle() {
                s.call.transition(CallState::Disconnecting)
            }
        });

        let result = match active.leg.state() {
            SessionState::Initial | SessionState::Establishing => active.leg.abandon().await,
            SessionState::Established => active.leg.bye().await,
            SessionState::Terminating | SessionState::Terminated => Ok(()),
        };

        if let Err(e) = result {
            warn!("Hangup of {} failed: {}", active.id, e);
            // Nothing will bring the slot back from disconnecting otherwise
            self.finish(active.id).await;
            return Err(PhoneError::HangupFailed(e.to_string()));
        }
        Ok(())
    }

    pub async fn toggle_mute(&self) {
        let call = self.ctx.call();
        if call.state != CallState::Connected {
            return;
        }
        let Some(active) = self.active.read().await.clone() else {
            return;
        };
        let track = active.leg.media().and_then(|media| {
            media
                .sender_tracks()
                .into_iter()
                .find(|t| t.kind() == TrackKind::Audio)
        });
        let Some(track) = track else {
            debug!("No local audio track on {}", active.id);
            return;
        };

        let muted = !call.is_muted;
        track.set_enabled(!muted);
        self.ctx.update(|s| {
            if s.call.state == CallState::Connected {
                s.call.is_muted = muted
            }
        });
        debug!("{} {}", active.id, if muted { "muted" } else { "unmuted" });
    }

    pub async fn toggle_hold(&self) -> Result<()> {
        let call = self.ctx.call();
        if call.state != CallState::Connected {
            return Ok(());
        }
        let Some(active) = self.active.read().await.clone() else {
            return Ok(());
        };

        let modifier = if call.is_on_hold {
            HoldModifier::Resume
        } else {
            HoldModifier::Hold
        };
        active
            .leg
            .reinvite(modifier)
            .await
            .map_err(|e| PhoneError::HoldToggleFailed(e.to_string()))?;

        if self.active_session().await == Some(active.id) {
            self.ctx.update(|s| {
                if s.call.state == CallState::Connected {
                    s.call.is_on_hold = modifier == HoldModifier::Hold
                }
            });
        }
        info!("{} {:?}", active.id, modifier);
        Ok(())
    }

    /// Sends one DTMF digit. Failures are only logged.
    pub async fn send_dtmf(&self, digit: &str) {
        if self.ctx.call().state != CallState::Connected {
            return;
        }
        let mut chars = digit.trim().chars();
        let digit = match (chars.next(), chars.next()) {
            (Some(c), None) if is_dtmf_digit(c) => c,
            _ => {
                warn!("Ignoring invalid DTMF digit {:?}", digit);
                return;
            }
        };
        let Some(media) = self.active_leg().await.and_then(|leg| leg.media()) else {
            warn!("No media connection for DTMF");
            return;
        };
        if let Err(e) = media.send_dtmf(digit) {
            warn!("Failed to send DTMF {}: {}", digit, e);
        }
    }

    /// Applies a session notification to the call slot. Notifications for
    /// any session other than the current one are dropped.
    pub async fn apply_event(&self, session: SessionId, state: SessionState) {
        let next = call_state_for(state);
        if next == CallState::Idle {
            self.finish(session).await;
            return;
        }

        let connected = {
            let active = self.active.read().await;
            let Some(current) = active.as_ref().filter(|a| a.id == session) else {
                debug!("Ignoring {:?} from stale {}", state, session);
                return;
            };

            match next {
                CallState::Connected => {
                    let mut stream = PlaybackStream::new();
                    if let Some(media) = current.leg.media() {
                        for track in media.receiver_tracks() {
                            stream.add_track(track);
                        }
                    }
                    debug!("Attaching {:?} for {}", stream, session);
                    self.audio.set_source(Some(stream));
                    self.ctx.update(|s| s.call.transition(CallState::Connected));
                    true
                }
                _ => {
                    self.ctx.update(|s| {
                        if s.call.state != CallState::Disconnecting {
                            s.call.transition(next)
                        }
                    });
                    false
                }
            }
        };

        if connected {
            info!("{} connected", session);
            self.start_ticker().await;
        }
    }

    /// Ends the connection process if one is in progress and frees the slot
    /// without waiting for the session to report its termination.
    pub async fn shutdown(&self) {
        let active = self.active_session().await;
        if let Err(e) = self.hangup_call().await {
            warn!("Hangup during shutdown failed: {}", e);
        }
        if let Some(id) = active {
            self.finish(id).await;
        }
        self.stop_ticker().await;
    }

    // Returns the slot to idle if `session` still owns it
    async fn finish(&self, session: SessionId) {
        let mut active = self.active.write().await;
        if active.as_ref().map(|a| a.id) != Some(session) {
            debug!("Ignoring termination of stale {}", session);
            return;
        }
        *active = None;
        self.stop_ticker().await;
        self.audio.set_source(None);
        self.ctx.update(|s| s.call.transition(CallState::Idle));
        info!("{} ended", session);
    }

    async fn start_ticker(&self) {
        let ctx = self.ctx.clone();
        let period = self.tick;
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                ctx.update_if(|s| {
                    if s.call.state == CallState::Connected {
                        s.call.duration += 1;
                        true
                    } else {
                        false
                    }
                });
            }
        });
        if let Some(previous) = self.ticker.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn stop_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }
}
