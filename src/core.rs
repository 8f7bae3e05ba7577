// Core types shared by the registration and call managers
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[cfg(feature = "serialization")]
use serde::Serialize;

/// Everything that can go wrong between a UI intent and the signaling stack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhoneError {
    #[error("No device selected")]
    NoDeviceSelected,

    #[error("Not registered")]
    NotRegistered,

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Unregistration failed: {0}")]
    UnregistrationFailed(String),

    #[error("Failed to make call: {0}")]
    CallSetupFailed(String),

    #[error("A call is already in progress")]
    CallInProgress,

    #[error("Failed to answer call: {0}")]
    AnswerFailed(String),

    #[error("Failed to hangup call: {0}")]
    HangupFailed(String),

    #[error("Failed to toggle hold: {0}")]
    HoldToggleFailed(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Failed to fetch devices: {0}")]
    DeviceFetchFailed(String),

    #[error("Invalid SIP URI: {0}")]
    InvalidUri(String),
}

pub type Result<T> = std::result::Result<T, PhoneError>;

// SIP URI, enough of it to address devices and dial targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SipUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();

        let scheme_end = uri
            .find(':')
            .ok_or_else(|| PhoneError::InvalidUri(format!("no scheme in '{}'", uri)))?;
        let scheme = uri[..scheme_end].to_lowercase();

        if scheme != "sip" && scheme != "sips" {
            return Err(PhoneError::InvalidUri(format!("invalid scheme: {}", scheme)));
        }

        let rest = uri[scheme_end + 1..].trim_start_matches("//");
        // Parameters and headers are not needed to address a device
        let rest = rest.split([';', '?']).next().unwrap_or_default();

        let (user, host_part) = match rest.rfind('@') {
            Some(at_pos) => {
                let user_part = &rest[..at_pos];
                // Drop an inline password if one was supplied
                let user = user_part.split(':').next().unwrap_or_default();
                if user.is_empty() {
                    return Err(PhoneError::InvalidUri(format!("empty user in '{}'", uri)));
                }
                (Some(user.to_string()), &rest[at_pos + 1..])
            }
            None => (None, rest),
        };

        let (host, port) = if let Some(stripped) = host_part.strip_prefix('[') {
            let end = stripped
                .find(']')
                .ok_or_else(|| PhoneError::InvalidUri("invalid IPv6 address".to_string()))?;
            let port = stripped[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            (stripped[..end].to_string(), port)
        } else {
            let mut parts = host_part.splitn(2, ':');
            let host = parts.next().unwrap_or_default().to_string();
            let port = match parts.next() {
                Some(p) => Some(
                    p.parse()
                        .map_err(|_| PhoneError::InvalidUri(format!("invalid port: {}", p)))?,
                ),
                None => None,
            };
            (host, port)
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(PhoneError::InvalidUri(format!("invalid host in '{}'", uri)));
        }

        Ok(SipUri {
            scheme,
            user,
            host,
            port,
        })
    }

    /// Builds `sip:<target>@<domain>` for a dialed number or extension.
    pub fn for_target(target: &str, domain: &str) -> Result<Self> {
        let target = validate_target(target)?;
        SipUri::parse(&format!("sip:{}@{}", target, domain))
            .map_err(|e| PhoneError::InvalidTarget(e.to_string()))
    }

    /// `user@host`, without the scheme.
    pub fn address_of_record(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(ref user) = self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// Trims a dial target and checks it only holds dialable characters.
pub fn validate_target(target: &str) -> Result<&str> {
    let target = target.trim();
    if target.is_empty() {
        return Err(PhoneError::InvalidTarget("empty target".to_string()));
    }
    let dialable = |c: char| c.is_ascii_alphanumeric() || matches!(c, '*' | '#' | '+' | '.' | '-' | '_');
    if !target.chars().all(dialable) {
        return Err(PhoneError::InvalidTarget(target.to_string()));
    }
    Ok(target)
}

// Signaling agent generation, bumped every time an agent is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

// Identity a session listener was registered against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// Registration states as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(Serialize), serde(rename_all = "lowercase"))]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    Unregistering,
    Failed,
}

impl RegistrationState {
    pub fn label(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
            RegistrationState::Unregistering => "unregistering",
            RegistrationState::Failed => "failed",
        }
    }

    /// Indicator color for the widget header.
    pub fn status_color(&self) -> &'static str {
        match self {
            RegistrationState::Registered => "#4caf50",
            RegistrationState::Registering | RegistrationState::Unregistering => "#ff9800",
            RegistrationState::Failed => "#f44336",
            RegistrationState::Unregistered => "#9e9e9e",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// Call states as shown to the user; Idle means no session exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(Serialize), serde(rename_all = "lowercase"))]
pub enum CallState {
    #[default]
    Idle,
    Ringing,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Ringing => "ringing",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize), serde(rename_all = "lowercase"))]
pub enum CallDirection {
    Inbound,
    Outbound,
}

// Registerer states reported by the signaling stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistererState {
    Initial,
    Registered,
    Unregistered,
    Terminated,
}

// Session states reported by the signaling stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Establishing,
    Established,
    Terminating,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminating | SessionState::Terminated)
    }
}

/// Maps a registerer notification onto the user-facing registration state.
/// `Initial` carries no information and maps to nothing.
pub fn registration_state_for(state: RegistererState) -> Option<RegistrationState> {
    match state {
        RegistererState::Initial => None,
        RegistererState::Registered => Some(RegistrationState::Registered),
        RegistererState::Unregistered => Some(RegistrationState::Unregistered),
        RegistererState::Terminated => Some(RegistrationState::Failed),
    }
}

/// Maps a session notification onto the user-facing call state.
pub fn call_state_for(state: SessionState) -> CallState {
    match state {
        SessionState::Initial | SessionState::Establishing => CallState::Connecting,
        SessionState::Established => CallState::Connected,
        SessionState::Terminating | SessionState::Terminated => CallState::Idle,
    }
}

/// Published view of the single call slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialization", derive(Serialize), serde(rename_all = "camelCase"))]
pub struct CallSession {
    pub state: CallState,
    pub direction: Option<CallDirection>,
    pub remote_identity: Option<String>,
    pub duration: u64,
    pub is_muted: bool,
    pub is_on_hold: bool,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub(crate) fn new(state: CallState, direction: CallDirection, remote_identity: String) -> Self {
        CallSession {
            state,
            direction: Some(direction),
            remote_identity: Some(remote_identity),
            ..CallSession::default()
        }
    }

    /// Moves to `state`, keeping `duration` at zero outside `Connected`
    /// and resetting everything when the slot goes idle.
    pub(crate) fn transition(&mut self, state: CallState) {
        match state {
            CallState::Idle => *self = CallSession::default(),
            CallState::Connected => {
                if self.state != CallState::Connected {
                    self.duration = 0;
                    self.connected_at = Some(Utc::now());
                }
                self.state = state;
            }
            _ => {
                self.state = state;
                self.duration = 0;
                self.connected_at = None;
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == CallState::Idle
    }
}

/// Renders a call duration as `MM:SS`.
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

// Configuration types
#[derive(Debug, Clone)]
pub struct SoftphoneConfig {
    pub user_agent: String,
    pub audio_only: bool,
    pub duration_tick: Duration,
    pub register_on_select: bool,
    pub devices_file: Option<String>,
}

impl Default for SoftphoneConfig {
    fn default() -> Self {
        SoftphoneConfig {
            user_agent: "RustSoftphone/0.1".to_string(),
            audio_only: true,
            duration_tick: Duration::from_secs(1),
            register_on_select: false,
            devices_file: None,
        }
    }
}

impl SoftphoneConfig {
    /// Reads overrides from `SOFTPHONE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = SoftphoneConfig::default();

        SoftphoneConfig {
            user_agent: std::env::var("SOFTPHONE_USER_AGENT").unwrap_or(defaults.user_agent),
            audio_only: defaults.audio_only,
            duration_tick: std::env::var("SOFTPHONE_DURATION_TICK_MS")
                .ok()
                .and_then(|ms| ms.parse().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.duration_tick),
            register_on_select: std::env::var("SOFTPHONE_REGISTER_ON_SELECT")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.register_on_select),
            devices_file: std::env::var("SOFTPHONE_DEVICES_FILE").ok(),
        }
    }
}
