use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::CallManager;
use crate::dial::{DialChannel, DialListener};
use crate::registration::RegistrationManager;
use crate::{
    AudioOutput, CallSession, Device, DeviceDirectory, DeviceSource, EventSink, PhoneError,
    RegistrationState, SignalingStack, SoftphoneConfig, TransportEvent,
};

/// Everything the presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftphoneSnapshot {
    pub directory: DeviceDirectory,
    pub registration_state: RegistrationState,
    pub call: CallSession,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl SoftphoneSnapshot {
    pub fn devices(&self) -> &[Device] {
        self.directory.devices()
    }

    pub fn selected_device(&self) -> Option<&Device> {
        self.directory.selected()
    }
}

/// Shared handle on the published snapshot and the transport event sink.
#[derive(Clone)]
pub struct PhoneContext {
    state: Arc<watch::Sender<SoftphoneSnapshot>>,
    events: EventSink,
}

impl PhoneContext {
    pub fn new(directory: DeviceDirectory) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (state, _) = watch::channel(SoftphoneSnapshot {
            directory,
            ..SoftphoneSnapshot::default()
        });
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = PhoneContext {
            state: Arc::new(state),
            events,
        };
        (ctx, rx)
    }

    pub fn snapshot(&self) -> SoftphoneSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SoftphoneSnapshot> {
        self.state.subscribe()
    }

    pub fn call(&self) -> CallSession {
        self.state.borrow().call.clone()
    }

    pub fn events(&self) -> EventSink {
        self.events.clone()
    }

    pub(crate) fn update(&self, modify: impl FnOnce(&mut SoftphoneSnapshot)) {
        self.state.send_modify(modify);
    }

    // Only wakes subscribers when `modify` reports a change
    pub(crate) fn update_if(&self, modify: impl FnOnce(&mut SoftphoneSnapshot) -> bool) {
        self.state.send_if_modified(modify);
    }

    /// Publishes `err` as the user-visible error message.
    pub(crate) fn report(&self, err: &PhoneError) {
        warn!("{}", err);
        let message = err.to_string();
        self.update(|s| s.error = Some(message));
    }
}

pub struct SoftphoneBuilder {
    config: SoftphoneConfig,
    stack: Arc<dyn SignalingStack>,
    audio: Arc<dyn AudioOutput>,
    devices: Vec<Device>,
}

impl SoftphoneBuilder {
    /// `audio` is the shared output remote audio of connected calls plays on.
    pub fn new(stack: Arc<dyn SignalingStack>, audio: Arc<dyn AudioOutput>) -> Self {
        SoftphoneBuilder {
            config: SoftphoneConfig::default(),
            stack,
            audio,
            devices: Vec::new(),
        }
    }

    pub fn config(mut self, config: SoftphoneConfig) -> Self {
        self.config = config;
        self
    }

    pub fn devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = devices;
        self
    }

    /// Builds the softphone and starts its event loop. Must be called from
    /// within a tokio runtime.
    pub fn build(self) -> Arc<Softphone> {
        let (ctx, events) = PhoneContext::new(DeviceDirectory::new(self.devices));

        let registration = Arc::new(RegistrationManager::new(
            ctx.clone(),
            self.stack,
            self.config.clone(),
        ));
        let calls = Arc::new(CallManager::new(
            ctx.clone(),
            self.audio,
            self.config.duration_tick,
        ));

        let event_loop = tokio::spawn(run_event_loop(
            registration.clone(),
            calls.clone(),
            events,
        ));

        Arc::new(Softphone {
            ctx,
            registration,
            calls,
            dial: DialChannel::new(),
            event_loop: Mutex::new(Some(event_loop)),
        })
    }
}

// Single consumer of transport notifications
async fn run_event_loop(
    registration: Arc<RegistrationManager>,
    calls: Arc<CallManager>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        debug!("Transport event: {:?}", event);
        match event {
            TransportEvent::Registration { agent, state } => {
                registration.apply_event(agent, state).await
            }
            TransportEvent::Invitation { agent, invitation } => {
                if registration.current_agent_id().await == Some(agent) {
                    calls.handle_invitation(invitation).await;
                } else {
                    warn!("Rejecting invitation delivered to stale {}", agent);
                    if let Err(e) = invitation.reject().await {
                        warn!("Failed to reject stale invitation: {}", e);
                    }
                }
            }
            TransportEvent::Session { session, state } => calls.apply_event(session, state).await,
        }
    }
}

/// The softphone as seen by a UI: a snapshot to render plus fire-and-forget
/// intents. Intents never return errors; failures land in
/// [`SoftphoneSnapshot::error`].
pub struct Softphone {
    ctx: PhoneContext,
    registration: Arc<RegistrationManager>,
    calls: Arc<CallManager>,
    dial: DialChannel,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Softphone {
    pub fn builder(
        stack: Arc<dyn SignalingStack>,
        audio: Arc<dyn AudioOutput>,
    ) -> SoftphoneBuilder {
        SoftphoneBuilder::new(stack, audio)
    }

    pub fn snapshot(&self) -> SoftphoneSnapshot {
        self.ctx.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SoftphoneSnapshot> {
        self.ctx.subscribe()
    }

    pub async fn refresh_devices<S: DeviceSource>(&self, source: &S) {
        self.ctx.update(|s| {
            s.is_loading = true;
            s.error = None;
        });

        let devices = match source.fetch_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                self.ctx.update(|s| s.is_loading = false);
                self.ctx.report(&e);
                return;
            }
        };
        info!("Fetched {} device(s)", devices.len());

        let result = self.registration.replace_devices(devices).await;
        self.ctx.update(|s| s.is_loading = false);
        if let Err(e) = result {
            self.ctx.report(&e);
        }
    }

    pub async fn select_device(&self, device: Device) {
        if let Err(e) = self.registration.select_device(device).await {
            self.ctx.report(&e);
        }
    }

    pub async fn select_device_by_id(&self, id: &str) {
        let device = self.ctx.snapshot().directory.find(id).cloned();
        match device {
            Some(device) => self.select_device(device).await,
            None => warn!("Unknown device {}", id),
        }
    }

    pub async fn register(&self) {
        if let Err(e) = self.registration.register().await {
            self.ctx.report(&e);
        }
    }

    pub async fn unregister(&self) {
        if let Err(e) = self.registration.unregister().await {
            self.ctx.report(&e);
        }
    }

    pub async fn make_call(&self, target: &str) {
        let agent = self.registration.agent().await;
        if let Err(e) = self.calls.make_call(agent, target).await {
            self.ctx.report(&e);
        }
    }

    pub async fn answer_call(&self) {
        if let Err(e) = self.calls.answer_call().await {
            self.ctx.report(&e);
        }
    }

    pub async fn hangup_call(&self) {
        if let Err(e) = self.calls.hangup_call().await {
            self.ctx.report(&e);
        }
    }

    pub async fn toggle_mute(&self) {
        self.calls.toggle_mute().await;
    }

    pub async fn toggle_hold(&self) {
        if let Err(e) = self.calls.toggle_hold().await {
            self.ctx.report(&e);
        }
    }

    pub async fn send_dtmf(&self, digit: &str) {
        self.calls.send_dtmf(digit).await;
    }

    /// Asks whichever dialer is mounted to dial `number`.
    pub fn dial_number(&self, number: &str) -> bool {
        self.dial.dial_number(number)
    }

    pub fn dial_requests(&self) -> DialListener {
        self.dial.subscribe()
    }

    pub fn dial_channel(&self) -> DialChannel {
        self.dial.clone()
    }

    pub fn clear_error(&self) {
        self.ctx.update(|s| s.error = None);
    }

    /// Hangs up, unregisters and stops the event loop.
    pub async fn shutdown(&self) {
        self.calls.shutdown().await;
        if let Err(e) = self.registration.unregister().await {
            warn!("Unregister during shutdown failed: {}", e);
        }
        if let Some(handle) = self.event_loop.lock().await.take() {
            handle.abort();
        }
        info!("Softphone stopped");
    }
}
