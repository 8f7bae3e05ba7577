use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    registration_state_for, AgentId, AgentOptions, Device, InviteDelegate, PhoneContext,
    PhoneError, RegistererListener, RegistererState, Registerer, RegistrationState, Result,
    SignalingAgent, SignalingStack, SoftphoneConfig, TransportError,
};

// Agent currently bound to the selected device
struct Binding {
    id: AgentId,
    agent: Arc<dyn SignalingAgent>,
    registerer: Option<Arc<dyn Registerer>>,
}

/// Owns the one signaling agent and drives REGISTER / un-REGISTER for the
/// selected device.
pub struct RegistrationManager {
    ctx: PhoneContext,
    stack: Arc<dyn SignalingStack>,
    config: SoftphoneConfig,
    next_agent: AtomicU64,
    binding: RwLock<Option<Binding>>,
    // Serializes register / unregister / device switches
    lifecycle: Mutex<()>,
}

impl RegistrationManager {
    pub fn new(ctx: PhoneContext, stack: Arc<dyn SignalingStack>, config: SoftphoneConfig) -> Self {
        RegistrationManager {
            ctx,
            stack,
            config,
            next_agent: AtomicU64::new(0),
            binding: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.ctx.snapshot().registration_state
    }

    pub async fn agent(&self) -> Option<Arc<dyn SignalingAgent>> {
        self.binding.read().await.as_ref().map(|b| b.agent.clone())
    }

    pub async fn current_agent_id(&self) -> Option<AgentId> {
        self.binding.read().await.as_ref().map(|b| b.id)
    }

    /// Switches the active device, unregistering the old one first.
    pub async fn select_device(&self, device: Device) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let bound = self.binding.read().await.is_some();
        let teardown = if bound {
            info!("Releasing current registration before switching to {}", device.name);
            self.unregister_locked().await
        } else {
            Ok(())
        };

        info!("Selected device {} ({})", device.name, device.sip_uri);
        self.ctx.update(|s| s.directory.select(device));

        if self.config.register_on_select {
            self.register_locked().await?;
        }
        teardown
    }

    pub async fn register(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.register_locked().await
    }

    pub async fn unregister(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.unregister_locked().await
    }

    /// Swaps in a freshly fetched device list. A registration whose device
    /// is no longer listed is released before the new list is published.
    pub async fn replace_devices(&self, devices: Vec<Device>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let mut directory = self.ctx.snapshot().directory;
        let previous = directory.selected().map(|d| d.id.clone());
        directory.replace(devices);
        let current = directory.selected().map(|d| d.id.clone());

        let released = if previous.is_some() && previous != current {
            info!("Selected device {:?} is gone, releasing its registration", previous);
            self.unregister_locked().await
        } else {
            Ok(())
        };
        self.ctx.update(|s| s.directory = directory);
        released
    }

    async fn register_locked(&self) -> Result<()> {
        let device = self
            .ctx
            .snapshot()
            .selected_device()
            .cloned()
            .ok_or(PhoneError::NoDeviceSelected)?;

        match self.state() {
            RegistrationState::Registering | RegistrationState::Registered => {
                debug!("Registration already in progress for {}", device.sip_uri);
                return Ok(());
            }
            _ => {}
        }

        // Leftover agent from an earlier failed attempt
        let stale = self.binding.write().await.take();
        if let Some(stale) = stale {
            debug!("Stopping leftover {}", stale.id);
            if let Err(e) = stale.agent.stop().await {
                warn!("Failed to stop leftover {}: {}", stale.id, e);
            }
        }

        self.ctx.update(|s| {
            s.registration_state = RegistrationState::Registering;
            s.error = None;
        });

        match self.start_agent(&device).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Registration of {} failed: {}", device.sip_uri, e);
                let abandoned = self.binding.write().await.take();
                if let Some(binding) = abandoned {
                    if let Err(e) = binding.agent.stop().await {
                        warn!("Failed to stop abandoned {}: {}", binding.id, e);
                    }
                }
                self.ctx
                    .update(|s| s.registration_state = RegistrationState::Failed);
                Err(e)
            }
        }
    }

    async fn start_agent(&self, device: &Device) -> Result<()> {
        let uri = device
            .signaling_uri()
            .map_err(|e| PhoneError::RegistrationFailed(e.to_string()))?;
        let id = AgentId(self.next_agent.fetch_add(1, Ordering::SeqCst) + 1);

        let options = AgentOptions {
            id,
            uri,
            server: device.wss_url.clone(),
            authorization_username: device.username.clone(),
            authorization_password: device.password.clone(),
            user_agent: self.config.user_agent.clone(),
            audio_only: self.config.audio_only,
            delegate: InviteDelegate::new(id, self.ctx.events()),
        };

        let agent = self.stack.create_agent(options).map_err(registration_failed)?;
        *self.binding.write().await = Some(Binding {
            id,
            agent: agent.clone(),
            registerer: None,
        });

        agent.start().await.map_err(registration_failed)?;

        let registerer = agent.registerer().map_err(registration_failed)?;
        registerer.set_listener(RegistererListener::new(id, self.ctx.events()));
        if let Some(binding) = self.binding.write().await.as_mut() {
            binding.registerer = Some(registerer.clone());
        }

        info!("Registering {} via {}", device.sip_uri, device.wss_url);
        registerer.register().await.map_err(registration_failed)
    }

    async fn unregister_locked(&self) -> Result<()> {
        let has_registerer = self
            .binding
            .read()
            .await
            .as_ref()
            .is_some_and(|b| b.registerer.is_some());
        if !has_registerer {
            return Ok(());
        }

        self.ctx
            .update(|s| s.registration_state = RegistrationState::Unregistering);

        let Some(binding) = self.binding.write().await.take() else {
            return Ok(());
        };

        let mut failure: Option<TransportError> = None;
        if let Some(registerer) = &binding.registerer {
            if let Err(e) = registerer.unregister().await {
                warn!("Unregister request for {} failed: {}", binding.id, e);
                failure = Some(e);
            }
        }
        if let Err(e) = binding.agent.stop().await {
            warn!("Failed to stop {}: {}", binding.id, e);
            failure.get_or_insert(e);
        }

        self.ctx
            .update(|s| s.registration_state = RegistrationState::Unregistered);
        info!("Unregistered {}", binding.id);

        match failure {
            Some(e) => Err(PhoneError::UnregistrationFailed(e.to_string())),
            None => Ok(()),
        }
    }

    /// Applies a registerer notification. Events from agents that are no
    /// longer bound are dropped.
    pub async fn apply_event(&self, agent: AgentId, state: RegistererState) {
        if self.current_agent_id().await != Some(agent) {
            debug!("Ignoring registerer {:?} from stale {}", state, agent);
            return;
        }

        let Some(next) = registration_state_for(state) else {
            return;
        };

        info!("Registration state of {}: {}", agent, next);
        self.ctx.update(|s| {
            s.registration_state = next;
            if next == RegistrationState::Failed {
                s.error = Some(
                    PhoneError::RegistrationFailed("registration terminated".to_string())
                        .to_string(),
                );
            }
        });
    }
}

fn registration_failed(e: TransportError) -> PhoneError {
    PhoneError::RegistrationFailed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackOp, LoopbackStack};
    use crate::{DeviceDirectory, TransportEvent};
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn device(id: &str, domain: &str) -> Device {
        Device {
            id: id.to_string(),
            name: format!("Device {}", id),
            sip_uri: format!("sip:{}@{}", id, domain),
            username: id.to_string(),
            password: "secret".to_string(),
            domain: domain.to_string(),
            wss_url: format!("wss://{}:7443", domain),
        }
    }

    struct Rig {
        ctx: PhoneContext,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        stack: LoopbackStack,
        manager: RegistrationManager,
    }

    impl Rig {
        fn new(devices: Vec<Device>, config: SoftphoneConfig) -> Self {
            let (ctx, events) = PhoneContext::new(DeviceDirectory::new(devices));
            let stack = LoopbackStack::new();
            let manager = RegistrationManager::new(ctx.clone(), Arc::new(stack.clone()), config);
            Rig {
                ctx,
                events,
                stack,
                manager,
            }
        }

        // Stand-in for the softphone event loop
        async fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                if let TransportEvent::Registration { agent, state } = event {
                    self.manager.apply_event(agent, state).await;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_register_requires_device() {
        let mut rig = Rig::new(Vec::new(), SoftphoneConfig::default());
        assert_eq!(rig.manager.register().await, Err(PhoneError::NoDeviceSelected));
        rig.pump().await;
        assert_eq!(rig.manager.state(), RegistrationState::Unregistered);
        assert!(rig.stack.ops().is_empty());
    }

    #[tokio::test]
    async fn test_register_then_unregister() {
        let mut rig = Rig::new(vec![device("1001", "example.com")], SoftphoneConfig::default());

        assert_ok!(rig.manager.register().await);
        assert_eq!(rig.manager.state(), RegistrationState::Registering);
        rig.pump().await;
        assert_eq!(rig.manager.state(), RegistrationState::Registered);
        assert!(rig.manager.agent().await.is_some());

        assert_ok!(rig.manager.unregister().await);
        rig.pump().await;
        assert_eq!(rig.manager.state(), RegistrationState::Unregistered);
        assert!(rig.manager.agent().await.is_none());
        assert_eq!(rig.stack.running_agents(), 0);

        let ops = rig.stack.ops();
        assert!(ops.contains(&LoopbackOp::Register(AgentId(1))));
        assert!(ops.contains(&LoopbackOp::Unregister(AgentId(1))));
        assert!(ops.contains(&LoopbackOp::AgentStopped(AgentId(1))));
    }

    #[tokio::test]
    async fn test_agent_carries_device_credentials() {
        let mut rig = Rig::new(vec![device("1001", "example.com")], SoftphoneConfig::default());
        assert_ok!(rig.manager.register().await);
        rig.pump().await;

        assert_eq!(
            rig.stack.ops().first(),
            Some(&LoopbackOp::AgentCreated {
                id: AgentId(1),
                uri: "sip:1001@example.com".to_string(),
                server: "wss://example.com:7443".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_unregister_without_registerer_is_noop() {
        let mut rig = Rig::new(vec![device("1001", "example.com")], SoftphoneConfig::default());
        assert_ok!(rig.manager.unregister().await);
        rig.pump().await;
        assert_eq!(rig.manager.state(), RegistrationState::Unregistered);
        assert!(rig.stack.ops().is_empty());
    }

    #[tokio::test]
    async fn test_second_register_does_not_create_agent() {
        let mut rig = Rig::new(vec![device("1001", "example.com")], SoftphoneConfig::default());
        assert_ok!(rig.manager.register().await);
        rig.pump().await;
        assert_ok!(rig.manager.register().await);
        assert_eq!(rig.stack.agents_created(), 1);
    }

    #[tokio::test]
    async fn test_failed_register_can_be_retried() {
        let mut rig = Rig::new(vec![device("1001", "example.com")], SoftphoneConfig::default());
        rig.stack.set_register_failure(true);

        let err = assert_err!(rig.manager.register().await);
        assert!(matches!(err, PhoneError::RegistrationFailed(_)));
        rig.pump().await;
        assert_eq!(rig.manager.state(), RegistrationState::Failed);
        assert_eq!(rig.stack.running_agents(), 0, "failed agent must not linger");

        rig.stack.set_register_failure(false);
        assert_ok!(rig.manager.register().await);
        rig.pump().await;
        assert_eq!(rig.manager.state(), RegistrationState::Registered);
        assert_eq!(rig.stack.agents_created(), 2);
    }

    #[tokio::test]
    async fn test_invalid_device_uri_fails_registration() {
        let mut broken = device("1001", "example.com");
        broken.sip_uri = "not a uri".to_string();
        let mut rig = Rig::new(vec![broken], SoftphoneConfig::default());

        let err = assert_err!(rig.manager.register().await);
        assert!(matches!(err, PhoneError::RegistrationFailed(_)));
        assert_eq!(rig.manager.state(), RegistrationState::Failed);
        assert_eq!(rig.stack.agents_created(), 0);
    }

    #[tokio::test]
    async fn test_transport_termination_fails_registration() {
        let mut rig = Rig::new(vec![device("1001", "example.com")], SoftphoneConfig::default());
        assert_ok!(rig.manager.register().await);
        rig.pump().await;

        rig.stack.drop_registration();
        rig.pump().await;

        let snapshot = rig.ctx.snapshot();
        assert_eq!(snapshot.registration_state, RegistrationState::Failed);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("Registration failed: registration terminated")
        );
    }

    #[tokio::test]
    async fn test_select_device_unregisters_first() {
        let mut rig = Rig::new(
            vec![device("1001", "example.com"), device("2002", "example.org")],
            SoftphoneConfig::default(),
        );
        assert_ok!(rig.manager.register().await);
        rig.pump().await;
        assert_eq!(rig.manager.state(), RegistrationState::Registered);

        assert_ok!(rig.manager.select_device(device("2002", "example.org")).await);
        rig.pump().await;

        assert_eq!(rig.manager.state(), RegistrationState::Unregistered);
        let ops = rig.stack.ops();
        assert!(ops.contains(&LoopbackOp::Unregister(AgentId(1))));
        assert!(ops.contains(&LoopbackOp::AgentStopped(AgentId(1))));
        assert_eq!(
            rig.ctx.snapshot().selected_device().map(|d| d.id.as_str()),
            Some("2002")
        );
        assert_eq!(rig.stack.running_agents(), 0);
        assert_eq!(rig.stack.agents_created(), 1, "switching must not auto-register");
    }

    #[tokio::test]
    async fn test_select_device_passes_through_unregistering() {
        let mut rig = Rig::new(
            vec![device("1001", "example.com"), device("2002", "example.org")],
            SoftphoneConfig::default(),
        );
        assert_ok!(rig.manager.register().await);
        rig.pump().await;

        let gate = rig.stack.gate_unregister();
        let mut states = rig.ctx.subscribe();
        let switch = rig.manager.select_device(device("2002", "example.org"));
        let observe = async {
            let during = states
                .wait_for(|s| s.registration_state == RegistrationState::Unregistering)
                .await
                .unwrap()
                .clone();
            gate.notify_one();
            during
        };
        let (result, during) = tokio::join!(switch, observe);

        assert_ok!(result);
        assert_eq!(
            during.selected_device().map(|d| d.id.as_str()),
            Some("1001"),
            "old device stays selected until unregistered"
        );
        assert_eq!(rig.manager.state(), RegistrationState::Unregistered);
        assert_eq!(
            rig.ctx.snapshot().selected_device().map(|d| d.id.as_str()),
            Some("2002")
        );
    }

    #[tokio::test]
    async fn test_select_device_with_register_on_select() {
        let config = SoftphoneConfig {
            register_on_select: true,
            ..SoftphoneConfig::default()
        };
        let mut rig = Rig::new(
            vec![device("1001", "example.com"), device("2002", "example.org")],
            config,
        );
        assert_ok!(rig.manager.register().await);
        rig.pump().await;

        assert_ok!(rig.manager.select_device(device("2002", "example.org")).await);
        rig.pump().await;

        assert_eq!(rig.manager.state(), RegistrationState::Registered);
        assert_eq!(rig.stack.running_agents(), 1);

        // The old agent is fully stopped before the new one is created
        let ops = rig.stack.ops();
        let stopped = ops
            .iter()
            .position(|op| *op == LoopbackOp::AgentStopped(AgentId(1)))
            .unwrap();
        let created = ops
            .iter()
            .position(|op| matches!(op, LoopbackOp::AgentCreated { id: AgentId(2), .. }))
            .unwrap();
        assert!(stopped < created);
    }

    #[tokio::test]
    async fn test_failed_unregister_still_ends_unregistered() {
        let mut rig = Rig::new(vec![device("1001", "example.com")], SoftphoneConfig::default());
        assert_ok!(rig.manager.register().await);
        rig.pump().await;
        rig.stack.set_unregister_failure(true);

        let err = assert_err!(rig.manager.unregister().await);
        assert!(matches!(err, PhoneError::UnregistrationFailed(_)));
        assert!(err.to_string().starts_with("Unregistration failed: "));
        rig.pump().await;

        assert_eq!(rig.manager.state(), RegistrationState::Unregistered);
        assert!(rig.manager.agent().await.is_none());
        assert_eq!(rig.stack.running_agents(), 0);

        // Nothing is left half torn down
        rig.stack.set_unregister_failure(false);
        assert_ok!(rig.manager.register().await);
        rig.pump().await;
        assert_eq!(rig.manager.state(), RegistrationState::Registered);
    }

    #[tokio::test]
    async fn test_replace_devices_keeps_listed_selection() {
        let mut rig = Rig::new(
            vec![device("1001", "example.com"), device("2002", "example.org")],
            SoftphoneConfig::default(),
        );
        assert_ok!(rig.manager.register().await);
        rig.pump().await;

        assert_ok!(
            rig.manager
                .replace_devices(vec![device("3003", "example.net"), device("1001", "example.com")])
                .await
        );
        let snapshot = rig.ctx.snapshot();
        assert_eq!(snapshot.devices().len(), 2);
        assert_eq!(snapshot.selected_device().map(|d| d.id.as_str()), Some("1001"));
        assert_eq!(rig.manager.state(), RegistrationState::Registered);
        assert_eq!(rig.stack.running_agents(), 1);

        assert_ok!(rig.manager.replace_devices(vec![device("3003", "example.net")]).await);
        rig.pump().await;
        let snapshot = rig.ctx.snapshot();
        assert_eq!(snapshot.selected_device().map(|d| d.id.as_str()), Some("3003"));
        assert_eq!(rig.manager.state(), RegistrationState::Unregistered);
        assert_eq!(rig.stack.running_agents(), 0);
    }

    #[tokio::test]
    async fn test_stale_agent_events_ignored() {
        let mut rig = Rig::new(vec![device("1001", "example.com")], SoftphoneConfig::default());
        assert_ok!(rig.manager.register().await);
        rig.pump().await;
        assert_ok!(rig.manager.unregister().await);
        assert_ok!(rig.manager.register().await);
        rig.pump().await;
        assert_eq!(rig.manager.current_agent_id().await, Some(AgentId(2)));

        rig.manager
            .apply_event(AgentId(1), RegistererState::Terminated)
            .await;
        assert_eq!(rig.manager.state(), RegistrationState::Registered);
    }
}
