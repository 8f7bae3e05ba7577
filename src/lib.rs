// lib.rs - Main library module for the softphone core

#[path = "core.rs"]
mod core;
#[path = "device.rs"]
mod device;
#[path = "transport.rs"]
mod transport;

pub mod call;
pub mod dial;
pub mod loopback;
pub mod registration;
pub mod softphone;
pub mod telemetry;

// Re-export core types
pub use crate::core::*;
pub use crate::device::*;
pub use crate::transport::*;

pub use crate::call::{is_dtmf_digit, CallLeg, CallManager};
pub use crate::dial::{DialChannel, DialListener, DialRequest};
pub use crate::registration::RegistrationManager;
pub use crate::softphone::{PhoneContext, Softphone, SoftphoneBuilder, SoftphoneSnapshot};
pub use crate::telemetry::init_tracing;

// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        // Main API
        Softphone,
        SoftphoneBuilder,
        SoftphoneConfig,
        SoftphoneSnapshot,

        // Devices
        Device,
        DeviceSource,
        StaticDevices,

        // States
        CallDirection,
        CallSession,
        CallState,
        RegistrationState,

        // Core types
        PhoneError,
        Result,
        SipUri,

        DialChannel,
        DialRequest,
        format_duration,
    };
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_prelude_covers_public_api() {
        use crate::prelude::*;
        let config = SoftphoneConfig::default();
        assert_eq!(config.duration_tick, std::time::Duration::from_secs(1));
        assert_eq!(CallSession::default().state, CallState::Idle);
        assert_eq!(format_duration(61), "01:01");
    }
}
