//! Device directory: the telephony endpoints available to the current user.

use std::fmt;

#[cfg(feature = "serialization")]
use serde::{Deserialize, Serialize};

use crate::{PhoneError, Result, SipUri};

/// One telephony endpoint. Immutable once fetched.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serialization",
    derive(Serialize, Deserialize),
    serde(rename_all = "camelCase")
)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub sip_uri: String,
    pub username: String,
    pub password: String,
    pub domain: String,
    pub wss_url: String,
}

impl Device {
    pub fn signaling_uri(&self) -> Result<SipUri> {
        SipUri::parse(&self.sip_uri)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sip_uri", &self.sip_uri)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .field("wss_url", &self.wss_url)
            .finish()
    }
}

// Device list plus the active selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDirectory {
    devices: Vec<Device>,
    selected: Option<Device>,
}

impl DeviceDirectory {
    pub fn new(devices: Vec<Device>) -> Self {
        let mut directory = DeviceDirectory::default();
        directory.replace(devices);
        directory
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn selected(&self) -> Option<&Device> {
        self.selected.as_ref()
    }

    pub fn find(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn select(&mut self, device: Device) {
        self.selected = Some(device);
    }

    /// Swaps in a freshly fetched list. The selection survives if its id is
    /// still listed (taking the fresh copy); otherwise the first device is
    /// selected, or nothing when the list is empty.
    pub fn replace(&mut self, devices: Vec<Device>) {
        let selected = self
            .selected
            .as_ref()
            .and_then(|current| devices.iter().find(|d| d.id == current.id))
            .or_else(|| devices.first())
            .cloned();

        self.devices = devices;
        self.selected = selected;
    }
}

/// Backend reply for the device list.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize, Deserialize))]
pub struct DevicesResponse {
    pub success: bool,
    #[cfg_attr(feature = "serialization", serde(default))]
    pub devices: Option<Vec<Device>>,
    #[cfg_attr(feature = "serialization", serde(default))]
    pub error: Option<String>,
}

impl DevicesResponse {
    pub fn into_devices(self) -> Result<Vec<Device>> {
        match (self.success, self.devices) {
            (true, Some(devices)) => Ok(devices),
            (true, None) => Ok(Vec::new()),
            (false, _) => Err(PhoneError::DeviceFetchFailed(
                self.error.unwrap_or_else(|| "Failed to fetch devices".to_string()),
            )),
        }
    }
}

/// Where device lists come from.
#[trait_variant::make(DeviceSource: Send)]
pub trait LocalDeviceSource {
    async fn fetch_devices(&self) -> Result<Vec<Device>>;
}

// Fixed list, used by the demo binary and tests
#[derive(Debug, Clone, Default)]
pub struct StaticDevices(pub Vec<Device>);

impl DeviceSource for StaticDevices {
    async fn fetch_devices(&self) -> Result<Vec<Device>> {
        Ok(self.0.clone())
    }
}

/// Reads devices from a JSON file holding either a bare array or a
/// [`DevicesResponse`].
#[cfg(feature = "serialization")]
#[derive(Debug, Clone)]
pub struct JsonFileDevices {
    path: std::path::PathBuf,
}

#[cfg(feature = "serialization")]
impl JsonFileDevices {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        JsonFileDevices { path: path.into() }
    }
}

#[cfg(feature = "serialization")]
pub fn parse_devices(json: &str) -> Result<Vec<Device>> {
    if let Ok(devices) = serde_json::from_str::<Vec<Device>>(json) {
        return Ok(devices);
    }
    serde_json::from_str::<DevicesResponse>(json)
        .map_err(|e| PhoneError::DeviceFetchFailed(e.to_string()))?
        .into_devices()
}

#[cfg(feature = "serialization")]
impl DeviceSource for JsonFileDevices {
    async fn fetch_devices(&self) -> Result<Vec<Device>> {
        let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            PhoneError::DeviceFetchFailed(format!("{}: {}", self.path.display(), e))
        })?;
        parse_devices(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, name: &str) -> Device {
        Device {
            id: id.to_string(),
            name: name.to_string(),
            sip_uri: format!("sip:{}@acme.example.com", id),
            username: id.to_string(),
            password: "hunter2".to_string(),
            domain: "acme.example.com".to_string(),
            wss_url: "wss://edge.example.com:7443".to_string(),
        }
    }

    #[test]
    fn test_new_directory_selects_first() {
        let directory = DeviceDirectory::new(vec![device("a", "Desk"), device("b", "Laptop")]);
        assert_eq!(directory.devices().len(), 2);
        assert_eq!(directory.selected().map(|d| d.id.as_str()), Some("a"));
        assert!(DeviceDirectory::new(Vec::new()).selected().is_none());
    }

    #[test]
    fn test_replace_keeps_selection_by_id() {
        let mut directory = DeviceDirectory::new(vec![device("a", "Desk"), device("b", "Laptop")]);
        directory.select(device("b", "Laptop"));

        directory.replace(vec![device("a", "Desk"), device("b", "Laptop (renamed)")]);

        let selected = directory.selected().unwrap();
        assert_eq!(selected.id, "b");
        assert_eq!(selected.name, "Laptop (renamed)");
    }

    #[test]
    fn test_replace_falls_back_to_first() {
        let mut directory = DeviceDirectory::new(vec![device("a", "Desk"), device("b", "Laptop")]);
        directory.select(device("b", "Laptop"));

        directory.replace(vec![device("c", "Phone"), device("a", "Desk")]);
        assert_eq!(directory.selected().map(|d| d.id.as_str()), Some("c"));

        directory.replace(Vec::new());
        assert!(directory.selected().is_none());
        assert!(directory.find("a").is_none());
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", device("a", "Desk"));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_failed_response() {
        let response = DevicesResponse {
            success: false,
            devices: None,
            error: Some("token expired".to_string()),
        };
        assert_eq!(
            response.into_devices(),
            Err(PhoneError::DeviceFetchFailed("token expired".to_string()))
        );
    }

    #[cfg(feature = "serialization")]
    #[test]
    fn test_parse_backend_json() {
        let json = r#"{
            "success": true,
            "devices": [{
                "id": "d1",
                "name": "Front desk",
                "sipUri": "sip:1001@acme.pbx.example.com",
                "username": "1001",
                "password": "pw",
                "domain": "acme.pbx.example.com",
                "wssUrl": "wss://pbx.example.com:7443"
            }]
        }"#;
        let devices = parse_devices(json).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].wss_url, "wss://pbx.example.com:7443");
        assert_eq!(devices[0].signaling_uri().unwrap().host, "acme.pbx.example.com");

        let bare = serde_json::to_string(&devices).unwrap();
        assert_eq!(parse_devices(&bare).unwrap(), devices);

        assert!(matches!(parse_devices("{not json"), Err(PhoneError::DeviceFetchFailed(_))));
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticDevices(vec![device("a", "Desk")]);
        let devices = tokio_test::assert_ok!(DeviceSource::fetch_devices(&source).await);
        assert_eq!(devices[0].id, "a");
    }
}
