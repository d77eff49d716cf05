//! Media device inventory and selection
//!
//! The host environment supplies devices through [`MediaDevices`]. The
//! [`DeviceManager`] caches the inventory, tracks which device feeds each
//! pipeline stage, and pushes change notifications onto the event bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::audio::{AudioOutput, AudioTrack, ManualOutput, ManualTrack, OutputTap, TrackFeed};
use crate::error::DeviceError;
use crate::events::{EventBus, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    #[serde(rename = "audioinput")]
    AudioInput,
    #[serde(rename = "audiooutput")]
    AudioOutput,
    #[serde(rename = "videoinput")]
    VideoInput,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::AudioInput => "audioinput",
            DeviceKind::AudioOutput => "audiooutput",
            DeviceKind::VideoInput => "videoinput",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl MediaDeviceInfo {
    pub fn new(device_id: impl Into<String>, label: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
            kind,
        }
    }
}

/// Host-side device access
pub trait MediaDevices: Send + Sync {
    fn enumerate(&self) -> BoxFuture<'static, Result<Vec<MediaDeviceInfo>, DeviceError>>;

    /// Open a microphone track (`None` = system default)
    fn open_microphone(
        &self,
        device: Option<&MediaDeviceInfo>,
    ) -> Result<Box<dyn AudioTrack>, DeviceError>;

    /// Open a speaker output (`None` = system default)
    fn open_speaker(
        &self,
        device: Option<&MediaDeviceInfo>,
    ) -> Result<Box<dyn AudioOutput>, DeviceError>;
}

#[derive(Debug, Default, Clone)]
struct Inventory {
    devices: Vec<MediaDeviceInfo>,
    selected: HashMap<DeviceKind, MediaDeviceInfo>,
}

/// Cached inventory plus per-stage selection
#[derive(Clone)]
pub struct DeviceManager {
    host: Arc<dyn MediaDevices>,
    bus: EventBus,
    inventory: Arc<Mutex<Inventory>>,
}

impl DeviceManager {
    pub fn new(host: Arc<dyn MediaDevices>, bus: EventBus) -> Self {
        Self {
            host,
            bus,
            inventory: Arc::new(Mutex::new(Inventory::default())),
        }
    }

    /// Re-read the inventory; publishes `DevicesChanged` when it differs
    pub async fn refresh(&self) -> Result<Vec<MediaDeviceInfo>, DeviceError> {
        let devices = self.host.enumerate().await.map_err(|e| {
            log::error!("Device enumeration failed: {}", e);
            e
        })?;

        let changed = {
            let mut inventory = self.inventory.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = inventory.devices != devices;
            inventory.devices = devices.clone();
            // A selected device that vanished falls back to the default
            let Inventory { devices: known, selected } = &mut *inventory;
            selected.retain(|_, chosen| known.iter().any(|d| d.device_id == chosen.device_id));
            changed
        };

        if changed {
            log::info!("Device inventory changed ({} devices)", devices.len());
            self.bus.publish(&TransportEvent::DevicesChanged(devices.clone()));
        }
        Ok(devices)
    }

    pub fn devices(&self, kind: DeviceKind) -> Vec<MediaDeviceInfo> {
        self.inventory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }

    pub fn microphones(&self) -> Vec<MediaDeviceInfo> {
        self.devices(DeviceKind::AudioInput)
    }

    pub fn speakers(&self) -> Vec<MediaDeviceInfo> {
        self.devices(DeviceKind::AudioOutput)
    }

    pub fn cameras(&self) -> Vec<MediaDeviceInfo> {
        self.devices(DeviceKind::VideoInput)
    }

    pub fn selected(&self, kind: DeviceKind) -> Option<MediaDeviceInfo> {
        self.inventory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .selected
            .get(&kind)
            .cloned()
    }

    /// Record a selection and publish `DeviceSelected`
    pub fn select(&self, kind: DeviceKind, device_id: &str) -> Result<MediaDeviceInfo, DeviceError> {
        let device = {
            let mut inventory = self.inventory.lock().unwrap_or_else(PoisonError::into_inner);
            let device = inventory
                .devices
                .iter()
                .find(|d| d.kind == kind && d.device_id == device_id)
                .cloned()
                .ok_or_else(|| DeviceError::NotFound(format!("{} {}", kind.as_str(), device_id)))?;
            inventory.selected.insert(kind, device.clone());
            device
        };

        log::info!("Selected {} device: {}", kind.as_str(), device.label);
        self.bus.publish(&TransportEvent::DeviceSelected(device.clone()));
        Ok(device)
    }

    pub fn open_microphone(&self) -> Result<Box<dyn AudioTrack>, DeviceError> {
        let selected = self.selected(DeviceKind::AudioInput);
        self.host.open_microphone(selected.as_ref())
    }

    pub fn open_speaker(&self) -> Result<Box<dyn AudioOutput>, DeviceError> {
        let selected = self.selected(DeviceKind::AudioOutput);
        self.host.open_speaker(selected.as_ref())
    }
}

#[derive(Default)]
struct StaticState {
    devices: Vec<MediaDeviceInfo>,
    fail_enumeration: Option<String>,
    feeds: HashMap<String, TrackFeed>,
    taps: HashMap<String, OutputTap>,
}

/// In-memory device host backed by manual tracks and outputs
///
/// Used headless and in tests: opened microphones are [`ManualTrack`]s whose
/// feeds can be fetched by device id, speakers are [`ManualOutput`]s.
#[derive(Clone, Default)]
pub struct StaticDevices {
    state: Arc<Mutex<StaticState>>,
}

pub const DEFAULT_DEVICE_ID: &str = "default";

impl StaticDevices {
    pub fn new(devices: Vec<MediaDeviceInfo>) -> Self {
        let this = Self::default();
        this.set_devices(devices);
        this
    }

    /// Simulate hot-plugging
    pub fn set_devices(&self, devices: Vec<MediaDeviceInfo>) {
        self.lock().devices = devices;
    }

    pub fn fail_enumeration(&self, reason: Option<&str>) {
        self.lock().fail_enumeration = reason.map(str::to_string);
    }

    /// Feed of the most recently opened microphone with this id
    pub fn microphone_feed(&self, device_id: &str) -> Option<TrackFeed> {
        self.lock().feeds.get(device_id).cloned()
    }

    pub fn speaker_tap(&self, device_id: &str) -> Option<OutputTap> {
        self.lock().taps.get(device_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(
        &self,
        kind: DeviceKind,
        device: Option<&MediaDeviceInfo>,
    ) -> Result<String, DeviceError> {
        match device {
            None => Ok(DEFAULT_DEVICE_ID.to_string()),
            Some(d) => {
                let known = self
                    .lock()
                    .devices
                    .iter()
                    .any(|x| x.kind == kind && x.device_id == d.device_id);
                if known {
                    Ok(d.device_id.clone())
                } else {
                    Err(DeviceError::Unavailable(d.device_id.clone()))
                }
            }
        }
    }
}

impl MediaDevices for StaticDevices {
    fn enumerate(&self) -> BoxFuture<'static, Result<Vec<MediaDeviceInfo>, DeviceError>> {
        let result = {
            let state = self.lock();
            match &state.fail_enumeration {
                Some(reason) => Err(DeviceError::Enumeration(reason.clone())),
                None => Ok(state.devices.clone()),
            }
        };
        Box::pin(async move { result })
    }

    fn open_microphone(
        &self,
        device: Option<&MediaDeviceInfo>,
    ) -> Result<Box<dyn AudioTrack>, DeviceError> {
        let id = self.resolve(DeviceKind::AudioInput, device)?;
        let (track, feed) = ManualTrack::new(id.clone());
        self.lock().feeds.insert(id, feed);
        Ok(Box::new(track))
    }

    fn open_speaker(
        &self,
        device: Option<&MediaDeviceInfo>,
    ) -> Result<Box<dyn AudioOutput>, DeviceError> {
        let id = self.resolve(DeviceKind::AudioOutput, device)?;
        let (output, tap) = ManualOutput::new(id.clone());
        self.lock().taps.insert(id, tap);
        Ok(Box::new(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> Vec<MediaDeviceInfo> {
        vec![
            MediaDeviceInfo::new("mic-1", "Built-in Microphone", DeviceKind::AudioInput),
            MediaDeviceInfo::new("mic-2", "USB Headset", DeviceKind::AudioInput),
            MediaDeviceInfo::new("spk-1", "Speakers", DeviceKind::AudioOutput),
            MediaDeviceInfo::new("cam-1", "Webcam", DeviceKind::VideoInput),
        ]
    }

    fn recorder(bus: &EventBus) -> Arc<Mutex<Vec<TransportEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[tokio::test]
    async fn test_refresh_filters_by_kind_and_notifies_once() {
        let host = StaticDevices::new(inventory());
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let manager = DeviceManager::new(Arc::new(host), bus);

        manager.refresh().await.unwrap();
        manager.refresh().await.unwrap();

        assert_eq!(manager.microphones().len(), 2);
        assert_eq!(manager.speakers().len(), 1);
        assert_eq!(manager.cameras()[0].device_id, "cam-1");

        let changes = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, TransportEvent::DevicesChanged(_)))
            .count();
        assert_eq!(changes, 1);
    }

    #[tokio::test]
    async fn test_select_unknown_device_is_not_found() {
        let manager = DeviceManager::new(Arc::new(StaticDevices::new(inventory())), EventBus::new());
        manager.refresh().await.unwrap();

        assert!(matches!(
            manager.select(DeviceKind::AudioInput, "spk-1"),
            Err(DeviceError::NotFound(_))
        ));
        assert_eq!(manager.selected(DeviceKind::AudioInput), None);
    }

    #[tokio::test]
    async fn test_selection_pushes_event_and_opens_that_device() {
        let host = StaticDevices::new(inventory());
        let bus = EventBus::new();
        let seen = recorder(&bus);
        let manager = DeviceManager::new(Arc::new(host.clone()), bus);
        manager.refresh().await.unwrap();

        let chosen = manager.select(DeviceKind::AudioInput, "mic-2").unwrap();
        assert_eq!(chosen.label, "USB Headset");
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, TransportEvent::DeviceSelected(d) if d.device_id == "mic-2")));

        let track = manager.open_microphone().unwrap();
        assert_eq!(track.id(), "mic-2");
        assert!(host.microphone_feed("mic-2").is_some());
    }

    #[tokio::test]
    async fn test_unplugged_selection_falls_back_to_default() {
        let host = StaticDevices::new(inventory());
        let manager = DeviceManager::new(Arc::new(host.clone()), EventBus::new());
        manager.refresh().await.unwrap();
        manager.select(DeviceKind::AudioOutput, "spk-1").unwrap();

        host.set_devices(inventory().into_iter().filter(|d| d.device_id != "spk-1").collect());
        manager.refresh().await.unwrap();

        assert_eq!(manager.selected(DeviceKind::AudioOutput), None);
        assert_eq!(manager.open_speaker().unwrap().id(), DEFAULT_DEVICE_ID);
    }

    #[tokio::test]
    async fn test_enumeration_failure_is_reported() {
        let host = StaticDevices::new(inventory());
        host.fail_enumeration(Some("permission denied"));
        let manager = DeviceManager::new(Arc::new(host), EventBus::new());

        assert_eq!(
            manager.refresh().await,
            Err(DeviceError::Enumeration("permission denied".to_string()))
        );
    }

    #[test]
    fn test_kind_wire_names() {
        let json = serde_json::to_string(&MediaDeviceInfo::new("a", "A", DeviceKind::AudioOutput)).unwrap();
        assert_eq!(json, r#"{"deviceId":"a","label":"A","kind":"audiooutput"}"#);
    }
}
