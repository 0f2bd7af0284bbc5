//! In-memory collaborators for unit tests.

use std::collections::HashMap;

use crate::{
    config::{NetworkConfig, RemoteSettings},
    display::StatusScreen,
    error::{LinkError, SensorError, SerialError, StoreError},
    io::{CredentialStore, PowerController, PowerPin, SeeingLink, SensorSuite, StatusDisplay, Uplink},
    sensors,
    types::{Lightning, SkyBrightness, SkyTemperatures, TelemetryPayload},
};

#[derive(Debug, Clone)]
pub struct FakeSensors {
    pub temperatures: Option<SkyTemperatures>,
    pub lux: Option<f32>,
    pub frequency_hz: Option<f32>,
    pub concentration: Option<f32>,
    pub raining: Option<bool>,
    pub lightning: Option<Lightning>,
}

impl FakeSensors {
    pub fn clear_night() -> Self {
        Self {
            temperatures: Some(SkyTemperatures {
                ambient_c: 10.0,
                object_c: -18.0,
            }),
            lux: Some(0.05),
            frequency_hz: Some(3.0),
            concentration: Some(80.0),
            raining: Some(false),
            lightning: Some(Lightning::Quiet),
        }
    }
}

impl SensorSuite for FakeSensors {
    fn read_sky_temperatures(&mut self) -> Result<SkyTemperatures, SensorError> {
        self.temperatures.ok_or(SensorError::NotResponding)
    }

    fn read_lux(&mut self) -> Result<f32, SensorError> {
        self.lux.ok_or(SensorError::NotResponding)
    }

    fn read_sky_brightness(&mut self, sqm_limit: f32) -> Result<SkyBrightness, SensorError> {
        let frequency = self.frequency_hz.ok_or(SensorError::NotResponding)?;
        sensors::sky_brightness(frequency, sqm_limit)
    }

    fn read_particulates(&mut self) -> Result<f32, SensorError> {
        self.concentration.ok_or(SensorError::NotResponding)
    }

    fn read_rain(&mut self) -> Result<bool, SensorError> {
        self.raining.ok_or(SensorError::NotResponding)
    }

    fn read_lightning(&mut self) -> Result<Lightning, SensorError> {
        self.lightning.ok_or(SensorError::NotResponding)
    }
}

#[derive(Debug, Clone)]
pub struct FakeUplink {
    pub link: bool,
    pub post_ok: bool,
    pub settings: Option<RemoteSettings>,
    pub fetches: u32,
    pub posts: Vec<TelemetryPayload>,
    pub last_ssid: Option<String>,
}

impl FakeUplink {
    pub fn online() -> Self {
        Self {
            link: true,
            post_ok: true,
            settings: Some(RemoteSettings::default()),
            fetches: 0,
            posts: Vec::new(),
            last_ssid: None,
        }
    }
}

impl Uplink for FakeUplink {
    fn connect(&mut self, network: &NetworkConfig) -> bool {
        self.last_ssid = Some(network.wifi_ssid.clone());
        self.link
    }

    fn fetch_settings(&mut self, _network: &NetworkConfig) -> Result<RemoteSettings, LinkError> {
        self.fetches += 1;
        self.settings.clone().ok_or(LinkError::Status(500))
    }

    fn post_telemetry(
        &mut self,
        _network: &NetworkConfig,
        payload: &TelemetryPayload,
    ) -> Result<(), LinkError> {
        if self.post_ok {
            self.posts.push(payload.clone());
            Ok(())
        } else {
            Err(LinkError::Status(503))
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeSeeingLink {
    pub seeing_reply: Result<f32, ()>,
    pub shutdown_reply: Result<(), ()>,
    pub queries: u32,
    pub shutdowns: u32,
}

impl Default for FakeSeeingLink {
    fn default() -> Self {
        Self {
            seeing_reply: Ok(1.5),
            shutdown_reply: Ok(()),
            queries: 0,
            shutdowns: 0,
        }
    }
}

impl SeeingLink for FakeSeeingLink {
    fn query_seeing(&mut self, timeout_ms: u64) -> Result<f32, SerialError> {
        self.queries += 1;
        self.seeing_reply.map_err(|()| SerialError::Timeout(timeout_ms))
    }

    fn shutdown(&mut self, timeout_ms: u64) -> Result<(), SerialError> {
        self.shutdowns += 1;
        self.shutdown_reply.map_err(|()| SerialError::Timeout(timeout_ms))
    }
}

/// Records every latched level as `(pin, high)`.
#[derive(Debug, Clone, Default)]
pub struct RecordingPower {
    pub log: Vec<(PowerPin, bool)>,
    levels: HashMap<PowerPin, bool>,
}

impl RecordingPower {
    pub fn level(&self, pin: PowerPin) -> Option<bool> {
        self.levels.get(&pin).copied()
    }

    fn record(&mut self, pin: PowerPin, high: bool) {
        self.log.push((pin, high));
        self.levels.insert(pin, high);
    }
}

impl PowerController for RecordingPower {
    fn hold_high(&mut self, pin: PowerPin) {
        self.record(pin, true);
    }

    fn hold_low(&mut self, pin: PowerPin) {
        self.record(pin, false);
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingDisplay {
    pub screens: Vec<StatusScreen>,
}

impl StatusDisplay for RecordingDisplay {
    fn render(&mut self, screen: &StatusScreen) {
        self.screens.push(screen.clone());
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCredentials {
    pub stored: Option<NetworkConfig>,
    pub loads: u32,
}

impl CredentialStore for MemoryCredentials {
    fn load(&mut self) -> Result<Option<NetworkConfig>, StoreError> {
        self.loads += 1;
        Ok(self.stored.clone())
    }

    fn save(&mut self, network: &NetworkConfig) -> Result<(), StoreError> {
        self.stored = Some(network.clone());
        Ok(())
    }
}
