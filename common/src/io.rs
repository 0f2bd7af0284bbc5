//! Seams between the cycle logic and the hardware (or its simulation).

use crate::{
    config::{NetworkConfig, PinPolarity, RemoteSettings},
    display::StatusScreen,
    error::{LinkError, SensorError, SerialError, StoreError},
    types::{Lightning, SkyBrightness, SkyTemperatures, TelemetryPayload},
};

pub trait SensorSuite {
    fn read_sky_temperatures(&mut self) -> Result<SkyTemperatures, SensorError>;
    fn read_lux(&mut self) -> Result<f32, SensorError>;
    fn read_sky_brightness(&mut self, sqm_limit: f32) -> Result<SkyBrightness, SensorError>;
    fn read_particulates(&mut self) -> Result<f32, SensorError>;
    fn read_rain(&mut self) -> Result<bool, SensorError>;
    fn read_lightning(&mut self) -> Result<Lightning, SensorError>;
}

pub trait Uplink {
    /// Brings the station link up. Returns false when no network is reachable.
    fn connect(&mut self, network: &NetworkConfig) -> bool;
    fn fetch_settings(&mut self, network: &NetworkConfig) -> Result<RemoteSettings, LinkError>;
    fn post_telemetry(
        &mut self,
        network: &NetworkConfig,
        payload: &TelemetryPayload,
    ) -> Result<(), LinkError>;
}

/// Line protocol to the auxiliary imaging subsystem.
pub trait SeeingLink {
    fn query_seeing(&mut self, timeout_ms: u64) -> Result<f32, SerialError>;
    fn shutdown(&mut self, timeout_ms: u64) -> Result<(), SerialError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerPin {
    SensorRail,
    Display,
    Seeing,
}

impl PowerPin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SensorRail => "sensor_rail",
            Self::Display => "display",
            Self::Seeing => "seeing",
        }
    }
}

/// Pin output that is latched so it survives deep sleep.
pub trait PowerController {
    fn hold_high(&mut self, pin: PowerPin);
    fn hold_low(&mut self, pin: PowerPin);

    fn set_powered(&mut self, pin: PowerPin, polarity: PinPolarity, on: bool) {
        match (polarity, on) {
            (PinPolarity::ActiveHigh, true) | (PinPolarity::ActiveLow, false) => self.hold_high(pin),
            (PinPolarity::ActiveHigh, false) | (PinPolarity::ActiveLow, true) => self.hold_low(pin),
        }
    }
}

pub trait StatusDisplay {
    fn render(&mut self, screen: &StatusScreen);
}

pub trait CredentialStore {
    fn load(&mut self) -> Result<Option<NetworkConfig>, StoreError>;
    fn save(&mut self, network: &NetworkConfig) -> Result<(), StoreError>;
}

/// Everything one wake cycle talks to.
pub struct Collaborators<'a> {
    pub sensors: &'a mut dyn SensorSuite,
    pub uplink: &'a mut dyn Uplink,
    pub seeing: &'a mut dyn SeeingLink,
    pub power: &'a mut dyn PowerController,
    pub display: &'a mut dyn StatusDisplay,
    pub credentials: &'a mut dyn CredentialStore,
}
