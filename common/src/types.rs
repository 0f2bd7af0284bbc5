use serde::{Deserialize, Serialize};

use crate::endpoints::{INVALID_READING, INVALID_READING_STR};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloudState {
    #[default]
    Unknown,
    Clear,
    PartlyCloudy,
    Cloudy,
}

impl CloudState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Clear => "CLEAR",
            Self::PartlyCloudy => "PARTLY_CLOUDY",
            Self::Cloudy => "CLOUDY",
        }
    }
}

/// Tag recorded for a sensor whose read failed during the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    IrTemperature,
    Light,
    SkyBrightness,
    Particulate,
    Rain,
    Lightning,
    Seeing,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IrTemperature => "ir_temperature",
            Self::Light => "light",
            Self::SkyBrightness => "sky_brightness",
            Self::Particulate => "particulate",
            Self::Rain => "rain",
            Self::Lightning => "lightning",
            Self::Seeing => "seeing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Lightning {
    Quiet,
    Strike { distance_km: u8 },
}

impl Lightning {
    pub fn distance_value(self) -> f32 {
        match self {
            Self::Quiet => -1.0,
            Self::Strike { distance_km } => f32::from(distance_km),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyTemperatures {
    pub ambient_c: f32,
    pub object_c: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyBrightness {
    pub magnitude: f32,
    pub nelm: f32,
}

/// One cycle's worth of readings. `None` means the read failed and the
/// matching tag is in `errors`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    pub temperatures: Option<SkyTemperatures>,
    pub lux: Option<f32>,
    pub brightness: Option<SkyBrightness>,
    pub concentration: Option<f32>,
    pub raining: Option<bool>,
    pub lightning: Option<Lightning>,
    pub seeing: Option<f32>,
    pub errors: Vec<SensorKind>,
}

impl SensorReading {
    pub fn record_error(&mut self, kind: SensorKind) {
        if !self.errors.contains(&kind) {
            self.errors.push(kind);
        }
    }

    pub fn errors_joined(&self) -> String {
        self.errors
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Body of the telemetry POST. The collection server expects every value as a
/// string and booleans as `"1"` / `"0"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryPayload {
    pub raining: String,
    pub luminosity: String,
    pub seeing: String,
    pub nelm: String,
    pub concentration: String,
    pub object: String,
    pub ambient: String,
    pub lux: String,
    #[serde(rename = "lightning_distanceToStorm")]
    pub lightning_distance_to_storm: String,
    pub errors: String,
    #[serde(rename = "isSeeing")]
    pub is_seeing: String,
}

impl TelemetryPayload {
    pub fn from_reading(reading: &SensorReading, seeing_enabled: bool) -> Self {
        let temps = reading.temperatures;
        let brightness = reading.brightness;

        Self {
            raining: match reading.raining {
                Some(raining) => flag(raining),
                None => INVALID_READING_STR.to_string(),
            },
            luminosity: number(brightness.map(|b| b.magnitude)),
            seeing: match reading.seeing {
                Some(value) => fixed(value),
                None => INVALID_READING_STR.to_string(),
            },
            nelm: number(brightness.map(|b| b.nelm)),
            concentration: number(reading.concentration),
            object: number(temps.map(|t| t.object_c)),
            ambient: number(temps.map(|t| t.ambient_c)),
            lux: number(reading.lux),
            lightning_distance_to_storm: number(reading.lightning.map(Lightning::distance_value)),
            errors: reading.errors_joined(),
            is_seeing: flag(seeing_enabled),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn fixed(value: f32) -> String {
    format!("{value:.2}")
}

fn number(value: Option<f32>) -> String {
    fixed(value.filter(|v| v.is_finite()).unwrap_or(INVALID_READING))
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}
