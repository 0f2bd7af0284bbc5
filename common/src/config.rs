use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::endpoints::{DEFAULT_SERVER_PORT, FETCH_SETTINGS_PATH, SEND_VALUES_PATH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinPolarity {
    ActiveHigh,
    ActiveLow,
}

/// What recovery mode does once the provisioning window closes untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryExitPolicy {
    SleepForever,
    RestartPortal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeeingConfig {
    /// Matching entries in the rolling window needed to clear the opposite streak.
    pub window_reset_count: u8,
    pub power_cut_buffer_s: u32,
    pub handshake_timeout_ms: u64,
    pub require_dry_sky: bool,
    pub max_concentration: Option<f32>,
    pub power_polarity: PinPolarity,
}

impl Default for SeeingConfig {
    fn default() -> Self {
        Self {
            window_reset_count: 3,
            power_cut_buffer_s: 60,
            handshake_timeout_ms: 15_000,
            require_dry_sky: true,
            max_concentration: None,
            power_polarity: PinPolarity::ActiveLow,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub window_s: u64,
    pub exit_policy: RecoveryExitPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            window_s: 1_200,
            exit_policy: RecoveryExitPolicy::SleepForever,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub power_polarity: PinPolarity,
    /// Seconds added per failed wifi cycle when estimating how long the display has been on.
    pub connect_overhead_s: u32,
    pub start_on: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            power_polarity: PinPolarity::ActiveHigh,
            connect_overhead_s: 10,
            start_on: true,
        }
    }
}

/// Parameters the collection server may override through the settings fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingParams {
    pub sleep_time_s: u32,
    pub no_wifi_sleep_s: u32,
    pub max_retries: u32,
    pub display_timeout_s: u32,
    pub seeing_threshold: u32,
    pub clear_setpoint: f32,
    pub cloudy_setpoint: f32,
    pub max_lux: f32,
    pub sqm_limit: f32,
    pub check_everytime: bool,
}

impl Default for OperatingParams {
    fn default() -> Self {
        Self {
            sleep_time_s: 20,
            no_wifi_sleep_s: 5,
            max_retries: 3,
            display_timeout_s: 200,
            seeing_threshold: 3,
            clear_setpoint: 22.0,
            cloudy_setpoint: 2.0,
            max_lux: 50.0,
            sqm_limit: 21.83,
            check_everytime: false,
        }
    }
}

impl OperatingParams {
    pub fn sanitize(&mut self) {
        let fallback = Self::default();

        self.sleep_time_s = self.sleep_time_s.clamp(1, 86_400);
        self.no_wifi_sleep_s = self.no_wifi_sleep_s.clamp(1, 86_400);
        self.max_retries = self.max_retries.max(1);
        self.seeing_threshold = self.seeing_threshold.max(1);

        if !self.max_lux.is_finite() {
            self.max_lux = fallback.max_lux;
        }
        if !self.sqm_limit.is_finite() {
            self.sqm_limit = fallback.sqm_limit;
        }
        if !self.clear_setpoint.is_finite() || !self.cloudy_setpoint.is_finite() {
            self.clear_setpoint = fallback.clear_setpoint;
            self.cloudy_setpoint = fallback.cloudy_setpoint;
        }

        if self.clear_setpoint < self.cloudy_setpoint {
            warn!(
                "clear setpoint {} below cloudy setpoint {}; swapping",
                self.clear_setpoint, self.cloudy_setpoint
            );
            core::mem::swap(&mut self.clear_setpoint, &mut self.cloudy_setpoint);
        } else if self.clear_setpoint == self.cloudy_setpoint {
            warn!(
                "clear and cloudy setpoints both {}; separating by 1",
                self.clear_setpoint
            );
            self.clear_setpoint += 1.0;
        }
    }

    /// Extra cycles after the shutdown handshake before power is cut.
    pub fn power_cut_buffer_cycles(&self, buffer_s: u32) -> u32 {
        buffer_s.div_ceil(self.sleep_time_s.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub server_ip: String,
    pub server_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: "SQM".to_string(),
            wifi_pass: "Passw0rt".to_string(),
            server_ip: "192.168.43.130".to_string(),
            server_port: DEFAULT_SERVER_PORT,
        }
    }
}

impl NetworkConfig {
    pub fn send_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.server_ip, self.server_port, SEND_VALUES_PATH
        )
    }

    pub fn fetch_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.server_ip, self.server_port, FETCH_SETTINGS_PATH
        )
    }

    pub fn has_station_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub seeing: SeeingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub defaults: OperatingParams,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.defaults.sanitize();
        self.seeing.window_reset_count = self.seeing.window_reset_count.clamp(1, 5);
        self.seeing.handshake_timeout_ms = self.seeing.handshake_timeout_ms.clamp(100, 60_000);
        if self.seeing.max_concentration.is_some_and(|limit| !limit.is_finite()) {
            self.seeing.max_concentration = None;
        }
        self.recovery.window_s = self.recovery.window_s.max(1);
    }
}

/// Body of the settings fetch. Every key is optional and coerced on its own;
/// absent or unusable keys keep the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteSettings {
    pub seeing_thr: Option<i64>,
    pub setpoint1: Option<f64>,
    pub setpoint2: Option<f64>,
    pub max_lux: Option<f64>,
    pub sleep_time_s: Option<i64>,
    pub display_timeout_s: Option<i64>,
    pub display_on: Option<bool>,
    pub check_everytime: Option<bool>,
    pub set_sqm_limit: Option<f64>,
}

impl RemoteSettings {
    /// Fails only when the body is not a JSON object.
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        let fields: Map<String, Value> = serde_json::from_slice(body)?;
        Ok(Self {
            seeing_thr: remote_key(&fields, "seeing_thr", as_int),
            setpoint1: remote_key(&fields, "setpoint1", as_float),
            setpoint2: remote_key(&fields, "setpoint2", as_float),
            max_lux: remote_key(&fields, "max_lux", as_float),
            sleep_time_s: remote_key(&fields, "SLEEPTIME_s", as_int),
            display_timeout_s: remote_key(&fields, "DISPLAY_TIMEOUT_s", as_int),
            display_on: remote_key(&fields, "DISPLAY_ON", as_flag),
            check_everytime: remote_key(&fields, "check_everytime", as_flag),
            set_sqm_limit: remote_key(&fields, "set_sqm_limit", as_float),
        })
    }

    /// Merges the present keys into `params` and the display flag, then
    /// re-validates the result.
    pub fn apply_to(&self, params: &mut OperatingParams, display_on: &mut bool) {
        if let Some(value) = self.seeing_thr {
            params.seeing_threshold = clamp_u32(value);
        }
        if let Some(value) = self.setpoint1 {
            params.clear_setpoint = value as f32;
        }
        if let Some(value) = self.setpoint2 {
            params.cloudy_setpoint = value as f32;
        }
        if let Some(value) = self.max_lux {
            params.max_lux = value as f32;
        }
        if let Some(value) = self.sleep_time_s {
            params.sleep_time_s = clamp_u32(value);
        }
        if let Some(value) = self.display_timeout_s {
            params.display_timeout_s = clamp_u32(value);
        }
        if let Some(value) = self.check_everytime {
            params.check_everytime = value;
        }
        if let Some(value) = self.set_sqm_limit {
            params.sqm_limit = value as f32;
        }
        if let Some(value) = self.display_on {
            *display_on = value;
        }

        params.sanitize();
    }
}

fn clamp_u32(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

fn remote_key<T>(
    fields: &Map<String, Value>,
    key: &str,
    coerce: fn(&Value) -> Option<T>,
) -> Option<T> {
    let value = fields.get(key).filter(|value| !value.is_null())?;
    let coerced = coerce(value);
    if coerced.is_none() {
        warn!("ignoring settings key `{key}`: unusable value {value}");
    }
    coerced
}

fn as_float(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn as_int(value: &Value) -> Option<i64> {
    if let Value::Number(number) = value {
        if let Some(int) = number.as_i64() {
            return Some(int);
        }
    }
    as_float(value).map(|number| number.trunc() as i64)
}

// The settings server has sent both `true` and `1` for boolean keys.
fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) if text.trim().eq_ignore_ascii_case("true") => Some(true),
        Value::String(text) if text.trim().eq_ignore_ascii_case("false") => Some(false),
        _ => as_float(value).map(|number| number != 0.0),
    }
}
