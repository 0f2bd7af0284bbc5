pub const SEND_VALUES_PATH: &str = "/SQM";
pub const FETCH_SETTINGS_PATH: &str = "/getsettings";
pub const DEFAULT_SERVER_PORT: u16 = 5000;

pub const SERIAL_BAUD: u32 = 9_600;
pub const SERIAL_CMD_GET: &str = "get";
pub const SERIAL_CMD_SHUT: &str = "shut";
pub const SERIAL_REPLY_OK: &str = "ok";

pub const RECOVERY_AP_SSID: &str = "ESP-WIFI-MANAGER";
pub const RECOVERY_AP_IP: [u8; 4] = [192, 168, 1, 2];

/// Placeholder sent for any reading that could not be taken.
pub const INVALID_READING: f32 = -333.0;
pub const INVALID_READING_STR: &str = "-333";
