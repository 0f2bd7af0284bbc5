use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor not responding")]
    NotResponding,
    #[error("sensor reported an error flag")]
    Flagged,
    #[error("reading saturated")]
    Saturated,
    #[error("reading out of range: {0}")]
    OutOfRange(f32),
    #[error("bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid settings body: {0}")]
    Body(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("no reply within {0} ms")]
    Timeout(u64),
    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(String),
    #[error("serial io: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("stored value is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StateCodecError {
    #[error("unsupported state version {found}, expected {expected}")]
    Version { found: u16, expected: u16 },
    #[error("state does not fit the retained buffer ({len} > {capacity} bytes)")]
    TooLarge { len: usize, capacity: usize },
    #[error("malformed state: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("ssid must not be empty")]
    EmptySsid,
    #[error("ssid longer than 32 bytes")]
    SsidTooLong,
    #[error("password longer than 64 bytes")]
    PasswordTooLong,
    #[error("invalid server ip {0:?}")]
    InvalidIp(String),
}
