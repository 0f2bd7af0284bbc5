use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    config::{NetworkConfig, NodeConfig, OperatingParams},
    connectivity::ConnectivityState,
    error::StateCodecError,
    seeing::SeeingState,
    types::CloudState,
};

pub const STATE_VERSION: u16 = 1;

/// Everything that has to survive deep sleep. Loaded at wake, mutated by one
/// cycle, stored again before sleeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    pub version: u16,
    pub has_initialized: bool,
    pub link: ConnectivityState,
    pub display_on: bool,
    pub cloud_state: CloudState,
    pub seeing: SeeingState,
    pub params: OperatingParams,
    pub network: NetworkConfig,
}

impl PersistentState {
    pub fn new(config: &NodeConfig) -> Self {
        let mut params = config.defaults.clone();
        params.sanitize();
        Self {
            version: STATE_VERSION,
            has_initialized: false,
            link: ConnectivityState::default(),
            display_on: config.display.start_on,
            cloud_state: CloudState::Unknown,
            seeing: SeeingState::default(),
            params,
            network: config.network.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StateCodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StateCodecError> {
        let mut state: Self = serde_json::from_slice(bytes)?;
        if state.version != STATE_VERSION {
            return Err(StateCodecError::Version {
                found: state.version,
                expected: STATE_VERSION,
            });
        }
        state.params.sanitize();
        Ok(state)
    }

    /// Writes a little-endian u32 length prefix and the encoded state into a
    /// fixed retained buffer.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, StateCodecError> {
        let body = self.encode()?;
        let len = body.len() + 4;
        if len > buf.len() {
            return Err(StateCodecError::TooLarge {
                len,
                capacity: buf.len(),
            });
        }
        let prefix = u32::try_from(body.len()).map_err(|_| StateCodecError::TooLarge {
            len,
            capacity: buf.len(),
        })?;
        buf[..4].copy_from_slice(&prefix.to_le_bytes());
        buf[4..len].copy_from_slice(&body);
        Ok(len)
    }

    /// Reads what [`Self::encode_into`] wrote. A zeroed buffer (cold boot)
    /// yields `None`.
    pub fn decode_from(buf: &[u8]) -> Result<Option<Self>, StateCodecError> {
        let Some(prefix) = buf.get(..4) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(prefix);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 {
            return Ok(None);
        }
        let too_large = StateCodecError::TooLarge {
            len: len.saturating_add(4),
            capacity: buf.len(),
        };
        let end = len.checked_add(4).ok_or(too_large)?;
        let body = buf.get(4..end).ok_or(StateCodecError::TooLarge {
            len: end,
            capacity: buf.len(),
        })?;
        Self::decode(body).map(Some)
    }

    /// Falls back to a fresh state when the stored one is missing or unreadable.
    pub fn restore(stored: Result<Option<Self>, StateCodecError>, config: &NodeConfig) -> Self {
        match stored {
            Ok(Some(state)) => state,
            Ok(None) => Self::new(config),
            Err(err) => {
                warn!("discarding stored state: {err}");
                Self::new(config)
            }
        }
    }
}
