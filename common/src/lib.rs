pub mod config;
pub mod connectivity;
pub mod cycle;
pub mod display;
pub mod endpoints;
pub mod error;
pub mod io;
pub mod recovery;
pub mod seeing;
pub mod sensors;
pub mod sky;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    NetworkConfig, NodeConfig, OperatingParams, PinPolarity, RecoveryExitPolicy, RemoteSettings,
};
pub use connectivity::{ConnectivityState, LinkOutcome, RetryDecision};
pub use cycle::{enter_recovery, run_cycle, CycleReport, NextStep};
pub use display::StatusScreen;
pub use endpoints::*;
pub use error::{LinkError, ProvisioningError, SensorError, SerialError, StateCodecError, StoreError};
pub use io::{
    Collaborators, CredentialStore, PowerController, PowerPin, SeeingLink, SensorSuite,
    StatusDisplay, Uplink,
};
pub use recovery::{ProvisioningForm, ProvisioningResponse, PROVISIONING_PAGE_HTML};
pub use seeing::{SeeingAction, SeeingEngine, SeeingState};
pub use state::PersistentState;
pub use types::{CloudState, Lightning, SensorKind, SensorReading, SkyBrightness, SkyTemperatures, TelemetryPayload};
