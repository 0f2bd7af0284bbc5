use std::time::Duration;

use log::{debug, info, warn};

use crate::{
    config::{NodeConfig, PinPolarity},
    connectivity::{DisplayChange, LinkOutcome},
    display::StatusScreen,
    io::{Collaborators, PowerController, PowerPin, SensorSuite, SeeingLink, StatusDisplay},
    seeing::{SeeingAction, SeeingEngine, SkyCheck},
    sky,
    state::PersistentState,
    types::{CloudState, SensorKind, SensorReading, TelemetryPayload},
};

const SENSOR_RAIL_POLARITY: PinPolarity = PinPolarity::ActiveHigh;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Sleep(Duration),
    Recovery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub reading: SensorReading,
    pub cloud: CloudState,
    pub outcome: LinkOutcome,
    pub seeing_actions: Vec<SeeingAction>,
    pub next: NextStep,
}

/// Runs one wake cycle against `state`. Collaborator failures are absorbed
/// into the reading's error tags and the retry counters.
pub fn run_cycle(
    state: &mut PersistentState,
    config: &NodeConfig,
    io: &mut Collaborators<'_>,
) -> CycleReport {
    if !state.has_initialized {
        load_credentials(state, io);
    }

    reapply_pins(state, config, io.power);

    let reading = read_sensors(state, config, io.sensors, io.seeing);

    let cloud = match reading.temperatures {
        Some(temps) => sky::classify(
            temps.ambient_c,
            temps.object_c,
            state.params.clear_setpoint,
            state.params.cloudy_setpoint,
        ),
        None => CloudState::Unknown,
    };
    state.cloud_state = cloud;
    info!("sky {}", cloud.as_str());

    let display_was_on = state.display_on;
    let outcome = exchange(state, &reading, io);
    let decision = state.link.record(outcome, &state.params);

    match state.link.update_display(
        &mut state.display_on,
        &state.params,
        config.display.connect_overhead_s,
    ) {
        Some(DisplayChange::TimedOut) => debug!("display timeout reached"),
        Some(DisplayChange::ForcedOn) => debug!("display forced on"),
        None => {}
    }
    if state.display_on != display_was_on {
        io.power
            .set_powered(PowerPin::Display, config.display.power_polarity, state.display_on);
    }

    let engine = SeeingEngine::new(&config.seeing, &state.params);
    let good = engine.is_good_sky(&SkyCheck {
        cloud,
        lux: reading.lux,
        raining: reading.raining,
        concentration: reading.concentration,
    });
    let seeing_actions = engine.evaluate(&mut state.seeing, good);
    engine.apply(&seeing_actions, io.power, io.seeing);
    info!(
        "seeing good={good} streaks good={} bad={} enabled={} powered={}",
        state.seeing.good_streak,
        state.seeing.bad_streak,
        state.seeing.enabled,
        state.seeing.powered
    );

    let next = if decision.enter_recovery {
        enter_recovery(state, config, io.power, io.display);
        NextStep::Recovery
    } else {
        if state.display_on {
            io.display.render(&StatusScreen::for_state(&state.link, cloud));
        }
        NextStep::Sleep(Duration::from_secs(u64::from(decision.sleep_s)))
    };

    CycleReport {
        reading,
        cloud,
        outcome,
        seeing_actions,
        next,
    }
}

/// Shows the fail-safe screen and powers down the sensors ahead of the
/// provisioning portal.
pub fn enter_recovery(
    state: &mut PersistentState,
    config: &NodeConfig,
    power: &mut dyn PowerController,
    display: &mut dyn StatusDisplay,
) {
    warn!(
        "retries exhausted (no wifi {}, server errors {}); entering recovery",
        state.link.no_wifi_count, state.link.server_error_count
    );
    if !state.display_on {
        state.display_on = true;
        power.set_powered(PowerPin::Display, config.display.power_polarity, true);
    }
    display.render(&StatusScreen::fail_safe(&state.link));
    power.set_powered(PowerPin::SensorRail, SENSOR_RAIL_POLARITY, false);
}

fn load_credentials(state: &mut PersistentState, io: &mut Collaborators<'_>) {
    match io.credentials.load() {
        Ok(Some(network)) => {
            info!("loaded credentials for `{}`", network.wifi_ssid);
            state.network = network;
        }
        Ok(None) => info!("no stored credentials; using fallback network"),
        Err(err) => warn!("failed to load credentials ({err}); using fallback network"),
    }
    state.has_initialized = true;
}

fn reapply_pins(state: &PersistentState, config: &NodeConfig, power: &mut dyn PowerController) {
    power.set_powered(PowerPin::SensorRail, SENSOR_RAIL_POLARITY, true);
    power.set_powered(PowerPin::Display, config.display.power_polarity, state.display_on);
    power.set_powered(PowerPin::Seeing, config.seeing.power_polarity, state.seeing.powered);
}

fn read_sensors(
    state: &PersistentState,
    config: &NodeConfig,
    sensors: &mut dyn SensorSuite,
    seeing: &mut dyn SeeingLink,
) -> SensorReading {
    let mut reading = SensorReading::default();

    match sensors.read_sky_temperatures() {
        Ok(temps) => reading.temperatures = Some(temps),
        Err(err) => {
            warn!("ir temperature read failed: {err}");
            reading.record_error(SensorKind::IrTemperature);
        }
    }
    match sensors.read_lux() {
        Ok(lux) => reading.lux = Some(lux),
        Err(err) => {
            warn!("light read failed: {err}");
            reading.record_error(SensorKind::Light);
        }
    }
    match sensors.read_sky_brightness(state.params.sqm_limit) {
        Ok(brightness) => reading.brightness = Some(brightness),
        Err(err) => {
            warn!("sky brightness read failed: {err}");
            reading.record_error(SensorKind::SkyBrightness);
        }
    }
    match sensors.read_particulates() {
        Ok(concentration) => reading.concentration = Some(concentration),
        Err(err) => {
            warn!("particulate read failed: {err}");
            reading.record_error(SensorKind::Particulate);
        }
    }
    match sensors.read_rain() {
        Ok(raining) => reading.raining = Some(raining),
        Err(err) => {
            warn!("rain read failed: {err}");
            reading.record_error(SensorKind::Rain);
        }
    }
    match sensors.read_lightning() {
        Ok(lightning) => reading.lightning = Some(lightning),
        Err(err) => {
            warn!("lightning read failed: {err}");
            reading.record_error(SensorKind::Lightning);
        }
    }

    if state.seeing.enabled {
        match seeing.query_seeing(config.seeing.handshake_timeout_ms) {
            Ok(value) => reading.seeing = Some(value),
            Err(err) => {
                warn!("seeing query failed: {err}");
                reading.record_error(SensorKind::Seeing);
            }
        }
    }

    reading
}

fn exchange(
    state: &mut PersistentState,
    reading: &SensorReading,
    io: &mut Collaborators<'_>,
) -> LinkOutcome {
    if !io.uplink.connect(&state.network) {
        warn!("no network link to `{}`", state.network.wifi_ssid);
        return LinkOutcome::NoLink;
    }

    if state.link.should_fetch_settings(&state.params) {
        match io.uplink.fetch_settings(&state.network) {
            Ok(remote) => {
                remote.apply_to(&mut state.params, &mut state.display_on);
                state.link.settings_loaded = true;
                info!("settings loaded: {:?}", state.params);
            }
            Err(err) => warn!("settings fetch failed: {err}"),
        }
    }

    let payload = TelemetryPayload::from_reading(reading, state.seeing.enabled);
    match io.uplink.post_telemetry(&state.network, &payload) {
        Ok(()) => LinkOutcome::Posted,
        Err(err) => {
            warn!("telemetry post failed: {err}");
            LinkOutcome::PostFailed
        }
    }
}
