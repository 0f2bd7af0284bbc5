use std::collections::VecDeque;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::{OperatingParams, SeeingConfig},
    endpoints::SERIAL_REPLY_OK,
    error::SerialError,
    io::{PowerController, PowerPin, SeeingLink},
    types::CloudState,
};

pub const RECENT_CHECKS_CAPACITY: usize = 5;

/// Newest-first window of the last few good/bad sky checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<bool>", into = "Vec<bool>")]
pub struct RecentChecks(VecDeque<bool>);

impl RecentChecks {
    pub fn push(&mut self, good: bool) {
        self.0.push_front(good);
        self.0.truncate(RECENT_CHECKS_CAPACITY);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn count(&self, good: bool) -> usize {
        self.0.iter().filter(|&&check| check == good).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.0.iter().copied()
    }
}

impl From<Vec<bool>> for RecentChecks {
    fn from(mut checks: Vec<bool>) -> Self {
        checks.truncate(RECENT_CHECKS_CAPACITY);
        Self(checks.into())
    }
}

impl From<RecentChecks> for Vec<bool> {
    fn from(checks: RecentChecks) -> Self {
        checks.0.into()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeeingState {
    pub good_streak: u32,
    pub bad_streak: u32,
    pub recent_checks: RecentChecks,
    /// Imaging requested. Implies `powered`.
    pub enabled: bool,
    /// Power pin on. Stays on after `enabled` drops until the power cut.
    pub powered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeeingAction {
    PowerOn,
    Shutdown,
    CutPower,
}

/// Inputs to the good-sky test for one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyCheck {
    pub cloud: CloudState,
    pub lux: Option<f32>,
    pub raining: Option<bool>,
    pub concentration: Option<f32>,
}

pub struct SeeingEngine<'a> {
    config: &'a SeeingConfig,
    params: &'a OperatingParams,
}

impl<'a> SeeingEngine<'a> {
    pub fn new(config: &'a SeeingConfig, params: &'a OperatingParams) -> Self {
        Self { config, params }
    }

    pub fn is_good_sky(&self, check: &SkyCheck) -> bool {
        if check.cloud != CloudState::Clear {
            return false;
        }
        if !check.lux.is_some_and(|lux| lux < self.params.max_lux) {
            return false;
        }
        if self.config.require_dry_sky && check.raining != Some(false) {
            return false;
        }
        match self.config.max_concentration {
            Some(limit) => check.concentration.is_some_and(|c| c < limit),
            None => true,
        }
    }

    /// Folds one check into `state` and returns the actuations it calls for.
    pub fn evaluate(&self, state: &mut SeeingState, good: bool) -> Vec<SeeingAction> {
        let threshold = self.params.seeing_threshold.max(1);
        let reset_count = usize::from(self.config.window_reset_count);
        let mut actions = Vec::new();

        state.recent_checks.push(good);

        if good {
            state.good_streak = state.good_streak.saturating_add(1);
            if state.recent_checks.count(true) >= reset_count {
                state.bad_streak = 0;
            }

            if state.good_streak >= threshold && !state.enabled {
                if state.powered {
                    // Still powered from a shutdown that was never cut; it already got "shut".
                    actions.push(SeeingAction::CutPower);
                }
                actions.push(SeeingAction::PowerOn);
                state.enabled = true;
                state.powered = true;
                state.bad_streak = 0;
            }
        } else {
            state.bad_streak = state.bad_streak.saturating_add(1);
            if state.recent_checks.count(false) >= reset_count {
                state.good_streak = 0;
            }

            let cut_at = threshold.saturating_add(
                self.params
                    .power_cut_buffer_cycles(self.config.power_cut_buffer_s),
            );

            if state.enabled && state.bad_streak >= threshold {
                actions.push(SeeingAction::Shutdown);
                state.enabled = false;
            }
            if state.powered && !state.enabled && state.bad_streak >= cut_at {
                actions.push(SeeingAction::CutPower);
                state.powered = false;
            }
        }

        actions
    }

    /// Executes actions from [`Self::evaluate`]. Handshake failures are logged
    /// and never hold up the power schedule.
    pub fn apply(
        &self,
        actions: &[SeeingAction],
        power: &mut dyn PowerController,
        link: &mut dyn SeeingLink,
    ) {
        let polarity = self.config.power_polarity;
        for action in actions {
            match action {
                SeeingAction::PowerOn => {
                    info!("seeing subsystem power on");
                    power.set_powered(PowerPin::Seeing, polarity, true);
                }
                SeeingAction::Shutdown => {
                    match link.shutdown(self.config.handshake_timeout_ms) {
                        Ok(()) => info!("seeing subsystem acknowledged shutdown"),
                        Err(err) => warn!("seeing shutdown handshake failed: {err}"),
                    }
                }
                SeeingAction::CutPower => {
                    info!("seeing subsystem power cut");
                    power.set_powered(PowerPin::Seeing, polarity, false);
                }
            }
        }
    }
}

/// Accepts a seeing reply only when it is a positive number of more than two
/// characters, e.g. `"1.42"`.
pub fn parse_seeing_reply(reply: &str) -> Result<f32, SerialError> {
    let trimmed = reply.trim();
    match trimmed.parse::<f32>() {
        Ok(value) if trimmed.len() > 2 && value.is_finite() && value > 0.0 => Ok(value),
        _ => Err(SerialError::UnexpectedReply(trimmed.to_string())),
    }
}

pub fn check_shutdown_reply(reply: &str) -> Result<(), SerialError> {
    let trimmed = reply.trim();
    if trimmed == SERIAL_REPLY_OK {
        Ok(())
    } else {
        Err(SerialError::UnexpectedReply(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{FakeSeeingLink, RecordingPower};

    fn params(threshold: u32, sleep_time_s: u32) -> OperatingParams {
        OperatingParams {
            seeing_threshold: threshold,
            sleep_time_s,
            ..OperatingParams::default()
        }
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let mut checks = RecentChecks::default();
        for i in 0..50 {
            checks.push(i % 3 == 0);
            assert!(checks.len() <= RECENT_CHECKS_CAPACITY);
        }
        assert_eq!(checks.len(), RECENT_CHECKS_CAPACITY);
    }

    #[test]
    fn window_is_newest_first() {
        let mut checks = RecentChecks::default();
        for good in [true, true, false, false, false, true] {
            checks.push(good);
        }
        assert_eq!(checks.iter().collect::<Vec<_>>(), vec![true, false, false, false, true]);
    }

    #[test]
    fn oversized_window_is_truncated_on_decode() {
        let checks: RecentChecks = serde_json::from_str("[true,true,true,false,false,false,false]").unwrap();
        assert_eq!(checks.len(), RECENT_CHECKS_CAPACITY);
    }

    #[test]
    fn enables_once_on_third_good_cycle() {
        let config = SeeingConfig::default();
        let params = params(3, 20);
        let engine = SeeingEngine::new(&config, &params);
        let mut state = SeeingState::default();

        let per_cycle: Vec<_> = (0..5).map(|_| engine.evaluate(&mut state, true)).collect();

        assert_eq!(
            per_cycle,
            vec![
                vec![],
                vec![],
                vec![SeeingAction::PowerOn],
                vec![],
                vec![],
            ]
        );
        assert!(state.enabled);
        assert!(state.powered);
    }

    #[test]
    fn shutdown_then_power_cut_exactly_once() {
        let config = SeeingConfig::default();
        let params = params(3, 20);
        let engine = SeeingEngine::new(&config, &params);
        let mut state = SeeingState::default();
        for _ in 0..3 {
            engine.evaluate(&mut state, true);
        }

        let mut shutdown_at = Vec::new();
        let mut cut_at = Vec::new();
        for cycle in 1..=12 {
            for action in engine.evaluate(&mut state, false) {
                match action {
                    SeeingAction::Shutdown => shutdown_at.push(cycle),
                    SeeingAction::CutPower => cut_at.push(cycle),
                    SeeingAction::PowerOn => panic!("unexpected power on"),
                }
            }
            assert!(!state.enabled || state.powered);
        }

        // 60 s buffer at 20 s sleep is three extra cycles.
        assert_eq!(shutdown_at, vec![3]);
        assert_eq!(cut_at, vec![6]);
        assert_eq!(state, SeeingState { recent_checks: state.recent_checks.clone(), bad_streak: 12, ..SeeingState::default() });
    }

    #[test]
    fn disabled_engine_never_handshakes() {
        let config = SeeingConfig::default();
        let params = params(3, 20);
        let engine = SeeingEngine::new(&config, &params);
        let mut state = SeeingState::default();

        for _ in 0..20 {
            assert_eq!(engine.evaluate(&mut state, false), vec![]);
        }
        assert_eq!(state.good_streak, 0);
    }

    #[test]
    fn streaks_never_grow_together() {
        let config = SeeingConfig::default();
        let params = params(3, 20);
        let engine = SeeingEngine::new(&config, &params);
        let mut state = SeeingState::default();

        for good in [true, false, true, true, false, false, true, false, false, false] {
            let before = (state.good_streak, state.bad_streak);
            engine.evaluate(&mut state, good);
            let grew_good = state.good_streak > before.0;
            let grew_bad = state.bad_streak > before.1;
            assert!(!(grew_good && grew_bad));
        }
    }

    #[test]
    fn mixed_window_resets_opposite_streak() {
        let config = SeeingConfig::default();
        let params = params(5, 20);
        let engine = SeeingEngine::new(&config, &params);
        let mut state = SeeingState::default();

        for good in [false, false, true, true] {
            engine.evaluate(&mut state, good);
        }
        assert_eq!(state.bad_streak, 2);

        engine.evaluate(&mut state, true);
        assert_eq!(state.good_streak, 3);
        assert_eq!(state.bad_streak, 0);
    }

    #[test]
    fn relapse_during_grace_power_cycles_subsystem() {
        let config = SeeingConfig {
            window_reset_count: 2,
            ..SeeingConfig::default()
        };
        let params = params(2, 20);
        let engine = SeeingEngine::new(&config, &params);
        let mut state = SeeingState::default();

        engine.evaluate(&mut state, true);
        engine.evaluate(&mut state, true);
        engine.evaluate(&mut state, false);
        assert_eq!(engine.evaluate(&mut state, false), vec![SeeingAction::Shutdown]);
        assert!(state.powered && !state.enabled);

        engine.evaluate(&mut state, true);
        assert_eq!(
            engine.evaluate(&mut state, true),
            vec![SeeingAction::CutPower, SeeingAction::PowerOn]
        );
        assert!(state.enabled && state.powered);
        assert_eq!(state.bad_streak, 0);
    }

    #[test]
    fn good_sky_needs_clear_dark_and_dry() {
        let config = SeeingConfig::default();
        let params = OperatingParams::default();
        let engine = SeeingEngine::new(&config, &params);
        let clear = SkyCheck {
            cloud: CloudState::Clear,
            lux: Some(0.2),
            raining: Some(false),
            concentration: None,
        };

        assert!(engine.is_good_sky(&clear));
        assert!(!engine.is_good_sky(&SkyCheck { cloud: CloudState::PartlyCloudy, ..clear }));
        assert!(!engine.is_good_sky(&SkyCheck { lux: Some(80.0), ..clear }));
        assert!(!engine.is_good_sky(&SkyCheck { lux: None, ..clear }));
        assert!(!engine.is_good_sky(&SkyCheck { raining: Some(true), ..clear }));
        assert!(!engine.is_good_sky(&SkyCheck { raining: None, ..clear }));
    }

    #[test]
    fn dust_limit_applies_when_configured() {
        let config = SeeingConfig {
            max_concentration: Some(500.0),
            ..SeeingConfig::default()
        };
        let params = OperatingParams::default();
        let engine = SeeingEngine::new(&config, &params);
        let check = SkyCheck {
            cloud: CloudState::Clear,
            lux: Some(0.2),
            raining: Some(false),
            concentration: Some(120.0),
        };

        assert!(engine.is_good_sky(&check));
        assert!(!engine.is_good_sky(&SkyCheck { concentration: Some(900.0), ..check }));
        assert!(!engine.is_good_sky(&SkyCheck { concentration: None, ..check }));
    }

    #[test]
    fn apply_drives_active_low_pin_and_survives_failed_handshake() {
        let config = SeeingConfig::default();
        let params = OperatingParams::default();
        let engine = SeeingEngine::new(&config, &params);
        let mut power = RecordingPower::default();
        let mut link = FakeSeeingLink {
            shutdown_reply: Err(()),
            ..FakeSeeingLink::default()
        };

        engine.apply(
            &[SeeingAction::PowerOn, SeeingAction::Shutdown, SeeingAction::CutPower],
            &mut power,
            &mut link,
        );

        assert_eq!(link.shutdowns, 1);
        assert_eq!(
            power.log,
            vec![(PowerPin::Seeing, false), (PowerPin::Seeing, true)]
        );
    }

    #[test]
    fn parses_serial_replies() {
        assert_eq!(parse_seeing_reply("1.42\r\n").unwrap(), 1.42);
        assert!(parse_seeing_reply("7").is_err());
        assert!(parse_seeing_reply("-1.5").is_err());
        assert!(parse_seeing_reply("err").is_err());
        assert!(check_shutdown_reply("ok\n").is_ok());
        assert!(check_shutdown_reply("busy").is_err());
    }
}
