use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::OperatingParams;

/// How this cycle's network attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    NoLink,
    PostFailed,
    Posted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub sleep_s: u32,
    pub enter_recovery: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayChange {
    TimedOut,
    ForcedOn,
}

/// Counters and flags carried across wake cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub no_wifi_count: u32,
    pub send_count: u32,
    pub server_error_count: u32,
    pub has_wifi: bool,
    pub has_server_error: bool,
    pub settings_loaded: bool,
}

impl ConnectivityState {
    pub fn should_fetch_settings(&self, params: &OperatingParams) -> bool {
        !self.settings_loaded || params.check_everytime
    }

    pub fn record(&mut self, outcome: LinkOutcome, params: &OperatingParams) -> RetryDecision {
        let sleep_s = match outcome {
            LinkOutcome::Posted => {
                self.send_count = self.send_count.saturating_add(1);
                self.no_wifi_count = 0;
                self.server_error_count = 0;
                self.has_wifi = true;
                self.has_server_error = false;
                params.sleep_time_s
            }
            LinkOutcome::PostFailed => {
                self.server_error_count = self.server_error_count.saturating_add(1);
                self.has_wifi = true;
                self.has_server_error = true;
                warn!("server error count {}", self.server_error_count);
                params.no_wifi_sleep_s
            }
            LinkOutcome::NoLink => {
                self.no_wifi_count = self.no_wifi_count.saturating_add(1);
                self.has_wifi = false;
                warn!("no wifi count {}", self.no_wifi_count);
                params.no_wifi_sleep_s
            }
        };

        RetryDecision {
            sleep_s,
            enter_recovery: self.recovery_due(params),
        }
    }

    pub fn recovery_due(&self, params: &OperatingParams) -> bool {
        self.no_wifi_count >= params.max_retries || self.server_error_count >= params.max_retries
    }

    /// Switches the display off once it has been on past the timeout, and
    /// back on whenever there is a fault to show.
    pub fn update_display(
        &self,
        display_on: &mut bool,
        params: &OperatingParams,
        connect_overhead_s: u32,
    ) -> Option<DisplayChange> {
        let faulted = !self.has_wifi || self.has_server_error;

        if *display_on && !faulted {
            let elapsed = u64::from(self.send_count) * u64::from(params.sleep_time_s)
                + u64::from(self.no_wifi_count)
                    * u64::from(params.no_wifi_sleep_s.saturating_add(connect_overhead_s));
            if elapsed > u64::from(params.display_timeout_s) {
                info!("display on for {elapsed}s, switching off");
                *display_on = false;
                return Some(DisplayChange::TimedOut);
            }
        } else if !*display_on && faulted {
            info!("display forced on to show link fault");
            *display_on = true;
            return Some(DisplayChange::ForcedOn);
        }

        None
    }

    pub fn reset_after_provisioning(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn params() -> OperatingParams {
        OperatingParams {
            max_retries: 3,
            sleep_time_s: 20,
            no_wifi_sleep_s: 5,
            display_timeout_s: 200,
            ..OperatingParams::default()
        }
    }

    #[test]
    fn successful_post_resets_failure_counters() {
        let params = params();
        let mut state = ConnectivityState::default();
        state.record(LinkOutcome::NoLink, &params);
        state.record(LinkOutcome::NoLink, &params);

        let decision = state.record(LinkOutcome::Posted, &params);

        assert_eq!(decision, RetryDecision { sleep_s: 20, enter_recovery: false });
        assert_eq!(
            state,
            ConnectivityState {
                send_count: 1,
                has_wifi: true,
                ..ConnectivityState::default()
            }
        );
    }

    #[test]
    fn failed_post_keeps_no_wifi_count() {
        let params = params();
        let mut state = ConnectivityState::default();
        state.record(LinkOutcome::NoLink, &params);

        let decision = state.record(LinkOutcome::PostFailed, &params);

        assert_eq!(decision.sleep_s, 5);
        assert_eq!(state.no_wifi_count, 1);
        assert_eq!(state.server_error_count, 1);
        assert!(state.has_server_error);
    }

    #[test]
    fn recovery_on_third_missing_link() {
        let params = params();
        let mut state = ConnectivityState::default();

        let decisions: Vec<bool> = (0..3)
            .map(|_| state.record(LinkOutcome::NoLink, &params).enter_recovery)
            .collect();

        assert_eq!(decisions, vec![false, false, true]);
    }

    #[test]
    fn recovery_on_repeated_server_errors() {
        let params = params();
        let mut state = ConnectivityState::default();

        state.record(LinkOutcome::PostFailed, &params);
        state.record(LinkOutcome::PostFailed, &params);
        assert!(state.record(LinkOutcome::PostFailed, &params).enter_recovery);
    }

    #[test]
    fn settings_fetch_gated_by_loaded_flag() {
        let mut params = params();
        let mut state = ConnectivityState::default();
        assert!(state.should_fetch_settings(&params));

        state.settings_loaded = true;
        assert!(!state.should_fetch_settings(&params));

        params.check_everytime = true;
        assert!(state.should_fetch_settings(&params));
    }

    #[test]
    fn display_times_out_then_returns_on_fault() {
        let params = params();
        let mut state = ConnectivityState::default();
        let mut display_on = true;

        for _ in 0..10 {
            state.record(LinkOutcome::Posted, &params);
            assert_eq!(state.update_display(&mut display_on, &params, 10), None);
        }
        state.record(LinkOutcome::Posted, &params);
        assert_eq!(
            state.update_display(&mut display_on, &params, 10),
            Some(DisplayChange::TimedOut)
        );
        assert!(!display_on);

        state.record(LinkOutcome::NoLink, &params);
        assert_eq!(
            state.update_display(&mut display_on, &params, 10),
            Some(DisplayChange::ForcedOn)
        );
        assert!(display_on);
    }
}
