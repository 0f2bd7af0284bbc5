use crate::{
    connectivity::ConnectivityState,
    endpoints::{RECOVERY_AP_IP, RECOVERY_AP_SSID},
    types::CloudState,
};

/// Text handed to the display driver; layout is the driver's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusScreen {
    pub lines: Vec<String>,
}

impl StatusScreen {
    pub fn for_state(link: &ConnectivityState, cloud: CloudState) -> Self {
        let mut lines = Vec::with_capacity(5);

        if link.has_wifi {
            lines.push("Connected to Wifi".to_string());
            lines.push(format!("send count: {}", link.send_count));
        } else {
            lines.push("NO Wifi".to_string());
            lines.push(format!("retry count: {}", link.no_wifi_count));
        }

        lines.push(
            if link.settings_loaded {
                "settings loaded"
            } else {
                "settings NOT loaded"
            }
            .to_string(),
        );
        lines.push(
            if link.has_server_error {
                "server error!"
            } else {
                "server is running"
            }
            .to_string(),
        );
        lines.push(format!("sky: {}", cloud.as_str()));

        Self { lines }
    }

    pub fn fail_safe(link: &ConnectivityState) -> Self {
        let cause = if link.has_wifi {
            "server error"
        } else {
            "no WIFI"
        };
        let [a, b, c, d] = RECOVERY_AP_IP;

        Self {
            lines: vec![
                "WIFI Dead -> AP".to_string(),
                format!("{cause}, or server"),
                "not reachable".to_string(),
                format!("AP: {RECOVERY_AP_SSID}"),
                format!("http://{a}.{b}.{c}.{d}"),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normal_screen_reports_link_state() {
        let link = ConnectivityState {
            no_wifi_count: 2,
            has_wifi: false,
            ..ConnectivityState::default()
        };

        let screen = StatusScreen::for_state(&link, CloudState::Cloudy);

        assert_eq!(
            screen.lines,
            vec![
                "NO Wifi",
                "retry count: 2",
                "settings NOT loaded",
                "server is running",
                "sky: CLOUDY",
            ]
        );
    }

    #[test]
    fn fail_safe_screen_points_at_portal() {
        let link = ConnectivityState {
            has_wifi: true,
            has_server_error: true,
            ..ConnectivityState::default()
        };

        let screen = StatusScreen::fail_safe(&link);

        assert_eq!(screen.lines[0], "WIFI Dead -> AP");
        assert_eq!(screen.lines[1], "server error, or server");
        assert_eq!(screen.lines[4], "http://192.168.1.2");
    }
}
