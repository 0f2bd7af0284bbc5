use crate::types::CloudState;

/// Classifies cloud cover from the gap between ambient and sky-facing
/// temperature. A clear sky reads far colder than ambient.
pub fn classify(
    ambient: f32,
    object: f32,
    clear_setpoint: f32,
    cloudy_setpoint: f32,
) -> CloudState {
    if ![ambient, object, clear_setpoint, cloudy_setpoint]
        .iter()
        .all(|v| v.is_finite())
    {
        return CloudState::Unknown;
    }

    let diff = ambient - object;
    if diff > clear_setpoint {
        CloudState::Clear
    } else if diff > cloudy_setpoint {
        CloudState::PartlyCloudy
    } else {
        CloudState::Cloudy
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn classifies_by_temperature_gap() {
        assert_eq!(classify(10.0, -15.0, 22.0, 2.0), CloudState::Clear);
        assert_eq!(classify(10.0, 10.0, 22.0, 2.0), CloudState::Cloudy);
        assert_eq!(classify(10.0, 0.0, 22.0, 2.0), CloudState::PartlyCloudy);
    }

    #[test]
    fn boundaries_fall_to_the_cloudier_side() {
        assert_eq!(classify(22.0, 0.0, 22.0, 2.0), CloudState::PartlyCloudy);
        assert_eq!(classify(2.0, 0.0, 22.0, 2.0), CloudState::Cloudy);
    }

    #[test]
    fn non_finite_input_is_unknown() {
        assert_eq!(classify(f32::NAN, 0.0, 22.0, 2.0), CloudState::Unknown);
        assert_eq!(classify(5.0, f32::INFINITY, 22.0, 2.0), CloudState::Unknown);
        assert_eq!(classify(5.0, 0.0, f32::NAN, 2.0), CloudState::Unknown);
    }

    #[test]
    fn sweep_agrees_with_thresholds() {
        for step in -100..=100 {
            let diff = step as f32 * 0.5;
            let state = classify(diff, 0.0, 22.0, 2.0);
            let expected = if diff > 22.0 {
                CloudState::Clear
            } else if diff > 2.0 {
                CloudState::PartlyCloudy
            } else {
                CloudState::Cloudy
            };
            assert_eq!(state, expected, "diff {diff}");
        }
    }
}
