//! Raw-register and pulse-count conversions for the node's sensors. Bus access
//! lives in the binaries; everything here is pure.

use std::time::Duration;

use crate::{error::SensorError, types::SkyBrightness};

pub const MLX90614_ADDR: u8 = 0x5A;
pub const MLX90614_REG_AMBIENT: u8 = 0x06;
pub const MLX90614_REG_OBJECT: u8 = 0x07;

pub const TSL2561_ADDR: u8 = 0x39;
pub const AS3935_ADDR: u8 = 0x03;

pub const DUST_SAMPLE_MS: u64 = 3_000;
pub const SKY_GATE_MS: u64 = 1_000;

/// Pulses accumulated by the hardware counter over the time it was open.
pub fn pulse_frequency_hz(pulses: u32, counted: Duration) -> Result<f32, SensorError> {
    let seconds = counted.as_secs_f32();
    if seconds <= 0.0 {
        return Err(SensorError::OutOfRange(0.0));
    }
    Ok(pulses as f32 / seconds)
}

/// TSL237 output frequency to sky brightness in mag/arcsec².
pub fn sky_brightness(frequency_hz: f32, sqm_limit: f32) -> Result<SkyBrightness, SensorError> {
    if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
        return Err(SensorError::OutOfRange(frequency_hz));
    }

    let frequency = frequency_hz.max(1.0);
    let mut magnitude = sqm_limit - 2.5 * frequency.log10() * 0.973;
    if magnitude.is_nan() || magnitude == 0.0 {
        magnitude = 0.0;
    }

    Ok(SkyBrightness {
        magnitude,
        nelm: naked_eye_limit(magnitude),
    })
}

pub fn naked_eye_limit(magnitude: f32) -> f32 {
    7.93 - 5.0 * (10f32.powf(4.316 - magnitude / 5.0) + 1.0).log10()
}

/// Dust sensor low-pulse occupancy over a sample window to particles per
/// 0.01 ft³.
pub fn dust_concentration(low_pulse_us: u64, sample_ms: u64) -> Result<f32, SensorError> {
    if sample_ms == 0 {
        return Err(SensorError::OutOfRange(0.0));
    }
    let ratio = low_pulse_us as f32 / (sample_ms as f32 * 10.0);
    let concentration = 1.1 * ratio.powi(3) - 3.8 * ratio.powi(2) + 520.0 * ratio + 0.62;
    if concentration > 1.0 {
        Ok(concentration)
    } else {
        Err(SensorError::OutOfRange(concentration))
    }
}

/// MLX90614 RAM temperature word to °C. Bit 15 is the error flag.
pub fn mlx90614_celsius(raw: u16) -> Result<f32, SensorError> {
    if raw & 0x8000 != 0 {
        return Err(SensorError::Flagged);
    }
    Ok(f32::from(raw) * 0.02 - 273.15)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tsl2561Integration {
    Ms13,
    Ms101,
    Ms402,
}

impl Tsl2561Integration {
    pub fn timing_bits(self) -> u8 {
        match self {
            Self::Ms13 => 0x00,
            Self::Ms101 => 0x01,
            Self::Ms402 => 0x02,
        }
    }

    pub fn duration_ms(self) -> u64 {
        match self {
            Self::Ms13 => 14,
            Self::Ms101 => 101,
            Self::Ms402 => 402,
        }
    }

    fn saturation(self) -> u16 {
        match self {
            Self::Ms13 => 5_047,
            Self::Ms101 => 37_177,
            Self::Ms402 => 0xFFFF,
        }
    }
}

/// TSL2561 broadband/infrared channel pair to lux (T/FN/CL package curve).
pub fn tsl2561_lux(
    broadband: u16,
    infrared: u16,
    integration: Tsl2561Integration,
    high_gain: bool,
) -> Result<f32, SensorError> {
    let saturation = integration.saturation();
    if broadband >= saturation || infrared >= saturation {
        return Err(SensorError::Saturated);
    }
    if broadband == 0 {
        return Ok(0.0);
    }

    let scale = match integration {
        Tsl2561Integration::Ms13 => 402.0 / 13.7,
        Tsl2561Integration::Ms101 => 402.0 / 101.0,
        Tsl2561Integration::Ms402 => 1.0,
    } * if high_gain { 1.0 } else { 16.0 };

    let d0 = f64::from(broadband) * scale;
    let d1 = f64::from(infrared) * scale;
    let ratio = d1 / d0;

    let lux = if ratio < 0.5 {
        0.0304 * d0 - 0.062 * d0 * ratio.powf(1.4)
    } else if ratio < 0.61 {
        0.0224 * d0 - 0.031 * d1
    } else if ratio < 0.80 {
        0.0128 * d0 - 0.0153 * d1
    } else if ratio < 1.30 {
        0.00146 * d0 - 0.00112 * d1
    } else {
        0.0
    };

    Ok(lux.max(0.0) as f32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightningEvent {
    None,
    Noise,
    Disturber,
    Strike,
}

/// AS3935 interrupt register (0x03, low nibble).
pub fn as3935_event(interrupt: u8) -> LightningEvent {
    match interrupt & 0x0F {
        0x08 => LightningEvent::Strike,
        0x04 => LightningEvent::Disturber,
        0x01 => LightningEvent::Noise,
        _ => LightningEvent::None,
    }
}

/// AS3935 distance register (0x07). `None` when the storm is out of range.
pub fn as3935_distance_km(register: u8) -> Option<u8> {
    match register & 0x3F {
        0x3F => None,
        km => Some(km),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn dark_sky_reads_high_magnitude() {
        let dark = sky_brightness(2.0, 21.83).unwrap();
        let bright = sky_brightness(5_000.0, 21.83).unwrap();

        assert!(dark.magnitude > bright.magnitude);
        assert!((dark.magnitude - 21.098).abs() < 0.01);
        assert!(dark.nelm > bright.nelm);
    }

    #[test]
    fn sub_hertz_frequency_reads_as_limit() {
        let reading = sky_brightness(0.4, 21.83).unwrap();
        assert_eq!(reading.magnitude, 21.83);
    }

    #[test]
    fn zero_frequency_is_a_failure() {
        assert!(sky_brightness(0.0, 21.83).is_err());
        assert!(sky_brightness(f32::NAN, 21.83).is_err());
    }

    #[test]
    fn counter_slices_add_up_to_frequency() {
        let hz = pulse_frequency_hz(450, Duration::from_millis(1_020)).unwrap();
        assert!((hz - 441.18).abs() < 0.01, "{hz}");

        assert!(pulse_frequency_hz(10, Duration::ZERO).is_err());
        assert!(sky_brightness(pulse_frequency_hz(0, Duration::from_secs(1)).unwrap(), 21.83).is_err());
    }

    #[test]
    fn nelm_matches_reference_point() {
        let nelm = naked_eye_limit(21.5);
        assert!((nelm - 6.38).abs() < 0.05, "{nelm}");
    }

    #[test]
    fn dust_needs_some_occupancy() {
        assert!(dust_concentration(0, DUST_SAMPLE_MS).is_err());

        let concentration = dust_concentration(30_000, DUST_SAMPLE_MS).unwrap();
        assert!((concentration - 517.92).abs() < 0.5, "{concentration}");
    }

    #[test]
    fn mlx_word_conversion() {
        assert!((mlx90614_celsius(0x3AF7).unwrap() - 28.75).abs() < 0.01);
        assert!(matches!(mlx90614_celsius(0x8001), Err(SensorError::Flagged)));
    }

    #[test]
    fn tsl_low_light_and_saturation() {
        let lux = tsl2561_lux(120, 30, Tsl2561Integration::Ms101, false).unwrap();
        assert!(lux > 0.0 && lux < 500.0, "{lux}");

        assert_eq!(tsl2561_lux(0, 0, Tsl2561Integration::Ms101, false).unwrap(), 0.0);
        assert!(matches!(
            tsl2561_lux(40_000, 100, Tsl2561Integration::Ms101, false),
            Err(SensorError::Saturated)
        ));
    }

    #[test]
    fn lightning_registers() {
        assert_eq!(as3935_event(0x08), LightningEvent::Strike);
        assert_eq!(as3935_event(0xF4), LightningEvent::Disturber);
        assert_eq!(as3935_event(0x01), LightningEvent::Noise);
        assert_eq!(as3935_event(0x00), LightningEvent::None);
        assert_eq!(as3935_distance_km(0x3F), None);
        assert_eq!(as3935_distance_km(0x0E), Some(14));
    }
}
