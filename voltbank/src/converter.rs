//! Raw code to voltage, with the divider corrected for the converter's own input load.

use crate::calibration::{self, CalibrationMissing};
use crate::registry::{Divider, Port};

/// Full-scale span of the converter, `2 * VREF`.
pub const FULL_SCALE: f64 = 2.0 * mcp342x::VREF;

/// Derived values of one reading. Recomputed every cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConversionResult {
    /// Volts per code at the port's resolution, before the amplifier.
    pub lsb: f64,
    pub code: i32,
    /// Voltage at the converter input.
    pub adc_voltage: f64,
    /// Estimated input load of the converter, ohms.
    pub load_resistance: f64,
    /// Source voltage in front of the divider, corrected for the load.
    pub true_voltage: f64,
    /// Source voltage assuming an unloaded divider.
    pub naive_voltage: f64,
    /// `false` when the fitted load came out non-positive or non-finite.
    pub load_plausible: bool,
}

pub fn lsb(bits: u8) -> f64 {
    FULL_SCALE / 2f64.powi(i32::from(bits))
}

/// Convert `code` taken at `bits` resolution and `gain`.
pub fn convert_raw(code: i32, bits: u8, gain: u8, divider: &Divider) -> Result<ConversionResult, CalibrationMissing> {
    let entry = calibration::lookup(bits, gain)?;
    let lsb = lsb(bits);
    let adc_voltage = f64::from(code) * lsb / f64::from(gain);
    let load_resistance = entry.load_resistance(adc_voltage);

    let (true_voltage, naive_voltage) = if divider.is_present() {
        let loaded_r2 = 1.0 / (1.0 / divider.r2 + 1.0 / load_resistance);
        let current = adc_voltage / loaded_r2;
        (
            current * (divider.r1 + loaded_r2),
            adc_voltage / divider.r2 * (divider.r1 + divider.r2),
        )
    } else {
        (adc_voltage, adc_voltage)
    };

    Ok(ConversionResult {
        lsb,
        code,
        adc_voltage,
        load_resistance,
        true_voltage,
        naive_voltage,
        load_plausible: load_resistance.is_finite() && load_resistance > 0.0,
    })
}

/// Convert the last sample held by `port`.
pub fn convert(port: &Port) -> Result<ConversionResult, CalibrationMissing> {
    convert_raw(port.code(), port.resolution().bits(), port.gain().factor(), &port.divider())
}

/// Back-solve the converter load from a known source voltage.
///
/// `None` when the reading leaves no current through the high side or the result is
/// not finite.
pub fn estimate_load(known_voltage: f64, adc_voltage: f64, divider: &Divider) -> Option<f64> {
    let current = (known_voltage - adc_voltage) / divider.r1;
    if current == 0.0 {
        return None;
    }
    let low_side = adc_voltage / current;
    let load = low_side * divider.r2 / (divider.r2 - low_side);
    load.is_finite().then_some(load)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn divider() -> Divider {
        Divider::new(120_000.0, 20_000.0)
    }

    #[test]
    fn eighteen_bit_unity_gain_reading() {
        let result = convert_raw(65536, 18, 1, &divider()).unwrap();

        let lsb = 4.096 / 262_144.0;
        let adc = 65536.0 * lsb;
        let (c1, c2, c3) = (-549702.5567547062, 1957717.4623683672, 387836.79665354657);
        let rl = c1 * adc * adc + c2 * adc + c3;
        let r2 = 1.0 / (1.0 / 20_000.0 + 1.0 / rl);
        let expected = adc / r2 * (120_000.0 + r2);

        assert_eq!(result.lsb, lsb);
        assert!((result.adc_voltage - 1.024).abs() < 1e-12);
        assert!((result.load_resistance - rl).abs() < 1e-6);
        assert!((result.true_voltage - expected).abs() < 1e-9);
        assert!((result.naive_voltage - 1.024 * 7.0).abs() < 1e-9);
        assert!(result.true_voltage > result.naive_voltage);
        assert!(result.load_plausible);
    }

    #[test]
    fn direct_input_is_identity() {
        for (code, bits, gain) in [(1000, 12, 1), (-8000, 14, 2), (30000, 16, 8), (-100_000, 18, 4)] {
            let result = convert_raw(code, bits, gain, &Divider::DIRECT).unwrap();
            assert_eq!(result.true_voltage, result.adc_voltage);
            assert_eq!(result.naive_voltage, result.adc_voltage);
        }
    }

    #[test]
    fn gain_scales_adc_voltage() {
        let g1 = convert_raw(4000, 16, 1, &Divider::DIRECT).unwrap();
        let g8 = convert_raw(4000, 16, 8, &Divider::DIRECT).unwrap();
        assert!((g1.adc_voltage / g8.adc_voltage - 8.0).abs() < 1e-12);
    }

    #[test]
    fn negative_code_gives_negative_voltage() {
        let result = convert_raw(-65536, 18, 1, &divider()).unwrap();
        let positive = convert_raw(65536, 18, 1, &divider()).unwrap();
        assert!((result.true_voltage + positive.true_voltage).abs() < 1e-9);
    }

    #[test]
    fn uncalibrated_setting_fails() {
        assert_eq!(
            convert_raw(100, 18, 3, &divider()),
            Err(CalibrationMissing { bits: 18, gain: 3 })
        );
    }

    #[test]
    fn load_estimate_inverts_conversion() {
        let d = divider();
        let result = convert_raw(65536, 18, 1, &d).unwrap();
        let load = estimate_load(result.true_voltage, result.adc_voltage, &d).unwrap();
        assert!((load - result.load_resistance).abs() / result.load_resistance < 1e-9);
        assert_eq!(estimate_load(1.0, 1.0, &d), None);
    }
}
