//! Linear mapping between physical voltages and 1401 device units.
//!
//! The 1401 DACs and ADCs share one 16-bit signed representation: `-range..range` volts map onto
//! `-2^15..2^15`. The range is a property of the connected box and is resolved once per session
//! from its descriptor string (see [`VoltageRange::from_descriptor`]).

use ndarray::Array1;

/// Full-scale value of the 16-bit device representation.
pub const FULL_SCALE: f64 = 32768.0;

/// Full-scale output voltage of the connected device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VoltageRange {
    /// Micro1401-4: -5V to 4.9998V
    Five,
    /// All other 1401 models
    Ten,
}

impl VoltageRange {
    /// Resolves the range from the device descriptor reported at session start.
    ///
    /// ```
    /// use stimcompiler_backend::units::VoltageRange;
    /// assert_eq!(VoltageRange::from_descriptor("Micro1401-4"), VoltageRange::Five);
    /// assert_eq!(VoltageRange::from_descriptor("Power1401-3"), VoltageRange::Ten);
    /// ```
    pub fn from_descriptor(descriptor: &str) -> Self {
        if descriptor.contains("Micro1401-4") {
            VoltageRange::Five
        } else {
            VoltageRange::Ten
        }
    }

    pub fn volts(&self) -> f64 {
        match self {
            VoltageRange::Five => 5.0,
            VoltageRange::Ten => 10.0,
        }
    }
}

/// Converts voltages to and from device units for a fixed [`VoltageRange`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConverter {
    range: VoltageRange,
}

impl UnitConverter {
    pub fn new(range: VoltageRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> VoltageRange {
        self.range
    }

    /// Voltage represented by one device unit.
    pub fn step(&self) -> f64 {
        self.range.volts() / FULL_SCALE
    }

    /// `round(voltage / range * 2^15)`, saturated to the `i16` range.
    ///
    /// ```
    /// use stimcompiler_backend::units::*;
    /// let conv = UnitConverter::new(VoltageRange::Five);
    /// assert_eq!(conv.to_device_units(2.5), 16384);
    /// assert_eq!(conv.to_device_units(5.0), i16::MAX);
    /// ```
    pub fn to_device_units(&self, voltage: f64) -> i16 {
        let units = (voltage / self.range.volts() * FULL_SCALE).round();
        units.clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }

    /// `raw / 2^15 * range`
    pub fn from_device_units(&self, raw: i16) -> f64 {
        raw as f64 * self.step()
    }

    /// Vectorized [`UnitConverter::from_device_units`] over a whole read-back region.
    pub fn from_device_slice(&self, raw: &[i16]) -> Array1<f64> {
        let scale = self.step();
        Array1::from_iter(raw.iter().map(|&x| x as f64 * scale))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_within_one_unit() {
        for range in [VoltageRange::Five, VoltageRange::Ten] {
            let conv = UnitConverter::new(range);
            let mut v = 0.0;
            while v <= 4.9998 {
                let back = conv.from_device_units(conv.to_device_units(v));
                assert!((back - v).abs() <= conv.step(), "{} -> {}", v, back);
                v += 0.0137;
            }
        }
    }

    #[test]
    fn rounds_to_nearest() {
        let conv = UnitConverter::new(VoltageRange::Five);
        // 4.0 / 5.0 * 32768 = 26214.4
        assert_eq!(conv.to_device_units(4.0), 26214);
        // 3.0 / 5.0 * 32768 = 19660.8
        assert_eq!(conv.to_device_units(3.0), 19661);
        assert_eq!(conv.to_device_units(0.0), 0);
    }

    #[test]
    fn slice_conversion_matches_scalar() {
        let conv = UnitConverter::new(VoltageRange::Ten);
        let raw = [0i16, 1, -1, 16384, i16::MAX];
        let volts = conv.from_device_slice(&raw);
        for (i, &r) in raw.iter().enumerate() {
            assert_eq!(volts[i], conv.from_device_units(r));
        }
    }
}
