//! MCP342x ADC driver for Linux using linux_embedded_hal and embedded-hal.
//!
//! The driver owns the I2C bus rather than a single chip, so one instance can
//! talk to every MCP3424 on a multi-board stack. Each sample is a single
//! `write_read` transaction: the configuration byte is sent with the read
//! request and the chip answers with the data bytes followed by its status byte.

use embedded_hal::i2c::I2c;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Ready flag. Written as 1 to start a conversion, read back as 0 when done.
pub const READY: u8 = 0b1000_0000;
/// Conversion mode flag, always set in configuration bytes sent by this driver.
pub const CONVERSION_MODE: u8 = 0b0001_0000;

const CH_MASK: u8 = 0b0110_0000;
const RES_MASK: u8 = 0b0000_1100;
const GAIN_MASK: u8 = 0b0000_0011;

/// Full-scale reference of the converter in volts.
pub const VREF: f64 = 2.048;

/// Parameter errors, raised before any bus traffic happens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("invalid channel {0}, expected 1, 2, 3 or 4")]
    Channel(u8),
    #[error("invalid resolution {0}, expected 12, 14, 16 or 18 bits")]
    Resolution(u8),
    #[error("invalid gain {0}, expected 1, 2, 4 or 8")]
    Gain(u8),
    #[error("short read: {bits}-bit sample needs {needed} bytes, got {got}")]
    ShortRead { bits: u8, needed: usize, got: usize },
}

/// Errors for the MCP342x driver.
#[derive(Error, Debug)]
pub enum Error<E: std::error::Error + 'static> {
    #[error("I2C bus error: {0}")]
    I2c(#[from] E),
    #[error(transparent)]
    Parameter(ParameterError),
}

/// PGA gain settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gain {
    G1 = 0b00,
    G2 = 0b01,
    G4 = 0b10,
    G8 = 0b11,
}

impl Gain {
    pub const ALL: [Gain; 4] = [Gain::G1, Gain::G2, Gain::G4, Gain::G8];

    /// Amplifier multiplier (1, 2, 4 or 8).
    pub fn factor(self) -> u8 {
        1 << (self as u8)
    }

    /// Position in the ascending list of gains, 0..=3.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Gain> {
        Self::ALL.get(index).copied()
    }

    /// Next higher gain, `None` at 8.
    pub fn step_up(self) -> Option<Gain> {
        Self::from_index(self.index() + 1)
    }

    /// Next lower gain, `None` at 1.
    pub fn step_down(self) -> Option<Gain> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }

    fn from_bits(config: u8) -> Gain {
        Self::ALL[(config & GAIN_MASK) as usize]
    }
}

impl TryFrom<u8> for Gain {
    type Error = ParameterError;

    fn try_from(factor: u8) -> Result<Self, Self::Error> {
        match factor {
            1 => Ok(Gain::G1),
            2 => Ok(Gain::G2),
            4 => Ok(Gain::G4),
            8 => Ok(Gain::G8),
            other => Err(ParameterError::Gain(other)),
        }
    }
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.factor())
    }
}

/// Conversion resolution and SPS timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resolution {
    Bits12 = 0b0000, // 240 SPS
    Bits14 = 0b0100, // 60 SPS
    Bits16 = 0b1000, // 15 SPS
    Bits18 = 0b1100, // 3.75 SPS (MCP3422/3/4 only)
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::Bits12,
        Resolution::Bits14,
        Resolution::Bits16,
        Resolution::Bits18,
    ];

    pub fn bits(self) -> u8 {
        12 + 2 * self.index() as u8
    }

    /// Position in the ascending list of resolutions, 0..=3.
    pub fn index(self) -> usize {
        (self as usize) >> 2
    }

    pub fn from_index(index: usize) -> Option<Resolution> {
        Self::ALL.get(index).copied()
    }

    /// Volts per code before the PGA: 2 * VREF / 2^bits.
    pub fn lsb(self) -> f64 {
        (2.0 * VREF) / f64::from(1u32 << self.bits())
    }

    /// Bytes returned by a read, data plus the trailing status byte.
    pub fn read_len(self) -> usize {
        match self {
            Resolution::Bits18 => 4,
            _ => 3,
        }
    }

    pub fn samples_per_second(self) -> f32 {
        match self {
            Resolution::Bits12 => 240.0,
            Resolution::Bits14 => 60.0,
            Resolution::Bits16 => 15.0,
            Resolution::Bits18 => 3.75,
        }
    }

    /// Expected conversion time for one sample.
    pub fn conversion_time(self) -> Duration {
        Duration::from_secs_f32(1.0 / self.samples_per_second())
    }

    fn from_bits(config: u8) -> Resolution {
        Self::ALL[((config & RES_MASK) >> 2) as usize]
    }
}

impl TryFrom<u8> for Resolution {
    type Error = ParameterError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            12 => Ok(Resolution::Bits12),
            14 => Ok(Resolution::Bits14),
            16 => Ok(Resolution::Bits16),
            18 => Ok(Resolution::Bits18),
            other => Err(ParameterError::Resolution(other)),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bits", self.bits())
    }
}

/// Input channel selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Ch1 = 0b0000000,
    Ch2 = 0b0100000,
    Ch3 = 0b1000000,
    Ch4 = 0b1100000,
}

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Ch1, Channel::Ch2, Channel::Ch3, Channel::Ch4];

    /// 1-based channel number as printed on the board.
    pub fn number(self) -> u8 {
        ((self as u8) >> 5) + 1
    }

    fn from_bits(config: u8) -> Channel {
        Self::ALL[((config & CH_MASK) >> 5) as usize]
    }
}

impl TryFrom<u8> for Channel {
    type Error = ParameterError;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        match number {
            1..=4 => Ok(Self::ALL[(number - 1) as usize]),
            other => Err(ParameterError::Channel(other)),
        }
    }
}

/// One complete chip configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub channel: Channel,
    pub resolution: Resolution,
    pub gain: Gain,
}

impl Config {
    pub fn new(channel: Channel, resolution: Resolution, gain: Gain) -> Self {
        Self { channel, resolution, gain }
    }

    /// Configuration byte requesting a new conversion with these settings.
    pub fn encode(&self) -> u8 {
        READY | CONVERSION_MODE | self.channel as u8 | self.resolution as u8 | self.gain as u8
    }
}

/// Decoded status byte as echoed by the chip after the data bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub raw: u8,
    pub ready: bool,
    pub continuous: bool,
    pub config: Config,
}

impl Status {
    pub fn from_byte(raw: u8) -> Self {
        Self {
            raw,
            ready: raw & READY == 0,
            continuous: raw & CONVERSION_MODE != 0,
            config: Config {
                channel: Channel::from_bits(raw),
                resolution: Resolution::from_bits(raw),
                gain: Gain::from_bits(raw),
            },
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#04x}: {}, channel {}, {}, {} / {} SPS, PGA = {}",
            self.raw,
            if self.ready { "data ready" } else { "data NOT ready" },
            self.config.channel.number(),
            if self.continuous { "continuous" } else { "one shot" },
            self.config.resolution,
            self.config.resolution.samples_per_second(),
            self.config.gain.factor(),
        )
    }
}

/// Validate numeric settings and build the configuration byte.
pub fn encode(channel: u8, bits: u8, gain: u8) -> Result<u8, ParameterError> {
    let config = Config::new(Channel::try_from(channel)?, Resolution::try_from(bits)?, Gain::try_from(gain)?);
    Ok(config.encode())
}

/// Assemble a signed code from the data bytes of a read.
///
/// Only the leading data bytes are used; a trailing status byte may be present.
pub fn decode(bytes: &[u8], resolution: Resolution) -> Result<i32, ParameterError> {
    let needed = resolution.read_len() - 1;
    if bytes.len() < needed {
        return Err(ParameterError::ShortRead { bits: resolution.bits(), needed, got: bytes.len() });
    }
    let b = |i: usize| i32::from(bytes[i]);
    let mantissa = match resolution {
        Resolution::Bits18 => (b(0) & 0x03) << 16 | b(1) << 8 | b(2),
        Resolution::Bits16 => b(0) << 8 | b(1),
        Resolution::Bits14 => (b(0) & 0x3f) << 8 | b(1),
        Resolution::Bits12 => (b(0) & 0x0f) << 8 | b(1),
    };
    if bytes[0] & 0x80 != 0 {
        Ok(mantissa - (1 << resolution.bits()))
    } else {
        Ok(mantissa)
    }
}

/// One sample as returned by the chip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub code: i32,
    pub bytes: Vec<u8>,
    pub status: Status,
}

/// MCP342x driver struct, shared by every chip on the bus.
pub struct MCP342x<I2C> {
    i2c: I2C,
}

impl<I2C, E> MCP342x<I2C>
where
    I2C: I2c<Error = E>,
    I2C::Error: std::error::Error + 'static,
{
    pub fn new(i2c: I2C) -> Self {
        MCP342x { i2c }
    }

    /// Give the bus back.
    pub fn release(self) -> I2C {
        self.i2c
    }

    /// Write a configuration to a chip without reading.
    pub fn configure(&mut self, address: u8, config: &Config) -> Result<(), Error<E>> {
        self.i2c.write(address, &[config.encode()]).map_err(Error::I2c)
    }

    /// Request `config` and read back the resulting sample in one transaction.
    pub fn read_sample(&mut self, address: u8, config: &Config) -> Result<Sample, Error<E>> {
        let len = config.resolution.read_len();
        let mut buf = [0u8; 4];
        self.i2c
            .write_read(address, &[config.encode()], &mut buf[..len])
            .map_err(Error::I2c)?;

        let code = decode(&buf[..len], config.resolution).map_err(Error::Parameter)?;
        Ok(Sample { code, bytes: buf[..len].to_vec(), status: Status::from_byte(buf[len - 1]) })
    }

    /// Read the latest result without writing the configuration again.
    ///
    /// Used to poll a chip until the status reports a finished conversion.
    pub fn read_latest(&mut self, address: u8, resolution: Resolution) -> Result<Sample, Error<E>> {
        let len = resolution.read_len();
        let mut buf = [0u8; 4];
        self.i2c.read(address, &mut buf[..len]).map_err(Error::I2c)?;

        let code = decode(&buf[..len], resolution).map_err(Error::Parameter)?;
        Ok(Sample { code, bytes: buf[..len].to_vec(), status: Status::from_byte(buf[len - 1]) })
    }

    /// Plain read without a configuration write, for inspecting the chip's current setting.
    ///
    /// Four bytes cover every resolution: at 18 bits the fourth byte is the status,
    /// below that the chip repeats the status byte after the data.
    pub fn read_status(&mut self, address: u8) -> Result<Status, Error<E>> {
        let mut buf = [0u8; 4];
        self.i2c.read(address, &mut buf).map_err(Error::I2c)?;
        Ok(Status::from_byte(buf[3]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Big-endian two's complement bytes as the chip sends them.
    fn chip_bytes(code: i32, resolution: Resolution) -> Vec<u8> {
        let len = resolution.read_len() - 1;
        let raw = (code as u32).to_be_bytes();
        raw[4 - len..].to_vec()
    }

    #[test]
    fn encode_matches_register_layout() {
        assert_eq!(encode(1, 18, 1), Ok(0x9c));
        assert_eq!(encode(2, 12, 8), Ok(0x80 | 0x10 | 0x20 | 0x03));
        assert_eq!(encode(4, 16, 4), Ok(0x80 | 0x10 | 0x60 | 0x08 | 0x02));
    }

    #[test]
    fn encode_rejects_illegal_values() {
        assert_eq!(encode(0, 18, 1), Err(ParameterError::Channel(0)));
        assert_eq!(encode(1, 17, 1), Err(ParameterError::Resolution(17)));
        assert_eq!(encode(1, 18, 3), Err(ParameterError::Gain(3)));
    }

    #[test]
    fn encode_is_injective() {
        let mut seen = HashSet::new();
        for ch in 1..=4 {
            for bits in [12, 14, 16, 18] {
                for gain in [1, 2, 4, 8] {
                    assert!(seen.insert(encode(ch, bits, gain).unwrap()));
                }
            }
        }
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn decode_round_trips_mantissa() {
        for resolution in Resolution::ALL {
            let half = 1i32 << (resolution.bits() - 1);
            for code in [-half, -half + 1, -1000, -1, 0, 1, 1000, half - 1] {
                let bytes = chip_bytes(code, resolution);
                assert_eq!(decode(&bytes, resolution), Ok(code), "{resolution} code {code}");
            }
        }
    }

    #[test]
    fn decode_ignores_trailing_status() {
        assert_eq!(decode(&[0x01, 0x00, 0x00, 0x9c], Resolution::Bits18), Ok(65536));
        assert_eq!(decode(&[0xff, 0xff, 0x10], Resolution::Bits16), Ok(-1));
    }

    #[test]
    fn decode_short_read() {
        assert!(matches!(
            decode(&[0x00, 0x01], Resolution::Bits18),
            Err(ParameterError::ShortRead { needed: 3, got: 2, .. })
        ));
    }

    #[test]
    fn status_byte_decodes_config() {
        let status = Status::from_byte(0x1c | 0x40 | 0x01);
        assert!(status.ready);
        assert!(status.continuous);
        assert_eq!(status.config, Config::new(Channel::Ch3, Resolution::Bits18, Gain::G2));
        assert!(status.to_string().contains("channel 3"));
    }

    #[test]
    fn gain_steps() {
        assert_eq!(Gain::G1.step_down(), None);
        assert_eq!(Gain::G8.step_up(), None);
        assert_eq!(Gain::G2.step_up(), Some(Gain::G4));
        assert_eq!(Gain::G4.step_down(), Some(Gain::G2));
        assert_eq!(Gain::G8.factor(), 8);
    }

    #[test]
    fn resolution_properties() {
        assert_eq!(Resolution::Bits18.bits(), 18);
        assert_eq!(Resolution::Bits12.read_len(), 3);
        assert!((Resolution::Bits18.lsb() - 15.625e-6).abs() < 1e-12);
        assert!((Resolution::Bits12.lsb() - 1e-3).abs() < 1e-12);
        assert_eq!(Resolution::from_index(2), Some(Resolution::Bits16));
    }
}
