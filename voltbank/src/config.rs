//! Command line and environment configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use mcp342x::{Gain, Resolution};

use crate::acquisition::LoopSettings;
use crate::agc::{AutoGain, DEFAULT_MARGIN};
use crate::error::{Error, Result};
use crate::registry::{Divider, PortDefaults, CHANNELS_PER_CHIP};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Talk to the chips directly over /dev/i2c-N.
    Bus,
    /// Go through the kernel's IIO driver attributes.
    Sysfs,
}

/// Chip bus addresses in board order, two per board.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressBook(pub Vec<u8>);

impl FromStr for AddressBook {
    type Err = String;

    /// Comma separated. If any entry contains a letter a-f the whole list is read as hex,
    /// so `68,69,6a` works without prefixes; otherwise `0x`, `0o` and `0b` prefixes select
    /// the base and plain digits are decimal.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let hex = s.chars().any(|c| matches!(c, 'a'..='f' | 'A'..='F'));
        let mut addresses = Vec::new();
        for item in s.split(',').map(str::trim) {
            let value = if hex {
                let digits = item.strip_prefix("0x").or_else(|| item.strip_prefix("0X")).unwrap_or(item);
                u32::from_str_radix(digits, 16)
            } else {
                parse_prefixed(item)
            }
            .map_err(|e| format!("bad address {item:?}: {e}"))?;
            if value > 0x7f {
                return Err(format!("address {item:?} does not fit in 7 bits"));
            }
            addresses.push(value as u8);
        }
        Ok(AddressBook(addresses))
    }
}

fn parse_prefixed(item: &str) -> std::result::Result<u32, std::num::ParseIntError> {
    let lower = item.to_ascii_lowercase();
    if let Some(digits) = lower.strip_prefix("0x") {
        u32::from_str_radix(digits, 16)
    } else if let Some(digits) = lower.strip_prefix("0o") {
        u32::from_str_radix(digits, 8)
    } else if let Some(digits) = lower.strip_prefix("0b") {
        u32::from_str_radix(digits, 2)
    } else {
        lower.parse()
    }
}

/// Ports to show, e.g. `1-4,7`. Ranges are inclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSet(pub Vec<usize>);

impl FromStr for PortSet {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut ports = Vec::new();
        for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let parse = |v: &str| v.trim().parse::<usize>().map_err(|e| format!("bad port {v:?}: {e}"));
            match item.split_once('-') {
                Some((first, last)) => {
                    let (first, last) = (parse(first)?, parse(last)?);
                    if first > last {
                        return Err(format!("empty port range {item:?}"));
                    }
                    ports.extend(first..=last);
                }
                None => ports.push(parse(item)?),
            }
        }
        if ports.contains(&0) {
            return Err("ports are numbered from 1".into());
        }
        Ok(PortSet(ports))
    }
}

fn parse_resolution(s: &str) -> std::result::Result<Resolution, String> {
    let bits: u8 = s.parse().map_err(|e| format!("{e}"))?;
    Resolution::try_from(bits).map_err(|e| e.to_string())
}

fn parse_gain(s: &str) -> std::result::Result<Gain, String> {
    let gain: u8 = s.parse().map_err(|e| format!("{e}"))?;
    Gain::try_from(gain).map_err(|e| e.to_string())
}

/// Read MCP3424 voltage ports with divider correction and automatic gain.
#[derive(Parser, Clone, Debug)]
#[command(name = "voltbank", version, about, long_about = None)]
pub struct Config {
    #[arg(long, value_enum, default_value = "bus", env = "VOLTBANK_BACKEND")]
    pub backend: BackendKind,

    /// I2C character device for the bus backend.
    #[arg(long, default_value = "/dev/i2c-1", env = "VOLTBANK_I2C_DEVICE")]
    pub i2c_device: PathBuf,

    /// Root of the I2C device tree for the sysfs backend.
    #[arg(long, default_value = "/sys/bus/i2c/devices", env = "VOLTBANK_SYSFS_ROOT")]
    pub sysfs_root: PathBuf,

    /// Bus number the chips sit on, for the sysfs backend.
    #[arg(long, default_value_t = 1, env = "VOLTBANK_I2C_BUS")]
    pub i2c_bus: u8,

    /// Chip addresses, two per board, like "68,69,6a,6b".
    #[arg(short, long, default_value = "68,69,6a,6b,6c,6d,6e,6f", env = "VOLTBANK_ADDRESSES")]
    pub addresses: AddressBook,

    /// Number of ports to set up; defaults to four per address.
    #[arg(long, env = "VOLTBANK_PORT_COUNT")]
    pub port_count: Option<usize>,

    /// Ports to show, like "3-4" or "1,5-8".
    #[arg(short = 'p', long = "port", default_value = "1-8", env = "VOLTBANK_PORTS")]
    pub show: PortSet,

    /// Resolution in bits: 12, 14, 16 or 18.
    #[arg(short, long, default_value = "18", value_parser = parse_resolution, env = "VOLTBANK_BITS")]
    pub bits: Resolution,

    /// Fixed gain: 1, 2, 4 or 8. Disables automatic gain.
    #[arg(short, long, value_parser = parse_gain, env = "VOLTBANK_GAIN")]
    pub gain: Option<Gain>,

    /// Cycles to run; 0 runs until interrupted.
    #[arg(short, long, default_value_t = 1, env = "VOLTBANK_SAMPLES")]
    pub samples: u64,

    /// Seconds between cycles, fractions allowed.
    #[arg(short, long, default_value_t = 1.5, env = "VOLTBANK_DELAY")]
    pub delay: f64,

    /// Upper divider resistor, ohms. 0 when inputs are wired directly.
    #[arg(long = "r1", default_value_t = 120_000.0, env = "VOLTBANK_R1")]
    pub r1: f64,

    /// Lower divider resistor, ohms.
    #[arg(long = "r2", default_value_t = 20_000.0, env = "VOLTBANK_R2")]
    pub r2: f64,

    /// Fraction of the code span kept free at each rail before gain is lowered.
    #[arg(long, default_value_t = DEFAULT_MARGIN, env = "VOLTBANK_MARGIN")]
    pub margin: f64,

    /// Known input voltage; prints the back-solved converter load per port.
    #[arg(long, hide = true)]
    pub calibrate: Option<f64>,
}

impl Config {
    /// Ports to set up.
    pub fn port_count(&self) -> usize {
        self.port_count.unwrap_or(self.addresses.0.len() * CHANNELS_PER_CHIP)
    }

    /// Check the values clap cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        if self.addresses.0.is_empty() {
            return Err(Error::Config("no chip addresses given".into()));
        }
        if self.port_count() == 0 {
            return Err(Error::Config("port count must be at least 1".into()));
        }
        if !self.delay.is_finite() || self.delay < 0.0 {
            return Err(Error::Config(format!("delay {} is not a usable number of seconds", self.delay)));
        }
        if self.r1 < 0.0 || self.r2 <= 0.0 || !self.r1.is_finite() || !self.r2.is_finite() {
            return Err(Error::Config(format!("divider R1={} R2={} is not usable", self.r1, self.r2)));
        }
        if !(0.0..0.5).contains(&self.margin) {
            return Err(Error::Config(format!("margin {} must be in [0, 0.5)", self.margin)));
        }
        Ok(())
    }

    /// Ports to print, without those beyond the port count.
    pub fn shown_ports(&self) -> Vec<usize> {
        let count = self.port_count();
        self.show.0.iter().copied().filter(|&p| p <= count).collect()
    }

    pub fn port_defaults(&self) -> PortDefaults {
        PortDefaults {
            resolution: self.bits,
            gain: self.gain.unwrap_or(Gain::G1),
            divider: Divider::new(self.r1, self.r2),
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            interval: Duration::from_secs_f64(self.delay),
            iterations: (self.samples > 0).then_some(self.samples),
            resolution: self.bits,
            agc: AutoGain { margin: self.margin, enabled: self.gain.is_none() },
            calibrate: self.calibrate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("voltbank").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn addresses_with_letters_are_hex() {
        let book: AddressBook = "68,69,6a,6b".parse().unwrap();
        assert_eq!(book.0, vec![0x68, 0x69, 0x6a, 0x6b]);
        let book: AddressBook = "0x6E, 6F".parse().unwrap();
        assert_eq!(book.0, vec![0x6e, 0x6f]);
    }

    #[test]
    fn addresses_without_letters_use_prefixes() {
        let book: AddressBook = "0x68,104,0o151".parse().unwrap();
        assert_eq!(book.0, vec![0x68, 0x68, 0x69]);
        let book: AddressBook = "0x68,0X69".parse().unwrap();
        assert_eq!(book.0, vec![0x68, 0x69]);
        assert!("128".parse::<AddressBook>().is_err());
        assert!("68,zz".parse::<AddressBook>().is_err());
    }

    #[test]
    fn port_ranges_are_inclusive() {
        let ports: PortSet = "1-3,7".parse().unwrap();
        assert_eq!(ports.0, vec![1, 2, 3, 7]);
        assert!("4-2".parse::<PortSet>().is_err());
        assert!("0-2".parse::<PortSet>().is_err());
    }

    #[test]
    fn defaults_match_a_two_board_stack() {
        let config = parse(&[]);
        assert_eq!(config.backend, BackendKind::Bus);
        assert_eq!(config.addresses.0.len(), 8);
        assert_eq!(config.port_count(), 32);
        assert_eq!(config.show.0, (1..=8).collect::<Vec<_>>());
        assert_eq!(config.bits, Resolution::Bits18);
        config.validate().unwrap();

        let settings = config.loop_settings();
        assert_eq!(settings.interval, Duration::from_millis(1500));
        assert_eq!(settings.iterations, Some(1));
        assert!(settings.agc.enabled);
        assert_eq!(config.port_defaults(), PortDefaults::default());
    }

    #[test]
    fn fixed_gain_disables_agc() {
        let config = parse(&["--gain", "4", "--samples", "0", "--bits", "14"]);
        assert_eq!(config.port_defaults().gain, Gain::G4);
        assert_eq!(config.port_defaults().resolution, Resolution::Bits14);
        let settings = config.loop_settings();
        assert!(!settings.agc.enabled);
        assert_eq!(settings.iterations, None);
    }

    #[test]
    fn illegal_settings_are_rejected() {
        let args = |a: &[&str]| Config::try_parse_from(std::iter::once("voltbank").chain(a.iter().copied()));
        assert!(args(&["--bits", "15"]).is_err());
        assert!(args(&["--gain", "3"]).is_err());
        assert!(parse(&["--delay=-1"]).validate().is_err());
        assert!(parse(&["--margin", "0.6"]).validate().is_err());
    }

    #[test]
    fn shown_ports_stop_at_port_count() {
        let config = parse(&["--port-count", "4", "-p", "1-5,3"]);
        config.validate().unwrap();
        assert_eq!(config.shown_ports(), vec![1, 2, 3, 4, 3]);
        assert_eq!(parse(&["-a", "68"]).shown_ports(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn direct_inputs() {
        let config = parse(&["--r1", "0"]);
        config.validate().unwrap();
        assert!(!config.port_defaults().divider.is_present());
    }
}
