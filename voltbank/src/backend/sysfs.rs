//! Access through the Linux IIO `mcp3422` driver.
//!
//! Each chip shows up as `/sys/bus/i2c/devices/<bus>-00<addr>/iio:deviceN/` with
//! per-channel `in_voltageN_raw` / `in_voltageN_scale` files, a chip-wide
//! `in_voltage_sampling_frequency`, and the lists of legal values in
//! `sampling_frequency_available` and `in_voltage_scale_available`. Resolution is
//! selected through the sampling frequency, gain through the scale.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use mcp342x::{Gain, Resolution};
use tracing::{debug, info, warn};

use super::{BackendError, ChannelBackend, ChipChannel, RawSample};

const SAMPLING_FREQUENCY: &str = "in_voltage_sampling_frequency";
const SAMPLING_FREQUENCY_AVAILABLE: &str = "sampling_frequency_available";
const SCALE_AVAILABLE: &str = "in_voltage_scale_available";

/// Legal values of one attribute, in the driver's order.
///
/// Position `i` maps to the `i`-th resolution (12, 14, 16, 18 bits) or gain (1, 2, 4, 8).
#[derive(Clone, Debug, PartialEq)]
pub struct OptionTable {
    options: Vec<String>,
}

impl OptionTable {
    pub fn parse(text: &str) -> Self {
        Self { options: text.split_whitespace().map(str::to_string).collect() }
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.options.get(index).map(String::as_str)
    }

    /// Position of `value`, compared as text first and as a number second.
    pub fn position(&self, value: &str) -> Option<usize> {
        let value = value.trim();
        if let Some(pos) = self.options.iter().position(|o| o == value) {
            return Some(pos);
        }
        let wanted: f64 = value.parse().ok()?;
        self.options.iter().position(|o| {
            o.parse::<f64>()
                .map(|v| (v - wanted).abs() <= f64::EPSILON * 16.0 * wanted.abs().max(1.0))
                .unwrap_or(false)
        })
    }

    pub fn resolution_for(&self, value: &str) -> Option<Resolution> {
        self.position(value).and_then(Resolution::from_index)
    }

    pub fn gain_for(&self, value: &str) -> Option<Gain> {
        self.position(value).and_then(Gain::from_index)
    }
}

/// Attribute directory of one chip.
#[derive(Clone, Debug)]
pub struct IioChip {
    dir: PathBuf,
}

impl IioChip {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Locate the `iio:device*` directory of the chip at `address` on I2C bus `bus`.
    pub fn discover(bus_root: &Path, bus: u8, address: u8) -> Result<Self, BackendError> {
        let device = bus_root.join(format!("{bus}-{address:04x}"));
        let entries = fs::read_dir(&device).map_err(|_| BackendError::NoDevice { address })?;
        let mut found: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("iio:device"))
            .map(|e| e.path())
            .collect();
        found.sort();
        found.into_iter().next().map(Self::new).ok_or(BackendError::NoDevice { address })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn raw_path(&self, chip: ChipChannel) -> PathBuf {
        self.dir.join(format!("in_voltage{}_raw", chip.channel.number() - 1))
    }

    fn scale_path(&self, chip: ChipChannel) -> PathBuf {
        self.dir.join(format!("in_voltage{}_scale", chip.channel.number() - 1))
    }

    fn attr(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

fn read_attr(path: &Path) -> Result<String, BackendError> {
    fs::read_to_string(path)
        .map(|s| s.trim_end_matches('\n').trim().to_string())
        .map_err(|source| BackendError::AttributeRead { path: path.to_path_buf(), source })
}

fn write_attr(path: &Path, value: &str) -> Result<(), BackendError> {
    fs::write(path, value).map_err(|source| BackendError::AttributeWrite {
        path: path.to_path_buf(),
        value: value.to_string(),
        source,
    })
}

fn read_table(path: &Path) -> Result<OptionTable, BackendError> {
    read_attr(path).map(|text| OptionTable::parse(&text))
}

fn option_at(table: &OptionTable, index: usize, path: &Path) -> Result<String, BackendError> {
    table.get(index).map(str::to_string).ok_or_else(|| BackendError::UnknownOption {
        path: path.to_path_buf(),
        value: format!("#{index}"),
        options: table.options.clone(),
    })
}

fn unknown(path: &Path, value: String, table: &OptionTable) -> BackendError {
    BackendError::UnknownOption { path: path.to_path_buf(), value, options: table.options.clone() }
}

/// Backend over IIO attribute files, one directory per chip address.
#[derive(Debug, Default)]
pub struct SysfsBackend {
    chips: HashMap<u8, IioChip>,
}

impl SysfsBackend {
    pub fn new(chips: impl IntoIterator<Item = (u8, IioChip)>) -> Self {
        Self { chips: chips.into_iter().collect() }
    }

    /// Resolve every address in `addresses`. Chips that are not present are left out
    /// and their ports will fail to read.
    #[tracing::instrument(skip(addresses))]
    pub fn discover(bus_root: &Path, bus: u8, addresses: &[u8]) -> Self {
        let mut chips = HashMap::new();
        for &address in addresses {
            match IioChip::discover(bus_root, bus, address) {
                Ok(chip) => {
                    info!("chip 0x{address:02x} at {}", chip.dir().display());
                    chips.insert(address, chip);
                }
                Err(e) => warn!("{e}"),
            }
        }
        Self { chips }
    }

    fn chip(&self, address: u8) -> Result<&IioChip, BackendError> {
        self.chips.get(&address).ok_or(BackendError::NoDevice { address })
    }
}

impl ChannelBackend for SysfsBackend {
    fn configure(&mut self, chip: ChipChannel, resolution: Resolution, gain: Gain) -> Result<(), BackendError> {
        let dev = self.chip(chip.address)?;

        let freq_path = dev.attr(SAMPLING_FREQUENCY);
        let freq_options_path = dev.attr(SAMPLING_FREQUENCY_AVAILABLE);
        let frequencies = read_table(&freq_options_path)?;
        let wanted = option_at(&frequencies, resolution.index(), &freq_options_path)?;
        let current = read_attr(&freq_path)?;
        if frequencies.position(&current) != Some(resolution.index()) {
            debug!("chip 0x{:02x}: sampling frequency {current} -> {wanted}", chip.address);
            write_attr(&freq_path, &wanted)?;
        }

        // The driver lists scales for the current sampling frequency only.
        let scale_options_path = dev.attr(SCALE_AVAILABLE);
        let scales = read_table(&scale_options_path)?;
        let scale = option_at(&scales, gain.index(), &scale_options_path)?;
        write_attr(&dev.scale_path(chip), &scale)
    }

    fn read_raw(&mut self, chip: ChipChannel, _resolution: Resolution, _gain: Gain) -> Result<RawSample, BackendError> {
        let path = self.chip(chip.address)?.raw_path(chip);
        let value = read_attr(&path)?;
        let code = value.parse().map_err(|_| BackendError::Parse { path, value })?;
        Ok(RawSample { code, bytes: Vec::new(), status: None })
    }

    fn read_config(&mut self, chip: ChipChannel) -> Result<(Resolution, Gain), BackendError> {
        let dev = self.chip(chip.address)?;

        let freq_options_path = dev.attr(SAMPLING_FREQUENCY_AVAILABLE);
        let frequencies = read_table(&freq_options_path)?;
        let frequency = read_attr(&dev.attr(SAMPLING_FREQUENCY))?;
        let resolution = frequencies
            .resolution_for(&frequency)
            .ok_or_else(|| unknown(&freq_options_path, frequency, &frequencies))?;

        let scale_options_path = dev.attr(SCALE_AVAILABLE);
        let scales = read_table(&scale_options_path)?;
        let scale = read_attr(&dev.scale_path(chip))?;
        let gain = scales.gain_for(&scale).ok_or_else(|| unknown(&scale_options_path, scale, &scales))?;

        Ok((resolution, gain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp342x::Channel;
    use tempfile::TempDir;
    use test_log::test;

    const SCALES_18: &str = "0.000015625 0.000007812 0.000003906 0.000001953\n";
    const SCALES_12: &str = "0.001000000 0.000500000 0.000250000 0.000125000\n";

    /// Lay out `1-0068/iio:device0` like the kernel does, at 18 bits and gain 1.
    fn fake_chip(root: &Path) -> PathBuf {
        let dir = root.join("1-0068").join("iio:device0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(SAMPLING_FREQUENCY_AVAILABLE), "240 60 15 3\n").unwrap();
        fs::write(dir.join(SAMPLING_FREQUENCY), "3\n").unwrap();
        fs::write(dir.join(SCALE_AVAILABLE), SCALES_18).unwrap();
        for ch in 0..4 {
            fs::write(dir.join(format!("in_voltage{ch}_raw")), format!("{}\n", -1000 * ch)).unwrap();
            fs::write(dir.join(format!("in_voltage{ch}_scale")), "0.000015625\n").unwrap();
        }
        dir
    }

    fn backend(root: &TempDir) -> SysfsBackend {
        SysfsBackend::discover(root.path(), 1, &[0x68, 0x69])
    }

    #[test]
    fn discovers_present_chips_only() {
        let root = TempDir::new().unwrap();
        let dir = fake_chip(root.path());
        let backend = backend(&root);
        assert_eq!(backend.chip(0x68).unwrap().dir(), dir);
        assert!(matches!(backend.chip(0x69), Err(BackendError::NoDevice { address: 0x69 })));
    }

    #[test]
    fn reads_signed_raw_value() {
        let root = TempDir::new().unwrap();
        fake_chip(root.path());
        let mut backend = backend(&root);
        let sample = backend.read_raw(ChipChannel::new(0x68, Channel::Ch3), Resolution::Bits18, Gain::G1).unwrap();
        assert_eq!(sample.code, -2000);
        assert!(sample.status.is_none());
    }

    #[test]
    fn garbage_raw_value_is_a_parse_error() {
        let root = TempDir::new().unwrap();
        let dir = fake_chip(root.path());
        fs::write(dir.join("in_voltage0_raw"), "busy\n").unwrap();
        let mut backend = backend(&root);
        let err = backend.read_raw(ChipChannel::new(0x68, Channel::Ch1), Resolution::Bits18, Gain::G1).unwrap_err();
        assert!(matches!(err, BackendError::Parse { .. }));
    }

    #[test]
    fn reads_config_by_position() {
        let root = TempDir::new().unwrap();
        let dir = fake_chip(root.path());
        fs::write(dir.join("in_voltage1_scale"), "0.000003906\n").unwrap();
        let mut backend = backend(&root);
        let config = backend.read_config(ChipChannel::new(0x68, Channel::Ch2)).unwrap();
        assert_eq!(config, (Resolution::Bits18, Gain::G4));
    }

    #[test]
    fn unknown_scale_is_reported() {
        let root = TempDir::new().unwrap();
        let dir = fake_chip(root.path());
        fs::write(dir.join("in_voltage0_scale"), "0.5\n").unwrap();
        let mut backend = backend(&root);
        let err = backend.read_config(ChipChannel::new(0x68, Channel::Ch1)).unwrap_err();
        assert!(matches!(err, BackendError::UnknownOption { value, .. } if value == "0.5"));
    }

    #[test]
    fn configure_writes_frequency_then_fresh_scale() {
        let root = TempDir::new().unwrap();
        let dir = fake_chip(root.path());
        // what the driver would publish once 240 SPS is selected
        fs::write(dir.join(SCALE_AVAILABLE), SCALES_12).unwrap();
        let mut backend = backend(&root);

        backend
            .configure(ChipChannel::new(0x68, Channel::Ch4), Resolution::Bits12, Gain::G2)
            .unwrap();

        assert_eq!(fs::read_to_string(dir.join(SAMPLING_FREQUENCY)).unwrap(), "240");
        assert_eq!(fs::read_to_string(dir.join("in_voltage3_scale")).unwrap(), "0.000500000");
        assert_eq!(fs::read_to_string(dir.join("in_voltage0_scale")).unwrap(), "0.000015625\n");
    }

    #[test]
    fn configure_keeps_matching_frequency() {
        let root = TempDir::new().unwrap();
        let dir = fake_chip(root.path());
        let mut backend = backend(&root);

        backend
            .configure(ChipChannel::new(0x68, Channel::Ch1), Resolution::Bits18, Gain::G8)
            .unwrap();

        assert_eq!(fs::read_to_string(dir.join(SAMPLING_FREQUENCY)).unwrap(), "3\n");
        assert_eq!(fs::read_to_string(dir.join("in_voltage0_scale")).unwrap(), "0.000001953");
    }

    #[test]
    fn option_table_matches_numerically() {
        let table = OptionTable::parse("0.001000000 0.000500000 0.000250000 0.000125000");
        assert_eq!(table.gain_for("0.001"), Some(Gain::G1));
        assert_eq!(table.gain_for("0.000125000\n"), Some(Gain::G8));
        assert_eq!(table.gain_for("0.0002"), None);
        assert_eq!(OptionTable::parse("240 60 15 3").resolution_for("15"), Some(Resolution::Bits16));
    }
}
