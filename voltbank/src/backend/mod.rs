//! Channel backends: how a port's samples and settings reach the chip.
//!
//! Two implementations exist. [`bus::BusBackend`] talks to the chips directly over I2C
//! and sends the configuration with every read. [`sysfs::SysfsBackend`] goes through the
//! kernel's IIO `mcp3422` driver and its attribute files, where a new setting only
//! applies to the next conversion.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use mcp342x::{Channel, Gain, ParameterError, Resolution, Status};
use thiserror::Error;

pub mod bus;
pub mod sysfs;

pub use bus::BusBackend;
pub use sysfs::SysfsBackend;

/// Physical location of one port: chip bus address and input channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChipChannel {
    pub address: u8,
    pub channel: Channel,
}

impl ChipChannel {
    pub fn new(address: u8, channel: Channel) -> Self {
        Self { address, channel }
    }
}

/// One acquired sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawSample {
    /// Signed conversion result.
    pub code: i32,
    /// Bytes as received from the chip, empty when the value came from an attribute file.
    pub bytes: Vec<u8>,
    /// Status byte echoed by the chip, if the backend sees it.
    pub status: Option<Status>,
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I2C transaction with chip 0x{address:02x} failed: {reason}")]
    Bus { address: u8, reason: String },
    #[error("no status recorded for chip 0x{address:02x} channel {channel}")]
    NoStatus { address: u8, channel: u8 },
    #[error("chip 0x{address:02x} channel {channel}: conversion not finished")]
    NotReady { address: u8, channel: u8 },
    #[error("no IIO device found for chip 0x{address:02x}")]
    NoDevice { address: u8 },
    #[error("failed to read {path}: {source}")]
    AttributeRead { path: PathBuf, source: io::Error },
    #[error("failed to write {value:?} to {path}: {source}")]
    AttributeWrite { path: PathBuf, value: String, source: io::Error },
    #[error("{path}: cannot parse {value:?}")]
    Parse { path: PathBuf, value: String },
    #[error("{path}: {value:?} is not one of {options:?}")]
    UnknownOption { path: PathBuf, value: String, options: Vec<String> },
    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

/// Acquisition and configuration I/O for ports.
///
/// Callers must read a port before changing its settings within a cycle: a setting
/// written through the attribute interface changes how an already buffered value
/// is scaled.
pub trait ChannelBackend {
    /// Push resolution and gain for `chip`. Takes effect on the next conversion.
    fn configure(&mut self, chip: ChipChannel, resolution: Resolution, gain: Gain) -> Result<(), BackendError>;

    /// Acquire one sample at the given setting.
    fn read_raw(&mut self, chip: ChipChannel, resolution: Resolution, gain: Gain) -> Result<RawSample, BackendError>;

    /// Setting the hardware currently reports for `chip`.
    fn read_config(&mut self, chip: ChipChannel) -> Result<(Resolution, Gain), BackendError>;

    /// How long to wait after `configure` before the new setting is reflected in samples.
    fn settle_time(&self, resolution: Resolution) -> Duration {
        resolution.conversion_time().mul_f32(1.2)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scriptable in-memory backend for engine tests.

    use std::collections::{HashMap, HashSet, VecDeque};

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Op {
        Read(ChipChannel),
        Configure(ChipChannel, Resolution, Gain),
    }

    #[derive(Default)]
    pub struct FakeBackend {
        /// Queued codes per port; the last one repeats once the queue runs dry.
        pub codes: HashMap<ChipChannel, VecDeque<i32>>,
        pub failing_reads: HashSet<ChipChannel>,
        pub failing_configure: bool,
        /// Setting reported by `read_config`, updated by successful `configure` calls.
        pub hardware: HashMap<ChipChannel, (Resolution, Gain)>,
        pub ops: Vec<Op>,
        pub settle: Duration,
    }

    impl FakeBackend {
        pub fn set_codes(&mut self, chip: ChipChannel, codes: &[i32]) {
            self.codes.insert(chip, codes.iter().copied().collect());
        }

        pub fn configures(&self) -> Vec<Op> {
            self.ops.iter().filter(|op| matches!(op, Op::Configure(..))).cloned().collect()
        }
    }

    impl ChannelBackend for FakeBackend {
        fn configure(&mut self, chip: ChipChannel, resolution: Resolution, gain: Gain) -> Result<(), BackendError> {
            self.ops.push(Op::Configure(chip, resolution, gain));
            if self.failing_configure {
                return Err(BackendError::Bus { address: chip.address, reason: "configure refused".into() });
            }
            self.hardware.insert(chip, (resolution, gain));
            Ok(())
        }

        fn read_raw(&mut self, chip: ChipChannel, _resolution: Resolution, _gain: Gain) -> Result<RawSample, BackendError> {
            self.ops.push(Op::Read(chip));
            if self.failing_reads.contains(&chip) {
                return Err(BackendError::Bus { address: chip.address, reason: "no ACK".into() });
            }
            let queue = self.codes.entry(chip).or_default();
            let code = if queue.len() > 1 { queue.pop_front() } else { queue.front().copied() };
            Ok(RawSample { code: code.unwrap_or(0), bytes: Vec::new(), status: None })
        }

        fn read_config(&mut self, chip: ChipChannel) -> Result<(Resolution, Gain), BackendError> {
            self.hardware
                .get(&chip)
                .copied()
                .ok_or(BackendError::NoStatus { address: chip.address, channel: chip.channel.number() })
        }

        fn settle_time(&self, _resolution: Resolution) -> Duration {
            self.settle
        }
    }
}
