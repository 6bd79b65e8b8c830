//! Logical ports and their physical addresses.
//!
//! Ports are numbered from 1. Every expansion board carries two MCP3424 chips with four
//! channels each, so ports 1-4 are chip #0, ports 5-8 chip #1 (both on board 1), port 9
//! starts chip #2 on board 2, and so on. The chip number indexes the configured list of
//! bus addresses.

use std::time::Duration;

use mcp342x::{Channel, Gain, Resolution, Status};
use tracing::{info, warn};

use crate::backend::{ChannelBackend, ChipChannel};
use crate::error::{Error, Result};

pub const CHANNELS_PER_CHIP: usize = 4;
pub const CHIPS_PER_BOARD: usize = 2;

/// Position of a port in the chip stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelAddress {
    /// Index into the address book, 0-based.
    pub chip_index: usize,
    pub channel: Channel,
}

impl ChannelAddress {
    /// Address of the 1-based `port`; `None` for port 0.
    pub fn for_port(port: usize) -> Option<Self> {
        let index = port.checked_sub(1)?;
        Some(Self {
            chip_index: index / CHANNELS_PER_CHIP,
            channel: Channel::ALL[index % CHANNELS_PER_CHIP],
        })
    }

    /// 1-based board number.
    pub fn board(&self) -> usize {
        self.chip_index / CHIPS_PER_BOARD + 1
    }
}

/// Resistor pair in front of a port. `r1 == 0` means the input is wired directly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Divider {
    /// High side, ohms.
    pub r1: f64,
    /// Low side, ohms.
    pub r2: f64,
}

impl Divider {
    pub const DIRECT: Divider = Divider { r1: 0.0, r2: 0.0 };

    pub fn new(r1: f64, r2: f64) -> Self {
        Self { r1, r2 }
    }

    pub fn is_present(&self) -> bool {
        self.r1 > 0.0
    }
}

/// Setting every port starts with.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PortDefaults {
    pub resolution: Resolution,
    pub gain: Gain,
    pub divider: Divider,
}

impl Default for PortDefaults {
    fn default() -> Self {
        Self {
            resolution: Resolution::Bits18,
            gain: Gain::G1,
            divider: Divider::new(120_000.0, 20_000.0),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Port {
    id: usize,
    address: ChannelAddress,
    chip: ChipChannel,
    resolution: Resolution,
    gain: Gain,
    divider: Divider,
    code: i32,
    valid: bool,
    status: Option<Status>,
    config_synced: bool,
}

impl Port {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn address(&self) -> ChannelAddress {
        self.address
    }

    pub fn chip(&self) -> ChipChannel {
        self.chip
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn gain(&self) -> Gain {
        self.gain
    }

    pub fn divider(&self) -> Divider {
        self.divider
    }

    /// Last raw code; meaningful only while [`Port::is_valid`].
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Whether the last read succeeded.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Status byte echoed on the last read, for backends that see it.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Whether the last echoed status reported a finished conversion.
    pub fn ready(&self) -> Option<bool> {
        self.status.map(|s| s.ready)
    }

    /// `false` after a configuration push failed, until the next one succeeds.
    pub fn config_synced(&self) -> bool {
        self.config_synced
    }
}

/// Result of comparing a port's stored setting with what the hardware reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigCheck {
    InSync,
    Diverged {
        expected: (Resolution, Gain),
        actual: (Resolution, Gain),
    },
}

/// Owns every port and the backend that reaches them.
pub struct PortRegistry<B> {
    ports: Vec<Port>,
    backend: B,
}

impl<B: ChannelBackend> PortRegistry<B> {
    /// Create ports 1..=`port_count` and prime each with one configure and one read.
    ///
    /// A port that cannot be primed is kept but marked invalid.
    #[tracing::instrument(skip(address_book, backend))]
    pub fn build(port_count: usize, address_book: &[u8], defaults: PortDefaults, backend: B) -> Result<Self> {
        if port_count == 0 {
            return Err(Error::Config("at least one port is required".into()));
        }
        let mut ports = Vec::with_capacity(port_count);
        for id in 1..=port_count {
            let address = ChannelAddress::for_port(id).ok_or(Error::UnknownPort(id))?;
            let chip_address = *address_book.get(address.chip_index).ok_or(Error::MissingChipAddress {
                port: id,
                chip: address.chip_index,
                available: address_book.len(),
            })?;
            ports.push(Port {
                id,
                address,
                chip: ChipChannel::new(chip_address, address.channel),
                resolution: defaults.resolution,
                gain: defaults.gain,
                divider: defaults.divider,
                code: 0,
                valid: false,
                status: None,
                config_synced: false,
            });
        }

        let mut registry = Self { ports, backend };
        for id in 1..=port_count {
            if let Err(e) = registry.push_config(id) {
                warn!("port {id}: priming configuration failed: {e}");
            }
            registry.read(id)?;
        }
        let valid = registry.ports.iter().filter(|p| p.valid).count();
        info!("{port_count} ports built, {valid} answering");
        Ok(registry)
    }

    pub fn get(&self, id: usize) -> Option<&Port> {
        id.checked_sub(1).and_then(|i| self.ports.get(i))
    }

    fn port_mut(&mut self, id: usize) -> Result<&mut Port> {
        id.checked_sub(1)
            .and_then(|i| self.ports.get_mut(i))
            .ok_or(Error::UnknownPort(id))
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Acquire one sample for `id`; returns whether it is valid.
    pub fn read(&mut self, id: usize) -> Result<bool> {
        let (chip, resolution, gain) = {
            let port = self.port_mut(id)?;
            (port.chip, port.resolution, port.gain)
        };
        let result = self.backend.read_raw(chip, resolution, gain);
        let port = self.port_mut(id)?;
        match result {
            Ok(sample) => {
                port.code = sample.code;
                port.status = sample.status;
                port.valid = true;
            }
            Err(e) => {
                if port.valid {
                    warn!("port {id}: read failed, marking invalid: {e}");
                }
                port.valid = false;
                port.status = None;
            }
        }
        Ok(port.valid)
    }

    /// Read every port in order. Returns the number of valid ports.
    pub fn read_all(&mut self) -> usize {
        (1..=self.ports.len())
            .filter(|&id| matches!(self.read(id), Ok(true)))
            .count()
    }

    /// Validate `bits` and push the new resolution. Does not wait for it to settle.
    pub fn set_resolution(&mut self, id: usize, bits: u8) -> Result<()> {
        let resolution = Resolution::try_from(bits)?;
        self.apply_resolution(id, resolution)
    }

    /// Validate `gain` and push it. Does not wait for it to settle.
    pub fn set_gain(&mut self, id: usize, gain: u8) -> Result<()> {
        let gain = Gain::try_from(gain)?;
        self.apply_gain(id, gain)
    }

    pub fn apply_resolution(&mut self, id: usize, resolution: Resolution) -> Result<()> {
        let port = self.port_mut(id)?;
        if port.resolution != resolution {
            info!("port {id}: resolution {} -> {}", port.resolution, resolution);
        }
        port.resolution = resolution;
        self.push_config(id)
    }

    pub fn apply_gain(&mut self, id: usize, gain: Gain) -> Result<()> {
        let port = self.port_mut(id)?;
        if port.gain != gain {
            info!(
                "port {id}: gain {} -> {} (LSB {:.3} uV)",
                port.gain,
                gain,
                port.resolution.lsb() / f64::from(gain.factor()) * 1e6
            );
        }
        port.gain = gain;
        self.push_config(id)
    }

    /// Send the stored setting of `id` to the hardware.
    fn push_config(&mut self, id: usize) -> Result<()> {
        let (chip, resolution, gain) = {
            let port = self.port_mut(id)?;
            (port.chip, port.resolution, port.gain)
        };
        let result = self.backend.configure(chip, resolution, gain);
        let port = self.port_mut(id)?;
        port.config_synced = result.is_ok();
        Ok(result?)
    }

    /// Compare the stored setting of `id` with the hardware.
    pub fn verify(&mut self, id: usize) -> Result<ConfigCheck> {
        let (chip, expected) = {
            let port = self.port_mut(id)?;
            (port.chip, (port.resolution, port.gain))
        };
        let actual = self.backend.read_config(chip)?;
        if actual == expected {
            Ok(ConfigCheck::InSync)
        } else {
            warn!("port {id}: stored {:?} but hardware reports {:?}", expected, actual);
            Ok(ConfigCheck::Diverged { expected, actual })
        }
    }

    /// Longest settle time over all ports at their current resolution.
    pub fn settle_time(&self) -> Duration {
        self.ports
            .iter()
            .map(|p| self.backend.settle_time(p.resolution))
            .max()
            .unwrap_or_default()
    }
}
