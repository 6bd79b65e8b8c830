//! Direct I2C access: one `write_read` per sample, configuration sent every time.

use std::collections::HashMap;

use embedded_hal::i2c::I2c;
use mcp342x::{Config, Gain, MCP342x, Resolution, Status};
use tracing::{debug, warn};

use super::{BackendError, ChannelBackend, ChipChannel, RawSample};

/// Plain reads, one conversion time apart, while the status byte reports a conversion in progress.
const READY_POLLS: usize = 3;

pub struct BusBackend<I2C> {
    adc: MCP342x<I2C>,
    /// Status byte echoed on the last successful read of each port.
    last_status: HashMap<ChipChannel, Status>,
}

impl<I2C, E> BusBackend<I2C>
where
    I2C: I2c<Error = E>,
    I2C::Error: std::error::Error + 'static,
{
    pub fn new(i2c: I2C) -> Self {
        Self { adc: MCP342x::new(i2c), last_status: HashMap::new() }
    }

    pub fn release(self) -> I2C {
        self.adc.release()
    }
}

fn bus_error<E: std::error::Error + 'static>(address: u8) -> impl FnOnce(mcp342x::Error<E>) -> BackendError {
    move |e| BackendError::Bus { address, reason: e.to_string() }
}

impl<I2C, E> ChannelBackend for BusBackend<I2C>
where
    I2C: I2c<Error = E>,
    I2C::Error: std::error::Error + 'static,
{
    fn configure(&mut self, chip: ChipChannel, resolution: Resolution, gain: Gain) -> Result<(), BackendError> {
        let config = Config::new(chip.channel, resolution, gain);
        self.adc.configure(chip.address, &config).map_err(bus_error(chip.address))
    }

    fn read_raw(&mut self, chip: ChipChannel, resolution: Resolution, gain: Gain) -> Result<RawSample, BackendError> {
        let config = Config::new(chip.channel, resolution, gain);
        let mut sample = self.adc.read_sample(chip.address, &config).map_err(bus_error(chip.address))?;
        let mut polls = 0;
        while !sample.status.ready && polls < READY_POLLS {
            std::thread::sleep(resolution.conversion_time());
            sample = self.adc.read_latest(chip.address, resolution).map_err(bus_error(chip.address))?;
            polls += 1;
        }
        if !sample.status.ready {
            warn!("chip 0x{:02x}: conversion still pending after {polls} polls", chip.address);
            return Err(BackendError::NotReady { address: chip.address, channel: chip.channel.number() });
        }
        debug!("chip 0x{:02x}: bytes {:02x?}, status {}", chip.address, sample.bytes, sample.status);
        self.last_status.insert(chip, sample.status);
        Ok(RawSample { code: sample.code, bytes: sample.bytes, status: Some(sample.status) })
    }

    /// The chip has one configuration register shared by its channels, so the setting a
    /// port actually used is the status echoed on that port's last read. Without one,
    /// the live register only answers for the channel it currently selects.
    fn read_config(&mut self, chip: ChipChannel) -> Result<(Resolution, Gain), BackendError> {
        if let Some(status) = self.last_status.get(&chip) {
            return Ok((status.config.resolution, status.config.gain));
        }
        let status = self.adc.read_status(chip.address).map_err(bus_error(chip.address))?;
        if status.config.channel != chip.channel {
            return Err(BackendError::NoStatus { address: chip.address, channel: chip.channel.number() });
        }
        Ok((status.config.resolution, status.config.gain))
    }
}
