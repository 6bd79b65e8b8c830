//! The polling loop.
//!
//! Each cycle runs four phases in order over all ports: read, convert, publish, tune.
//! Reads happen before any gain change so a new setting never touches a buffered sample.

use std::time::Duration;

use chrono::{DateTime, Local};
use mcp342x::Resolution;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agc::AutoGain;
use crate::average::RollingAverage;
use crate::backend::ChannelBackend;
use crate::converter::{self, ConversionResult};
use crate::error::Result;
use crate::registry::{ConfigCheck, Port, PortRegistry};

/// One port's outcome for one cycle.
#[derive(Clone, Debug)]
pub struct PortReading<'a> {
    pub timestamp: DateTime<Local>,
    pub cycle: u64,
    pub port: &'a Port,
    /// `None` when the port could not be read this cycle.
    pub conversion: Option<ConversionResult>,
    /// Mean true voltage over the recent valid samples.
    pub average: Option<f64>,
    /// Converter load back-solved from the known calibration voltage.
    pub estimated_load: Option<f64>,
}

/// Receives readings as they are produced.
pub trait ReadingSink {
    fn publish(&mut self, reading: &PortReading<'_>);

    /// Called after the last port of `cycle` was published.
    fn cycle_complete(&mut self, _cycle: u64) {}
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoopSettings {
    /// Pause between cycles.
    pub interval: Duration,
    /// Number of cycles to run; `None` runs until cancelled.
    pub iterations: Option<u64>,
    /// Resolution every port is brought to before polling starts.
    pub resolution: Resolution,
    pub agc: AutoGain,
    /// Known source voltage for load estimation.
    pub calibrate: Option<f64>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1500),
            iterations: Some(1),
            resolution: Resolution::Bits18,
            agc: AutoGain::default(),
            calibrate: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub cancelled: bool,
}

pub struct Acquisition<B> {
    registry: PortRegistry<B>,
    settings: LoopSettings,
    averages: Vec<RollingAverage>,
    cycle: u64,
}

impl<B: ChannelBackend> Acquisition<B> {
    pub fn new(registry: PortRegistry<B>, settings: LoopSettings) -> Self {
        let averages = vec![RollingAverage::default(); registry.len()];
        Self { registry, settings, averages, cycle: 0 }
    }

    pub fn registry(&self) -> &PortRegistry<B> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PortRegistry<B> {
        &mut self.registry
    }

    pub fn into_registry(self) -> PortRegistry<B> {
        self.registry
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Bring every valid port to the configured resolution, then wait once for the
    /// slowest port to settle. Returns the number of ports changed.
    #[tracing::instrument(skip(self))]
    pub async fn normalize(&mut self) -> Result<usize> {
        let target = self.settings.resolution;
        let ids: Vec<usize> = self.registry.ports().filter(|p| p.is_valid()).map(|p| p.id()).collect();

        let mut changed = 0;
        for id in ids {
            let stale = match self.registry.verify(id) {
                Ok(ConfigCheck::InSync) => false,
                Ok(ConfigCheck::Diverged { actual, .. }) => actual.0 != target,
                Err(e) => {
                    debug!("port {id}: setting not readable, reapplying: {e}");
                    true
                }
            };
            let stored = self.registry.get(id).map(|p| p.resolution());
            if !stale && stored == Some(target) {
                continue;
            }
            match self.registry.apply_resolution(id, target) {
                Ok(()) => changed += 1,
                Err(e) => warn!("port {id}: cannot set resolution {target}: {e}"),
            }
        }

        if changed > 0 {
            let settle = self.registry.settle_time();
            info!("{changed} ports set to {target}, settling for {settle:?}");
            tokio::time::sleep(settle).await;
        }
        Ok(changed)
    }

    /// Run one read, convert, publish, tune cycle.
    ///
    /// Only a missing calibration entry is an error; port failures are reported as
    /// readings without a conversion. Returns the number of ports given a new gain.
    pub fn cycle<S: ReadingSink>(&mut self, sink: &mut S) -> Result<usize> {
        self.cycle += 1;
        let cycle = self.cycle;
        let timestamp = Local::now();

        let valid = self.registry.read_all();
        debug!("cycle {cycle}: {valid}/{} ports read", self.registry.len());

        let mut conversions = Vec::with_capacity(self.registry.len());
        for port in self.registry.ports() {
            let conversion = if port.is_valid() { Some(converter::convert(port)?) } else { None };
            conversions.push(conversion);
        }

        for ((port, conversion), average) in self.registry.ports().zip(&conversions).zip(&mut self.averages) {
            if let Some(result) = conversion {
                if !result.load_plausible {
                    warn!("port {}: implausible load estimate {:.0} ohm", port.id(), result.load_resistance);
                }
                average.add(result.true_voltage);
            }
            let estimated_load = match (self.settings.calibrate, conversion) {
                (Some(known), Some(result)) if port.divider().is_present() => {
                    converter::estimate_load(known, result.adc_voltage, &port.divider())
                }
                _ => None,
            };
            sink.publish(&PortReading {
                timestamp,
                cycle,
                port,
                conversion: *conversion,
                average: average.average(),
                estimated_load,
            });
        }
        sink.cycle_complete(cycle);

        let ids: Vec<usize> = self.registry.ports().map(|p| p.id()).collect();
        let mut retuned = 0;
        for id in ids {
            if self.settings.agc.tune(&mut self.registry, id)?.target().is_some() {
                retuned += 1;
            }
        }
        Ok(retuned)
    }

    /// Poll until the iteration budget is spent or `cancel` fires.
    pub async fn run<S: ReadingSink>(&mut self, sink: &mut S, cancel: CancellationToken) -> Result<RunSummary> {
        let start = self.cycle;
        let iterations = self.settings.iterations;
        let budget_left = |done: u64| iterations.map_or(true, |n| done - start < n);

        let mut cancelled = false;
        while budget_left(self.cycle) {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let retuned = self.cycle(sink)?;
            if !budget_left(self.cycle) {
                break;
            }
            let pause = if retuned > 0 {
                // a new gain needs one full conversion before the next read
                self.settings.interval.max(self.registry.settle_time())
            } else {
                self.settings.interval
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {},
                _ = cancel.cancelled() => {
                    info!("Received shutdown signal.");
                    cancelled = true;
                    break;
                }
            }
        }

        let summary = RunSummary { cycles: self.cycle - start, cancelled };
        info!("acquisition stopped after {} cycles", summary.cycles);
        Ok(summary)
    }
}
