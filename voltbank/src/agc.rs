//! Automatic gain control.
//!
//! Keeps each port's raw code away from the rails while using as much amplification as
//! the signal allows. Gain moves at most one notch per port per cycle.

use mcp342x::{Gain, Resolution};
use tracing::warn;

use crate::backend::ChannelBackend;
use crate::error::{Error, Result};
use crate::registry::PortRegistry;

pub const DEFAULT_MARGIN: f64 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GainStep {
    Hold,
    Lower(Gain),
    Raise(Gain),
}

impl GainStep {
    pub fn target(self) -> Option<Gain> {
        match self {
            GainStep::Hold => None,
            GainStep::Lower(gain) | GainStep::Raise(gain) => Some(gain),
        }
    }
}

/// Upper code bound; the lower bound is its negation.
pub fn upper_bound(resolution: Resolution, margin_fraction: f64) -> f64 {
    let span = 2f64.powi(i32::from(resolution.bits()));
    span / 2.0 - span * margin_fraction
}

/// Gain change for a port that read `code` at `resolution` and `gain`.
pub fn decide(code: i32, resolution: Resolution, gain: Gain, margin_fraction: f64) -> GainStep {
    let upper = upper_bound(resolution, margin_fraction);
    let lower = -upper;
    let code = f64::from(code);

    if let Some(next) = gain.step_down() {
        if code > upper || code < lower {
            return GainStep::Lower(next);
        }
    }
    if let Some(next) = gain.step_up() {
        if lower / 2.0 < code && code < upper / 2.0 {
            return GainStep::Raise(next);
        }
    }
    GainStep::Hold
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AutoGain {
    pub margin: f64,
    pub enabled: bool,
}

impl Default for AutoGain {
    fn default() -> Self {
        Self { margin: DEFAULT_MARGIN, enabled: true }
    }
}

impl AutoGain {
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Push at most one gain change for port `id`. Invalid ports are skipped.
    pub fn tune<B: ChannelBackend>(&self, registry: &mut PortRegistry<B>, id: usize) -> Result<GainStep> {
        let port = registry.get(id).ok_or(Error::UnknownPort(id))?;
        if !self.enabled || !port.is_valid() {
            return Ok(GainStep::Hold);
        }
        let step = decide(port.code(), port.resolution(), port.gain(), self.margin);
        if let Some(gain) = step.target() {
            match registry.apply_gain(id, gain) {
                Ok(()) => {}
                Err(Error::Backend(e)) => warn!("port {id}: gain change not applied: {e}"),
                Err(e) => return Err(e),
            }
        }
        Ok(step)
    }
}
