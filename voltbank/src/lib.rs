use std::future::Future;

use linux_embedded_hal::I2cdev;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use acquisition::{Acquisition, ReadingSink, RunSummary};
use backend::{BusBackend, ChannelBackend, SysfsBackend};
use config::{BackendKind, Config};
use display::ConsoleSink;
use registry::PortRegistry;

pub mod acquisition;
pub mod agc;
pub mod average;
pub mod backend;
pub mod calibration;
pub mod config;
pub mod converter;
pub mod display;
pub mod error;
pub mod registry;

pub use error::{Error, Result};

/// Set up the configured backend and poll until done or interrupted.
pub async fn voltbank(config: &Config) -> Result<RunSummary> {
    config.validate()?;

    let cancel = CancellationToken::new();
    let cloned_cancel = cancel.clone();

    // Spawn shutdown signal handler
    tokio::spawn(cancel_on(tokio::signal::ctrl_c(), cloned_cancel));

    let shown = config.shown_ports();
    if shown.is_empty() {
        warn!("none of the requested ports exist, showing all {}", config.port_count());
    }
    let mut sink = ConsoleSink::stdout(shown);

    match config.backend {
        BackendKind::Bus => {
            let i2c = I2cdev::new(&config.i2c_device).map_err(|e| Error::Device {
                path: config.i2c_device.clone(),
                reason: e.to_string(),
            })?;
            info!("I2C bus {} opened.", config.i2c_device.display());
            run_with(config, BusBackend::new(i2c), &mut sink, cancel).await
        }
        BackendKind::Sysfs => {
            let backend = SysfsBackend::discover(&config.sysfs_root, config.i2c_bus, &config.addresses.0);
            run_with(config, backend, &mut sink, cancel).await
        }
    }
}

/// Cancel `cancel` once `signal` fires. A handler that cannot be installed leaves the
/// loop running until its sample budget is spent.
async fn cancel_on<F>(signal: F, cancel: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received.");
            cancel.cancel();
        }
        Err(e) => warn!("cannot listen for Ctrl-C, stop with the sample budget: {e}"),
    }
}

/// Build the ports on `backend`, normalize them and run the acquisition loop.
pub async fn run_with<B, S>(config: &Config, backend: B, sink: &mut S, cancel: CancellationToken) -> Result<RunSummary>
where
    B: ChannelBackend,
    S: ReadingSink,
{
    let registry = PortRegistry::build(config.port_count(), &config.addresses.0, config.port_defaults(), backend)?;
    let mut acquisition = Acquisition::new(registry, config.loop_settings());
    acquisition.normalize().await?;
    acquisition.run(sink, cancel).await
}
