//! Error type shared by the acquisition engine.

use std::path::PathBuf;

use mcp342x::ParameterError;
use thiserror::Error;

use crate::backend::BackendError;
use crate::calibration::CalibrationMissing;

/// Exit status used when the conversion model has no entry for a setting.
pub const CALIBRATION_MISSING_EXIT: u8 = 112;

#[derive(Error, Debug)]
pub enum Error {
    /// Resolution, gain or channel outside the legal set. Raised before any I/O.
    #[error("invalid parameter: {0}")]
    InvalidParameter(#[from] ParameterError),
    #[error(transparent)]
    CalibrationMissing(#[from] CalibrationMissing),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("unknown port {0}")]
    UnknownPort(usize),
    #[error("port {port} needs chip #{chip} but only {available} chip addresses are configured")]
    MissingChipAddress { port: usize, chip: usize, available: usize },
    #[error("cannot open {path}: {reason}")]
    Device { path: PathBuf, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::CalibrationMissing(_) => CALIBRATION_MISSING_EXIT,
            Error::InvalidParameter(_) | Error::Config(_) | Error::MissingChipAddress { .. } => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
