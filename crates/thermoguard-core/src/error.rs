//! Error taxonomy.
//!
//! Setup errors (`NotEnrolled`, `NotBaselined`, `InvalidDevice`,
//! `InvalidOperation`, `InvalidConfig`) are caller errors and are the only ones allowed to end a
//! monitoring task. Sensor and store failures are transient: monitoring loops
//! count them and move on.

use std::time::Duration;

use crate::sensor::SensorError;
use crate::store::StoreError;

/// Which kind of baseline an operation required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineKind {
    Power,
    Thermal,
}

impl std::fmt::Display for BaselineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Power => write!(f, "power"),
            Self::Thermal => write!(f, "thermal"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("device {0} has no enrolled PUF signature")]
    NotEnrolled(String),

    #[error("device {device} has no {kind} baseline{}", operation_suffix(.operation))]
    NotBaselined {
        device: String,
        kind: BaselineKind,
        operation: Option<String>,
    },

    #[error("sensor read timed out after {0:?}")]
    SensorTimeout(Duration),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("insufficient samples: collected {got}, need at least {need}")]
    InsufficientSamples { got: usize, need: usize },

    #[error("invalid device identifier {0:?}")]
    InvalidDevice(String),

    #[error("invalid operation name {0:?}")]
    InvalidOperation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{detector} monitor already running for {key}")]
    AlreadyMonitoring { detector: &'static str, key: String },

    #[error("unknown security event {0}")]
    UnknownEvent(String),

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to load configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GuardError>;

fn operation_suffix(operation: &Option<String>) -> String {
    operation
        .as_deref()
        .map(|o| format!(" for operation {o}"))
        .unwrap_or_default()
}

impl GuardError {
    /// Whether a monitoring loop may continue after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SensorTimeout(_) | Self::Sensor(_) | Self::Store(_) | Self::InsufficientSamples { .. }
        )
    }
}

/// Separator between device and operation in composite keys. Neither part
/// may contain it, so a key names exactly one pair.
pub const KEY_SEPARATOR: char = '/';

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == KEY_SEPARATOR)
}

/// Reject empty device identifiers and ones containing whitespace or `/`.
pub fn validate_device(device: &str) -> Result<()> {
    if !valid_name(device) {
        return Err(GuardError::InvalidDevice(device.to_string()));
    }
    Ok(())
}

/// Same rules as [`validate_device`], for operation names.
pub fn validate_operation(operation: &str) -> Result<()> {
    if !valid_name(operation) {
        return Err(GuardError::InvalidOperation(operation.to_string()));
    }
    Ok(())
}

/// Key of a (device, operation) pair in keyed collections.
pub fn device_operation_key(device: &str, operation: &str) -> String {
    format!("{device}{KEY_SEPARATOR}{operation}")
}
