use thiserror::Error;

use crate::core::domain::DomId;

pub mod handlers;

#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("Hypervisor Error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("Store Error: {0}")]
    Store(#[from] StoreError),

    #[error("Meminfo Error: {0}")]
    Meminfo(#[from] MeminfoError),

    #[error("Configuration Error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Domain {0} is not tracked")]
    UnknownDomain(DomId),
}

#[derive(Error, Debug)]
pub enum HypervisorError {
    /// The domain vanished between listing and the call, usually mid-shutdown.
    #[error("domain {domid} is gone")]
    DomainGone { domid: DomId },

    #[error("failed to run `{command}`: {message}")]
    Command { command: String, message: String },

    #[error("unexpected hypervisor output: {0}")]
    Parse(String),
}

impl HypervisorError {
    /// Transient errors are absorbed silently; everything else is logged loudly.
    pub fn is_transient(&self) -> bool {
        matches!(self, HypervisorError::DomainGone { .. })
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store read of {path} failed: {message}")]
    Read { path: String, message: String },

    #[error("store write of {path} failed: {message}")]
    Write { path: String, message: String },
}

/// Why a guest-supplied memory sample was thrown away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeminfoError {
    #[error("sample too large ({0} bytes)")]
    TooLarge(usize),

    #[error("sample is empty")]
    Empty,

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("field {field} has invalid value {value:?}")]
    InvalidValue { field: String, value: String },

    #[error("value of {0} overflows")]
    Overflow(&'static str),

    #[error("inconsistent sample: {0}")]
    Suspicious(&'static str),

    #[error("reported usage {used} exceeds plausible limit {limit}")]
    OutOfRange { used: u64, limit: u64 },
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

pub type BalancerResult<T> = Result<T, BalancerError>;
