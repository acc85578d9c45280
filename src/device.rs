//! Device Layer
//!
//! Device handles, discovery collaborators and the metric catalogs that
//! describe them.
//!
//! - [`Device`] / [`Discovery`]: collaborator traits consumed by the registry
//! - [`kasa`]: legacy smart-plug protocol client
//! - [`simulated`]: randomised devices for running without hardware
//! - [`catalog`]: metric catalogs and dimension sets per device kind

pub mod catalog;
pub mod kasa;
pub mod simulated;
mod traits;

pub use traits::{
    Credentials, DEFAULT_DISCOVERY_TARGET, DEFAULT_DISCOVERY_TIMEOUT, Device, DeviceError,
    DiscoveredDevices, Discovery, DiscoveryOptions, Reading, StateSnapshot,
};
