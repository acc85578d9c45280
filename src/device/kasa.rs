//! Local-network client for legacy smart plugs.
//!
//! - [`KasaDiscovery`]: UDP broadcast discovery
//! - [`KasaPlug`]: TCP query handle implementing [`Device`](crate::device::Device)

mod device;
mod discovery;
pub mod protocol;

pub use device::{DEFAULT_DEVICE_TIMEOUT, KasaPlug};
pub use discovery::KasaDiscovery;
pub use protocol::DeviceInfo;
