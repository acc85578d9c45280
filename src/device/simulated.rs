//! Simulated devices with randomised telemetry.

use std::sync::{Arc, PoisonError, RwLock};

use rand::Rng;
use rand::seq::SliceRandom;

use crate::device::{
    Credentials, Device, DeviceError, DiscoveredDevices, Discovery, DiscoveryOptions, Reading,
    StateSnapshot,
};

/// Model reported by every simulated device.
pub const SIMULATED_MODEL: &str = "SIM1";

/// States a simulated device cycles through.
pub const SIMULATED_STATUSES: [&str; 3] = ["starting", "running", "stopped"];

/// Firmware version reported by every simulated device.
const SIMULATED_VERSION: &str = "1.0.0";

/// A device whose every refresh draws fresh random readings.
#[derive(Debug)]
pub struct SimulatedDevice {
    address: String,
    device_id: String,
    alias: String,
    location: String,
    state: RwLock<StateSnapshot>,
}

impl SimulatedDevice {
    pub fn new(index: usize) -> Self {
        Self {
            address: format!("192.0.2.{}", index + 1),
            device_id: format!("sim-{index:04}"),
            alias: format!("Simulated Plug {}", index + 1),
            location: "server_room".to_string(),
            state: RwLock::new(StateSnapshot::new()),
        }
    }

    /// Set the `location` attribute.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }
}

/// One random draw; kept synchronous so the thread-local RNG never crosses an await.
fn random_state() -> StateSnapshot {
    let mut rng = rand::thread_rng();
    let status = SIMULATED_STATUSES
        .choose(&mut rng)
        .copied()
        .unwrap_or(SIMULATED_STATUSES[0]);

    StateSnapshot::from([
        ("temperature".to_string(), Reading::Number(rng.gen_range(20.0..30.0))),
        ("errors".to_string(), Reading::Number(f64::from(rng.gen_range(0u8..=5)))),
        ("latency".to_string(), Reading::Number(rng.gen_range(0.1..1.0))),
        ("response_time".to_string(), Reading::Number(rng.gen_range(0.1..2.0))),
        ("version".to_string(), Reading::from(SIMULATED_VERSION)),
        ("status".to_string(), Reading::from(status)),
    ])
}

#[async_trait::async_trait]
impl Device for SimulatedDevice {
    fn address(&self) -> &str {
        &self.address
    }

    fn device_id(&self) -> Option<String> {
        Some(self.device_id.clone())
    }

    fn alias(&self) -> String {
        self.alias.clone()
    }

    fn model(&self) -> String {
        SIMULATED_MODEL.to_string()
    }

    fn state(&self) -> StateSnapshot {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "location" => Some(self.location.clone()),
            "alias" => Some(self.alias()),
            "model" => Some(self.model()),
            "address" => Some(self.address.clone()),
            "device_id" => self.device_id(),
            _ => self.state().get(name).map(Reading::to_string),
        }
    }

    async fn refresh(&self) -> Result<(), DeviceError> {
        let state = random_state();
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Discovery that "finds" a fixed number of simulated devices every round.
#[derive(Debug, Clone)]
pub struct SimulatedDiscovery {
    count: usize,
}

impl SimulatedDiscovery {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

#[async_trait::async_trait]
impl Discovery for SimulatedDiscovery {
    async fn discover(
        &self,
        _credentials: &Credentials,
        _options: &DiscoveryOptions,
    ) -> Result<DiscoveredDevices, DeviceError> {
        Ok((0..self.count)
            .map(|i| {
                let device: Arc<dyn Device> = Arc::new(SimulatedDevice::new(i));
                (device.address().to_string(), device)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refresh_populates_state() {
        let device = SimulatedDevice::new(0);
        assert!(device.state().is_empty());

        device.refresh().await.unwrap();
        let state = device.state();
        let temperature = state["temperature"].as_f64().unwrap();
        assert!((20.0..30.0).contains(&temperature));
        let errors = state["errors"].as_f64().unwrap();
        assert!((0.0..=5.0).contains(&errors));
        assert!(SIMULATED_STATUSES.contains(&state["status"].as_str().unwrap()));
        assert_eq!(state["version"].as_str(), Some("1.0.0"));
    }

    #[test]
    fn test_attributes() {
        let device = SimulatedDevice::new(2).with_location("lab");
        assert_eq!(device.address(), "192.0.2.3");
        assert_eq!(device.attribute("location").as_deref(), Some("lab"));
        assert_eq!(device.attribute("device_id").as_deref(), Some("sim-0002"));
        assert_eq!(device.attribute("model").as_deref(), Some(SIMULATED_MODEL));
        assert_eq!(device.attribute("missing"), None);
    }

    #[tokio::test]
    async fn test_discovery_returns_distinct_addresses() {
        let found = SimulatedDiscovery::new(3)
            .discover(&Credentials::default(), &DiscoveryOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.contains_key("192.0.2.1"));
        assert!(found.contains_key("192.0.2.3"));
    }
}
