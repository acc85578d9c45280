//! UDP broadcast discovery for legacy plugs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};

use super::device::{DEFAULT_DEVICE_TIMEOUT, KasaPlug};
use super::protocol::{self, DEFAULT_PORT};
use crate::device::{Credentials, DeviceError, DiscoveredDevices, Discovery, DiscoveryOptions};

/// Requests sent per discovery round; UDP gives no delivery guarantee.
const REQUEST_COUNT: usize = 3;

/// Largest reply accepted.
const MAX_DATAGRAM: usize = 4096;

/// Finds plugs by broadcasting a system-info request and collecting replies.
#[derive(Debug, Clone)]
pub struct KasaDiscovery {
    port: u16,
    device_timeout: Duration,
    timezone: Tz,
}

impl Default for KasaDiscovery {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
            timezone: Tz::UTC,
        }
    }
}

impl KasaDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the port requests are sent to and discovered plugs are queried on.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the per-device timeout handed to discovered plugs.
    pub fn with_device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    /// Set the zone handed to discovered plugs for their energy statistics.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }
}

#[async_trait::async_trait]
impl Discovery for KasaDiscovery {
    async fn discover(
        &self,
        credentials: &Credentials,
        options: &DiscoveryOptions,
    ) -> Result<DiscoveredDevices, DeviceError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;

        let request = protocol::encrypt(&serde_json::to_vec(&protocol::discovery_request())?);
        let target = (options.target.as_str(), self.port);
        for _ in 0..REQUEST_COUNT {
            socket.send_to(&request, target).await?;
        }

        let deadline = Instant::now() + options.timeout;
        let mut found = DiscoveredDevices::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        // Listen for the whole window; the timeout ends the round, not an error.
        while let Ok(received) = timeout_at(deadline, socket.recv_from(&mut buf)).await {
            let (len, peer) = received?;
            let address = peer.ip().to_string();
            if found.contains_key(&address) {
                continue;
            }

            let reply = match serde_json::from_slice(&protocol::decrypt(&buf[..len])) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::debug!(address = %address, error = %e, "Ignoring undecodable reply");
                    continue;
                }
            };
            let now = Utc::now().with_timezone(&self.timezone);
            let info = match protocol::parse_response(&reply, now) {
                Ok(info) => info,
                Err(e) => {
                    tracing::debug!(address = %address, error = %e, "Ignoring malformed reply");
                    continue;
                }
            };

            tracing::debug!(address = %address, alias = %info.alias, model = %info.model, "Discovered device");
            let plug = KasaPlug::new(address.clone())
                .with_port(self.port)
                .with_timeout(self.device_timeout)
                .with_timezone(self.timezone)
                .with_credentials(credentials.clone())
                .with_info(info);
            found.insert(address, Arc::new(plug));
        }

        Ok(found)
    }
}
