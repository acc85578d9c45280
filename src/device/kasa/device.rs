//! Legacy smart-plug handle.

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::protocol::{self, DEFAULT_PORT, DeviceInfo};
use crate::device::{Credentials, Device, DeviceError, StateSnapshot};

/// Default connect and query timeout (5 seconds).
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(5);

/// One plug reachable over the legacy TCP protocol.
///
/// The TCP connection is opened lazily by [`Device::refresh`] and kept until
/// [`Device::disconnect`].
pub struct KasaPlug {
    address: String,
    port: u16,
    timeout: Duration,
    credentials: Credentials,
    timezone: Tz,
    conn: Mutex<Option<TcpStream>>,
    info: RwLock<DeviceInfo>,
}

impl KasaPlug {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_DEVICE_TIMEOUT,
            credentials: Credentials::default(),
            timezone: Tz::UTC,
            conn: Mutex::new(None),
            info: RwLock::new(DeviceInfo::default()),
        }
    }

    /// Set the TCP port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the connect and query timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the zone whose calendar date selects daily and monthly energy.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Carry credentials for authenticated transports.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Seed identity and state, e.g. from a discovery reply.
    pub fn with_info(self, info: DeviceInfo) -> Self {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn read_info<T>(&self, f: impl FnOnce(&DeviceInfo) -> T) -> T {
        f(&self.info.read().unwrap_or_else(PoisonError::into_inner))
    }

    async fn query(&self, conn: &mut Option<TcpStream>) -> Result<DeviceInfo, DeviceError> {
        let now = Utc::now().with_timezone(&self.timezone);
        let stream = match conn.take() {
            Some(stream) => stream,
            None => {
                let target = format!("{}:{}", self.address, self.port);
                let stream = timeout(self.timeout, TcpStream::connect(&target))
                    .await
                    .map_err(|_| DeviceError::Timeout)??;
                tracing::debug!(address = %self.address, port = self.port, "Connected to device");
                stream
            }
        };
        let stream = conn.insert(stream);

        let exchange = async {
            protocol::write_frame(stream, &protocol::refresh_request(now.date_naive())).await?;
            protocol::read_frame(stream).await
        };
        let response = timeout(self.timeout, exchange)
            .await
            .map_err(|_| DeviceError::Timeout)??;

        protocol::parse_response(&response, now)
    }
}

impl std::fmt::Debug for KasaPlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KasaPlug")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("timezone", &self.timezone)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Device for KasaPlug {
    fn address(&self) -> &str {
        &self.address
    }

    fn device_id(&self) -> Option<String> {
        self.read_info(|i| i.device_id.clone())
    }

    fn alias(&self) -> String {
        self.read_info(|i| i.alias.clone())
    }

    fn model(&self) -> String {
        self.read_info(|i| i.model.clone())
    }

    fn state(&self) -> StateSnapshot {
        self.read_info(|i| i.state.clone())
    }

    async fn refresh(&self) -> Result<(), DeviceError> {
        let mut conn = self.conn.lock().await;
        match self.query(&mut conn).await {
            Ok(info) => {
                *self.info.write().unwrap_or_else(PoisonError::into_inner) = info;
                Ok(())
            }
            Err(e) => {
                // A half-read frame leaves the stream unusable.
                *conn = None;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        if self.conn.lock().await.take().is_some() {
            tracing::trace!(address = %self.address, "Disconnected from device");
        }
        Ok(())
    }
}
