//! Physical transports: USB-serial and WiFi/TCP.
//!
//! Both are opened as a byte stream and split into a [`DeviceTransport`]. The
//! serial path requires the `serial` feature.

use crate::config::TransportConfig;
use crate::connection::Connectable;
use crate::device::{ConnectionKind, DeviceIdentity};
use crate::error::{AppResult, DaqError};
use crate::protocol::DeviceTransport;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Where a device can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceEndpoint {
    /// USB CDC serial port
    Usb {
        /// Port path (`/dev/ttyACM0`, `COM3`)
        port: String,
        /// Baud rate
        baud_rate: u32,
    },
    /// TCP over WiFi
    Wifi {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
}

impl DeviceEndpoint {
    /// Connection kind of this endpoint.
    pub fn connection_kind(&self) -> ConnectionKind {
        match self {
            DeviceEndpoint::Usb { .. } => ConnectionKind::Usb,
            DeviceEndpoint::Wifi { .. } => ConnectionKind::Wifi,
        }
    }

    /// Open the endpoint.
    pub async fn open(&self, connect_timeout: Duration) -> AppResult<DeviceTransport> {
        match self {
            DeviceEndpoint::Usb { port, baud_rate } => open_serial(port, *baud_rate).await,
            DeviceEndpoint::Wifi { host, port } => {
                let stream = tokio::time::timeout(
                    connect_timeout,
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .map_err(|_| {
                    DaqError::Timeout(
                        connect_timeout.as_millis() as u64,
                        format!("connecting to {host}:{port}"),
                    )
                })??;
                stream.set_nodelay(true)?;
                debug!(%host, port, "TCP connection established");
                Ok(DeviceTransport::from_stream(stream))
            }
        }
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEndpoint::Usb { port, baud_rate } => write!(f, "usb:{port}@{baud_rate}"),
            DeviceEndpoint::Wifi { host, port } => write!(f, "tcp:{host}:{port}"),
        }
    }
}

/// Open a serial port with 8N1 framing and no flow control.
#[cfg(feature = "serial")]
async fn open_serial(port: &str, baud_rate: u32) -> AppResult<DeviceTransport> {
    use tokio_serial::SerialPortBuilderExt;

    let path = port.to_string();
    let stream = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await?
    .map_err(std::io::Error::from)?;
    debug!(port, baud_rate, "Serial port opened");
    Ok(DeviceTransport::from_stream(stream))
}

#[cfg(not(feature = "serial"))]
async fn open_serial(_port: &str, _baud_rate: u32) -> AppResult<DeviceTransport> {
    Err(DaqError::FeatureNotEnabled("serial".to_string()))
}

/// A device reachable at an endpoint, connectable through the registry.
///
/// After a successful connect the transport is parked in the link until
/// [`DeviceLink::take_transport`] hands it to a [`crate::device::DaqDevice`].
pub struct DeviceLink {
    endpoint: DeviceEndpoint,
    identity: Mutex<DeviceIdentity>,
    connect_timeout: Duration,
    transport: Mutex<Option<DeviceTransport>>,
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink")
            .field("endpoint", &self.endpoint)
            .field("identity", &*self.identity.lock())
            .finish_non_exhaustive()
    }
}

impl DeviceLink {
    /// Link to `endpoint`. The identity's connection kind follows the endpoint.
    pub fn new(endpoint: DeviceEndpoint, mut identity: DeviceIdentity, config: &TransportConfig) -> Self {
        identity.connection = endpoint.connection_kind();
        Self {
            endpoint,
            identity: Mutex::new(identity),
            connect_timeout: config.connect_timeout(),
            transport: Mutex::new(None),
        }
    }

    /// Endpoint of this link.
    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    /// Take the opened transport.
    pub fn take_transport(&self) -> Option<DeviceTransport> {
        self.transport.lock().take()
    }
}

#[async_trait]
impl Connectable for DeviceLink {
    fn identity(&self) -> DeviceIdentity {
        self.identity.lock().clone()
    }

    fn set_identity(&self, mut identity: DeviceIdentity) {
        identity.connection = self.endpoint.connection_kind();
        *self.identity.lock() = identity;
    }

    async fn connect(&self) -> AppResult<()> {
        let transport = self.endpoint.open(self.connect_timeout).await?;
        *self.transport.lock() = Some(transport);
        info!(endpoint = %self.endpoint, "Device link open");
        Ok(())
    }

    async fn disconnect(&self) -> AppResult<()> {
        if self.transport.lock().take().is_some() {
            info!(endpoint = %self.endpoint, "Device link closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn wifi_link_connects_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 19];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let link = DeviceLink::new(
            DeviceEndpoint::Wifi {
                host: addr.ip().to_string(),
                port: addr.port(),
            },
            DeviceIdentity::with_serial("7E28", ConnectionKind::Usb),
            &TransportConfig::default(),
        );
        assert_eq!(link.identity().connection, ConnectionKind::Wifi);

        link.connect().await.unwrap();
        let mut transport = link.take_transport().unwrap();
        transport.writer.write_all(b"SYSTem:SYSInfoPB?\r\n").await.unwrap();
        transport.writer.flush().await.unwrap();

        assert_eq!(&server.await.unwrap(), b"SYSTem:SYSInfoPB?\r\n");
        assert!(link.take_transport().is_none());
    }

    #[tokio::test]
    async fn refused_tcp_connect_is_an_error() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = DeviceEndpoint::Wifi {
            host: "127.0.0.1".to_string(),
            port,
        };
        assert!(endpoint.open(Duration::from_secs(2)).await.is_err());
    }

    #[test]
    fn endpoint_display() {
        let usb = DeviceEndpoint::Usb {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
        };
        assert_eq!(usb.to_string(), "usb:/dev/ttyACM0@9600");
        assert_eq!(usb.connection_kind(), ConnectionKind::Usb);
    }
}
