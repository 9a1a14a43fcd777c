use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Transport};
use tracing::{debug, warn};

use crate::error::RelayError;

/// Largest device-to-cloud message the hub accepts.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

/// How long a graceful close may take.
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

const WEBSOCKET_PATH: &str = "/$iothub/websocket";

#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub enum TransportKind {
    /// MQTT over TLS on port 8883.
    #[default]
    Mqtt,
    /// MQTT over secure websockets on port 443.
    MqttWebSocket,
}

impl TransportKind {
    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Mqtt => 8883,
            TransportKind::MqttWebSocket => 443,
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "Mqtt" | "MqttTcp" => Ok(TransportKind::Mqtt),
            "MqttWebSocket" | "MqttWs" => Ok(TransportKind::MqttWebSocket),
            other => Err(format!("Invalid or Unsupported transport {}", other)),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Where and how to open an MQTT connection.
#[derive(Debug, Clone)]
pub struct MqttEndpoint {
    pub transport: TransportKind,
    pub host: String,
    pub port: Option<u16>,
    pub keep_alive: Duration,
}

impl MqttEndpoint {
    pub fn new(transport: TransportKind, host: impl Into<String>, keep_alive: Duration) -> Self {
        MqttEndpoint {
            transport,
            host: host.into(),
            port: None,
            keep_alive,
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.transport.default_port())
    }

    /// Broker address as rumqttc expects it: a host name for TLS, a URL for websockets.
    pub fn broker_address(&self) -> String {
        match self.transport {
            TransportKind::Mqtt => self.host.clone(),
            TransportKind::MqttWebSocket => {
                format!("wss://{}:{}{}", self.host, self.port(), WEBSOCKET_PATH)
            }
        }
    }

    pub fn options(&self, client_id: &str, username: String, password: String) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.broker_address(), self.port());
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true)
            .set_credentials(username, password)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        match self.transport {
            TransportKind::Mqtt => options.set_transport(Transport::tls_with_default_config()),
            TransportKind::MqttWebSocket => {
                options.set_transport(Transport::wss_with_default_config())
            }
        };
        options
    }
}

/// Send DISCONNECT and drive the event loop until it has gone out, giving
/// up after `grace`.
pub async fn disconnect_within(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    grace: Duration,
) -> Result<(), RelayError> {
    match tokio::time::timeout(grace, disconnect(client, eventloop)).await {
        Ok(result) => result,
        Err(_) => {
            warn!("connection did not close within {:?}, dropping it", grace);
            Ok(())
        }
    }
}

/// Send DISCONNECT and drive the event loop until it has gone out.
pub async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) -> Result<(), RelayError> {
    client.disconnect().await?;
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                debug!("connection ended while disconnecting: {}", e);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("Mqtt".parse::<TransportKind>(), Ok(TransportKind::Mqtt));
        assert_eq!("MqttWs".parse::<TransportKind>(), Ok(TransportKind::MqttWebSocket));
        assert!("Amqp".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::MqttWebSocket.to_string(), "MqttWebSocket");
    }

    #[test]
    fn test_tls_endpoint() {
        let endpoint = MqttEndpoint::new(
            TransportKind::Mqtt,
            "global.azure-devices-provisioning.net",
            Duration::from_secs(30),
        );
        assert_eq!(endpoint.port(), 8883);
        assert_eq!(endpoint.broker_address(), "global.azure-devices-provisioning.net");
    }

    #[test]
    fn test_websocket_endpoint() {
        let mut endpoint = MqttEndpoint::new(
            TransportKind::MqttWebSocket,
            "plant-hub.azure-devices.net",
            Duration::from_secs(30),
        );
        assert_eq!(endpoint.port(), 443);
        assert_eq!(
            endpoint.broker_address(),
            "wss://plant-hub.azure-devices.net:443/$iothub/websocket"
        );

        endpoint.port = Some(8443);
        assert_eq!(
            endpoint.broker_address(),
            "wss://plant-hub.azure-devices.net:8443/$iothub/websocket"
        );
    }

    #[tokio::test]
    async fn test_disconnect_gives_up_on_a_silent_peer() {
        // accepts the connection and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let options = MqttOptions::new("press-4", "127.0.0.1", port);
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            disconnect_within(&client, &mut eventloop, Duration::from_millis(200)),
        )
        .await
        .expect("disconnect was not bounded by its grace period");
        assert!(result.is_ok());
        peer.abort();
    }
}
