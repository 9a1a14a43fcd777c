//! Device-to-cloud session with the hub over MQTT.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, Outgoing, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::device::sas::url_encode;
use crate::device::transport::{self, MqttEndpoint, TransportKind};
use crate::device::{ClientOptions, DeviceSession, HubConnector, SymmetricKeyAuth, TelemetryMessage};
use crate::error::RelayError;

pub const HUB_API_VERSION: &str = "2021-04-12";

/// MQTT username for the hub; the model id is announced here for plug and play.
pub fn username(hub: &str, device_id: &str, options: &ClientOptions) -> String {
    let mut username = format!("{}/{}/?api-version={}", hub, device_id, HUB_API_VERSION);
    if let Some(model_id) = &options.model_id {
        username.push_str("&model-id=");
        username.push_str(&url_encode(model_id));
    }
    username
}

/// Telemetry topic with the content type and encoding as system properties.
pub fn telemetry_topic(device_id: &str, message: &TelemetryMessage) -> String {
    format!(
        "devices/{}/messages/events/$.ct={}&$.ce={}",
        device_id,
        url_encode(&message.content_type),
        url_encode(&message.content_encoding)
    )
}

#[derive(Debug, Clone)]
pub struct MqttHubConnector {
    transport: TransportKind,
    port: Option<u16>,
    keep_alive: Duration,
}

impl MqttHubConnector {
    pub fn new(transport: TransportKind, keep_alive: Duration) -> Self {
        MqttHubConnector {
            transport,
            port: None,
            keep_alive,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

#[async_trait]
impl HubConnector for MqttHubConnector {
    async fn connect(
        &self,
        hub: &str,
        auth: &SymmetricKeyAuth,
        options: &ClientOptions,
    ) -> Result<Box<dyn DeviceSession>, RelayError> {
        let endpoint = MqttEndpoint {
            transport: self.transport,
            host: hub.to_string(),
            port: self.port,
            keep_alive: self.keep_alive,
        };
        let mqtt_options = endpoint.options(
            &auth.device_id,
            username(hub, &auth.device_id, options),
            auth.hub_token(hub)?,
        );

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Incoming::ConnAck(ack)) => {
                    debug!("hub accepted connection: {:?}", ack.code);
                    break;
                }
                event => trace!(?event, "hub connect event"),
            }
        }
        info!("connected {} to {} over {}", auth.device_id, hub, self.transport);

        Ok(Box::new(MqttHubSession {
            client,
            eventloop,
            device_id: auth.device_id.clone(),
        }))
    }
}

pub struct MqttHubSession {
    client: AsyncClient,
    eventloop: EventLoop,
    device_id: String,
}

#[async_trait]
impl DeviceSession for MqttHubSession {
    async fn send(
        &mut self,
        message: TelemetryMessage,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let topic = telemetry_topic(&self.device_id, &message);
        let size = message.body.len();
        let client = &self.client;
        let eventloop = &mut self.eventloop;

        let delivery = async move {
            client
                .publish(topic, QoS::AtLeastOnce, false, message.body)
                .await?;
            let mut pkid = None;
            loop {
                match eventloop.poll().await? {
                    Event::Outgoing(Outgoing::Publish(id)) => pkid = Some(id),
                    Event::Incoming(Incoming::PubAck(ack)) if Some(ack.pkid) == pkid => {
                        return Ok(())
                    }
                    Event::Incoming(Incoming::Disconnect) => {
                        return Err(RelayError::Disconnected("the telemetry was acknowledged"))
                    }
                    event => trace!(?event, "hub send event"),
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("sending telemetry for {} cancelled", self.device_id);
                Err(RelayError::Cancelled)
            }
            result = delivery => {
                if result.is_ok() {
                    info!("delivered {} bytes of telemetry for {}", size, self.device_id);
                }
                result
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<(), RelayError> {
        let MqttHubSession {
            client,
            mut eventloop,
            device_id,
        } = *self;
        debug!("closing hub session for {}", device_id);
        transport::disconnect_within(&client, &mut eventloop, transport::DISCONNECT_GRACE).await
    }
}
