//! Device registration against the Device Provisioning Service over MQTT.
//!
//! The device publishes a register request, the service answers `202` with an
//! operation id while the assignment is in progress, and the device polls the
//! operation status until the service answers `200` with the assigned hub.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, QoS};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::device::sas;
use crate::device::transport::{self, MqttEndpoint, TransportKind};
use crate::device::{DeviceCredentials, DeviceRegistration, Provisioner};
use crate::error::RelayError;

pub const DPS_API_VERSION: &str = "2019-03-31";
pub const RESPONSE_TOPIC_FILTER: &str = "$dps/registrations/res/#";
const RESPONSE_TOPIC_PREFIX: &str = "$dps/registrations/res/";
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(3);

pub fn username(id_scope: &str, registration_id: &str) -> String {
    format!(
        "{}/registrations/{}/api-version={}",
        id_scope, registration_id, DPS_API_VERSION
    )
}

pub fn register_topic(request_id: u32) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={}", request_id)
}

pub fn operation_status_topic(request_id: u32, operation_id: &str) -> String {
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={}&operationId={}",
        request_id, operation_id
    )
}

/// Registration request body; the model id travels as additional payload.
pub fn register_body(registration_id: &str, model_id: &str) -> Result<String, serde_json::Error> {
    serde_json::to_string(&json!({
        "registrationId": registration_id,
        "payload": { "modelId": model_id },
    }))
}

/// Parsed `$dps/registrations/res/<status>/?$rid=<n>&retry-after=<s>` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseTopic {
    pub status: u16,
    pub request_id: Option<u32>,
    pub retry_after: Option<Duration>,
}

pub fn parse_response_topic(topic: &str) -> Option<ResponseTopic> {
    let rest = topic.strip_prefix(RESPONSE_TOPIC_PREFIX)?;
    let (status, query) = rest.split_once('/').unwrap_or((rest, ""));
    let status = status.parse::<u16>().ok()?;

    let mut response = ResponseTopic {
        status,
        request_id: None,
        retry_after: None,
    };
    for pair in query.trim_start_matches('?').split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = percent_decode_str(value).decode_utf8_lossy();
        match key {
            "$rid" => response.request_id = value.parse().ok(),
            "retry-after" => response.retry_after = value.parse().ok().map(Duration::from_secs),
            _ => {}
        }
    }
    Some(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationStatus {
    operation_id: Option<String>,
    status: Option<String>,
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    assigned_hub: Option<String>,
    device_id: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceError {
    error_code: Option<u64>,
    message: Option<String>,
}

/// What the device should do after a provisioning response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationStep {
    Poll {
        operation_id: String,
        retry_after: Duration,
    },
    Assigned(DeviceRegistration),
}

pub fn interpret_response(
    response: &ResponseTopic,
    payload: &[u8],
) -> Result<RegistrationStep, RelayError> {
    if response.status >= 300 {
        let message = match serde_json::from_slice::<ServiceError>(payload) {
            Ok(ServiceError {
                error_code: Some(code),
                message: Some(message),
            }) => format!("{} (error code {})", message, code),
            Ok(ServiceError {
                message: Some(message),
                ..
            }) => message,
            _ => String::from_utf8_lossy(payload).into_owned(),
        };
        return Err(RelayError::ProvisioningRejected {
            status: response.status,
            message,
        });
    }

    let operation: OperationStatus = serde_json::from_slice(payload)?;
    let retry_after = response.retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
    match operation.status.as_deref() {
        Some("assigned") => {
            let state = operation.registration_state.ok_or_else(|| {
                RelayError::ProvisioningProtocol("assigned without registration state".to_string())
            })?;
            match (state.assigned_hub, state.device_id) {
                (Some(assigned_hub), Some(device_id)) => {
                    Ok(RegistrationStep::Assigned(DeviceRegistration {
                        assigned_hub,
                        device_id,
                    }))
                }
                _ => Err(RelayError::ProvisioningProtocol(
                    "assigned without hub or device id".to_string(),
                )),
            }
        }
        Some("assigning") | Some("unassigned") => poll(operation.operation_id, retry_after),
        None if response.status == 202 => poll(operation.operation_id, retry_after),
        Some(other) => Err(RelayError::ProvisioningRejected {
            status: response.status,
            message: format!(
                "registration {}: {}",
                other,
                operation
                    .registration_state
                    .and_then(|s| s.error_message)
                    .unwrap_or_default()
            ),
        }),
        None => Err(RelayError::ProvisioningProtocol(format!(
            "status {} without registration status",
            response.status
        ))),
    }
}

fn poll(operation_id: Option<String>, retry_after: Duration) -> Result<RegistrationStep, RelayError> {
    let operation_id = operation_id.ok_or_else(|| {
        RelayError::ProvisioningProtocol("pending registration without operation id".to_string())
    })?;
    Ok(RegistrationStep::Poll {
        operation_id,
        retry_after,
    })
}

/// Registers devices over MQTT (TLS or secure websockets).
#[derive(Debug, Clone)]
pub struct MqttProvisioner {
    transport: TransportKind,
    port: Option<u16>,
    keep_alive: Duration,
    token_ttl: Duration,
}

impl MqttProvisioner {
    pub fn new(transport: TransportKind, keep_alive: Duration, token_ttl: Duration) -> Self {
        MqttProvisioner {
            transport,
            port: None,
            keep_alive,
            token_ttl,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

#[async_trait]
impl Provisioner for MqttProvisioner {
    async fn register(
        &self,
        credentials: &DeviceCredentials,
        cancel: &CancellationToken,
    ) -> Result<DeviceRegistration, RelayError> {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        let registration_id = credentials.device_id.as_str();
        let endpoint = MqttEndpoint {
            transport: self.transport,
            host: credentials.provisioning_endpoint.clone(),
            port: self.port,
            keep_alive: self.keep_alive,
        };

        let resource = format!("{}/registrations/{}", credentials.id_scope, registration_id);
        let password = sas::sas_token(
            &resource,
            &credentials.symmetric_key,
            Some("registration"),
            sas::expiry_from_now(self.token_ttl),
        )?;
        let options = endpoint.options(
            registration_id,
            username(&credentials.id_scope, registration_id),
            password,
        );

        info!(
            "registering {} with {} over {}",
            registration_id,
            endpoint.broker_address(),
            self.transport
        );
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("provisioning of {} cancelled", registration_id);
                Err(RelayError::Cancelled)
            }
            result = exchange(&client, &mut eventloop, credentials) => result,
        }
    }
}

async fn exchange(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    credentials: &DeviceCredentials,
) -> Result<DeviceRegistration, RelayError> {
    let mut request_id = 1;
    client
        .subscribe(RESPONSE_TOPIC_FILTER, QoS::AtLeastOnce)
        .await?;
    client
        .publish(
            register_topic(request_id),
            QoS::AtLeastOnce,
            false,
            register_body(&credentials.device_id, &credentials.model_id)?,
        )
        .await?;

    loop {
        let publish = match eventloop.poll().await? {
            Event::Incoming(Incoming::Publish(publish)) => publish,
            Event::Incoming(Incoming::Disconnect) => {
                return Err(RelayError::Disconnected("the device was assigned"))
            }
            event => {
                trace!(?event, "provisioning event");
                continue;
            }
        };

        let Some(response) = parse_response_topic(&publish.topic) else {
            debug!("ignoring message on {}", publish.topic);
            continue;
        };
        if response.request_id.is_some_and(|id| id != request_id) {
            debug!("ignoring stale response on {}", publish.topic);
            continue;
        }

        match interpret_response(&response, &publish.payload)? {
            RegistrationStep::Assigned(registration) => {
                if let Err(e) =
                    transport::disconnect_within(client, eventloop, transport::DISCONNECT_GRACE).await
                {
                    debug!("provisioning connection did not close cleanly: {}", e);
                }
                return Ok(registration);
            }
            RegistrationStep::Poll {
                operation_id,
                retry_after,
            } => {
                debug!(
                    "registration operation {} in progress, polling in {:?}",
                    operation_id, retry_after
                );
                tokio::time::sleep(retry_after).await;
                request_id += 1;
                client
                    .publish(
                        operation_status_topic(request_id, &operation_id),
                        QoS::AtLeastOnce,
                        false,
                        Vec::new(),
                    )
                    .await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_strings() {
        assert_eq!(
            username("0ne00ABCDEF", "press-4"),
            "0ne00ABCDEF/registrations/press-4/api-version=2019-03-31"
        );
        assert_eq!(
            register_topic(1),
            "$dps/registrations/PUT/iotdps-register/?$rid=1"
        );
        assert_eq!(
            operation_status_topic(2, "4.abc.def"),
            "$dps/registrations/GET/iotdps-get-operationstatus/?$rid=2&operationId=4.abc.def"
        );
    }

    #[test]
    fn test_register_body_carries_model_id() {
        let body = register_body("press-4", "dtmi:com:example:Press;1").unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["registrationId"], "press-4");
        assert_eq!(value["payload"]["modelId"], "dtmi:com:example:Press;1");
    }

    #[test]
    fn test_parse_response_topic() {
        assert_eq!(
            parse_response_topic("$dps/registrations/res/202/?$rid=1&retry-after=3"),
            Some(ResponseTopic {
                status: 202,
                request_id: Some(1),
                retry_after: Some(Duration::from_secs(3)),
            })
        );
        assert_eq!(
            parse_response_topic("$dps/registrations/res/200/?$rid=2"),
            Some(ResponseTopic {
                status: 200,
                request_id: Some(2),
                retry_after: None,
            })
        );
        assert_eq!(
            parse_response_topic("$dps/registrations/res/401"),
            Some(ResponseTopic {
                status: 401,
                request_id: None,
                retry_after: None,
            })
        );
        assert_eq!(parse_response_topic("devices/x/messages/devicebound/"), None);
        assert_eq!(parse_response_topic("$dps/registrations/res/abc/?$rid=1"), None);
    }

    fn topic(status: u16) -> ResponseTopic {
        ResponseTopic {
            status,
            request_id: Some(1),
            retry_after: None,
        }
    }

    #[test]
    fn test_pending_response_polls() {
        let step = interpret_response(
            &ResponseTopic {
                retry_after: Some(Duration::from_secs(5)),
                ..topic(202)
            },
            br#"{"operationId":"4.abc","status":"assigning"}"#,
        )
        .unwrap();
        assert_eq!(
            step,
            RegistrationStep::Poll {
                operation_id: "4.abc".to_string(),
                retry_after: Duration::from_secs(5),
            }
        );

        let step = interpret_response(&topic(202), br#"{"operationId":"4.abc"}"#).unwrap();
        assert_eq!(
            step,
            RegistrationStep::Poll {
                operation_id: "4.abc".to_string(),
                retry_after: DEFAULT_RETRY_AFTER,
            }
        );
    }

    #[test]
    fn test_assigned_response() {
        let payload = br#"{
            "operationId": "4.abc",
            "status": "assigned",
            "registrationState": {
                "registrationId": "press-4",
                "assignedHub": "plant-hub.azure-devices.net",
                "deviceId": "press-4",
                "status": "assigned",
                "substatus": "initialAssignment"
            }
        }"#;
        let step = interpret_response(&topic(200), payload).unwrap();
        assert_eq!(
            step,
            RegistrationStep::Assigned(DeviceRegistration {
                assigned_hub: "plant-hub.azure-devices.net".to_string(),
                device_id: "press-4".to_string(),
            })
        );
    }

    #[test]
    fn test_assigned_without_hub_is_protocol_error() {
        let payload = br#"{"operationId":"4.abc","status":"assigned","registrationState":{"deviceId":"press-4"}}"#;
        let err = interpret_response(&topic(200), payload).unwrap_err();
        assert!(matches!(err, RelayError::ProvisioningProtocol(_)));
    }

    #[test]
    fn test_failed_registration_is_rejected() {
        let payload = br#"{"operationId":"4.abc","status":"failed","registrationState":{"errorMessage":"Custom allocation failed"}}"#;
        let err = interpret_response(&topic(200), payload).unwrap_err();
        match err {
            RelayError::ProvisioningRejected { status, message } => {
                assert_eq!(status, 200);
                assert_eq!(message, "registration failed: Custom allocation failed");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_error_status_is_rejected() {
        let err = interpret_response(
            &topic(401),
            br#"{"errorCode":401002,"trackingId":"x","message":"Unauthorized"}"#,
        )
        .unwrap_err();
        match err {
            RelayError::ProvisioningRejected { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Unauthorized (error code 401002)");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = interpret_response(&topic(500), b"gateway down").unwrap_err();
        assert!(matches!(
            err,
            RelayError::ProvisioningRejected { status: 500, ref message } if message == "gateway down"
        ));
    }

    #[tokio::test]
    async fn test_cancelled_registration() {
        let credentials = DeviceCredentials {
            device_id: "press-4".to_string(),
            symmetric_key: sas::SymmetricKey::new("c2VjcmV0"),
            provisioning_endpoint: "127.0.0.1".to_string(),
            id_scope: "0ne00ABCDEF".to_string(),
            model_id: "dtmi:com:example:Press;1".to_string(),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let provisioner = MqttProvisioner::new(
            TransportKind::Mqtt,
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
        .with_port(9);
        let result = provisioner.register(&credentials, &cancel).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }
}
