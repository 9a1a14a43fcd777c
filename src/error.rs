use std::fmt;

use serde::Serialize;

use crate::telemetry::ReshapeError;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("could not reshape the reading: {0}")]
    Reshape(#[from] ReshapeError),
    #[error("device key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),
    #[error("provisioning service answered {status}: {message}")]
    ProvisioningRejected { status: u16, message: String },
    #[error("unexpected provisioning response: {0}")]
    ProvisioningProtocol(String),
    #[error("mqtt request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("mqtt connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("connection closed before {0}")]
    Disconnected(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    #[error("dead-letter delivery failed: {0}")]
    DeadLetter(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Progress of one inbound event through the relay.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize)]
pub enum RelayState {
    Received,
    Transforming,
    TransformOk,
    TransformFailed,
    Provisioning,
    Authenticated,
    Sending,
    Closed,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A relay error together with the state the event was in when it happened.
#[derive(thiserror::Error, Debug)]
#[error("relay failed in state {state}: {source}")]
pub struct RelayFailure {
    pub state: RelayState,
    #[source]
    pub source: RelayError,
}

impl RelayFailure {
    pub fn new(state: RelayState, source: impl Into<RelayError>) -> Self {
        RelayFailure {
            state,
            source: source.into(),
        }
    }
}

/// Failures left over after every message of an invocation was attempted.
#[derive(thiserror::Error, Debug)]
#[error("{} of {total} messages could not be relayed: {}", .errors.len(), .errors.join("; "))]
pub struct BatchError {
    pub total: usize,
    pub errors: Vec<String>,
}
