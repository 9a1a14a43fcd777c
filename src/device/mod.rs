//! Device identity: provisioning, authentication and the hub session.
//!
//! A session is established in three steps. The device registers with the
//! provisioning service using its symmetric key and learns which hub it was
//! assigned to; an authentication bound to the confirmed device id is built
//! from the same key; finally a session is opened against the assigned hub.
//! Each network step sits behind a trait so the relay can be driven without
//! a live service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RelayError;

pub mod hub;
pub mod provisioning;
pub mod sas;
pub mod transport;

pub use sas::SymmetricKey;
pub use transport::TransportKind;

/// Static device identity handed in from configuration.
#[derive(Debug, Clone)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub symmetric_key: SymmetricKey,
    pub provisioning_endpoint: String,
    pub id_scope: String,
    pub model_id: String,
}

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub assigned_hub: String,
    pub device_id: String,
}

/// Symmetric-key authentication for one device on one hub.
#[derive(Debug, Clone)]
pub struct SymmetricKeyAuth {
    pub device_id: String,
    key: SymmetricKey,
    token_ttl: Duration,
}

impl SymmetricKeyAuth {
    pub fn new(device_id: impl Into<String>, key: SymmetricKey, token_ttl: Duration) -> Self {
        SymmetricKeyAuth {
            device_id: device_id.into(),
            key,
            token_ttl,
        }
    }

    /// SAS token for the device resource on `hub`.
    pub fn hub_token(&self, hub: &str) -> Result<String, RelayError> {
        let resource = format!("{}/devices/{}", hub, self.device_id);
        Ok(sas::sas_token(
            &resource,
            &self.key,
            None,
            sas::expiry_from_now(self.token_ttl),
        )?)
    }
}

/// Options announced when the hub session is opened.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub model_id: Option<String>,
}

/// A device-to-cloud message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_encoding: String,
}

impl TelemetryMessage {
    pub fn json(body: impl Into<Vec<u8>>) -> Self {
        TelemetryMessage {
            body: body.into(),
            content_type: "application/json".to_string(),
            content_encoding: "utf-8".to_string(),
        }
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Register the device and wait for its hub assignment.
    async fn register(
        &self,
        credentials: &DeviceCredentials,
        cancel: &CancellationToken,
    ) -> Result<DeviceRegistration, RelayError>;
}

#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn connect(
        &self,
        hub: &str,
        auth: &SymmetricKeyAuth,
        options: &ClientOptions,
    ) -> Result<Box<dyn DeviceSession>, RelayError>;
}

/// An open, authenticated connection to a hub. Dropping it releases the
/// connection; `close` ends it gracefully.
#[async_trait]
pub trait DeviceSession: Send {
    async fn send(
        &mut self,
        message: TelemetryMessage,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError>;

    async fn close(self: Box<Self>) -> Result<(), RelayError>;
}

pub type DynProvisioner = Arc<dyn Provisioner>;
pub type DynHubConnector = Arc<dyn HubConnector>;

/// Provision the device and open an authenticated session on its assigned hub.
pub async fn establish_session(
    provisioner: &dyn Provisioner,
    connector: &dyn HubConnector,
    credentials: &DeviceCredentials,
    token_ttl: Duration,
    cancel: &CancellationToken,
) -> Result<Box<dyn DeviceSession>, SessionError> {
    debug!("Initializing via DPS");
    let registration = provisioner
        .register(credentials, cancel)
        .await
        .map_err(SessionError::Provisioning)?;
    info!(
        "device {} assigned to hub {}",
        registration.device_id, registration.assigned_hub
    );

    let auth = SymmetricKeyAuth::new(
        registration.device_id,
        credentials.symmetric_key.clone(),
        token_ttl,
    );
    let options = ClientOptions {
        model_id: Some(credentials.model_id.clone()),
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Connecting(RelayError::Cancelled)),
        session = connector.connect(&registration.assigned_hub, &auth, &options) => {
            session.map_err(SessionError::Connecting)
        }
    }
}

/// Which step of [`establish_session`] failed.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("provisioning failed: {0}")]
    Provisioning(RelayError),
    #[error("hub connection failed: {0}")]
    Connecting(RelayError),
}
