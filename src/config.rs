use std::fmt::Debug;
use std::str::FromStr;
use std::string::String;
use std::time::Duration;
use std::{env, fmt};

use aws_config::SdkConfig;
use aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueError;

use crate::device::{DeviceCredentials, SymmetricKey, TransportKind};
use crate::telemetry::reshape::{DuplicateMetrics, MetricsLayout, ReshapeOptions, SAMPLE_READING};

pub const DEFAULT_DPS_ENDPOINT: &str = "global.azure-devices-provisioning.net";
const SECRETS_MANAGER_ARN_PREFIX: &str = "arn:aws:secretsmanager:";

pub struct Config {
    pub model_id: String,
    pub dps_endpoint: String,
    pub dps_id_scope: String,
    pub device_id: String,
    pub symmetric_key: SymmetricKey,
    pub provisioning_transport: TransportKind,
    pub hub_transport: TransportKind,
    pub failure_policy: FailurePolicy,
    pub dlq_url: Option<String>,
    pub dlq_s3_bucket: Option<String>,
    pub send_on_transform_failure: bool,
    pub fallback_body: String,
    pub duplicate_metrics: DuplicateMetrics,
    pub metrics_layout: MetricsLayout,
    pub sas_token_ttl: Duration,
    pub deadline_margin: Duration,
    pub mqtt_keep_alive: Duration,
}

/// What happens to an event that could not be relayed.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub enum FailurePolicy {
    /// Log the failure and complete the invocation normally.
    #[default]
    Swallow,
    /// Fail the invocation so the platform can retry it.
    Propagate,
    /// Store the event in the dead-letter sinks and complete normally.
    DeadLetter,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "Swallow" => Ok(FailurePolicy::Swallow),
            "Propagate" => Ok(FailurePolicy::Propagate),
            "DeadLetter" => Ok(FailurePolicy::DeadLetter),
            other => Err(format!("Invalid or Unsupported failure policy {}", other)),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn required(name: &str) -> Result<String, String> {
    env::var(name).map_err(|e| format!("{} not set - {}", name, e))
}

fn parsed<T>(name: &str, default: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    env::var(name)
        .unwrap_or(default.to_string())
        .parse::<T>()
        .map_err(|e| format!("Error parsing {} - {}", name, e))
}

impl Config {
    pub fn load_from_env() -> Result<Config, String> {
        let conf = Config {
            model_id: required("MODEL_ID")?,
            dps_endpoint: env::var("DPS_ENDPOINT").unwrap_or(DEFAULT_DPS_ENDPOINT.to_string()),
            dps_id_scope: required("DPS_ID_SCOPE")?,
            device_id: required("DEVICE_ID")?,
            symmetric_key: required("DEVICE_SYMMETRIC_KEY")?.into(),
            provisioning_transport: parsed("PROVISIONING_TRANSPORT", "Mqtt")?,
            hub_transport: parsed("HUB_TRANSPORT", "Mqtt")?,
            failure_policy: parsed("FAILURE_POLICY", "Swallow")?,
            dlq_url: env::var("DLQ_URL").ok().filter(|s| !s.trim().is_empty()),
            dlq_s3_bucket: env::var("DLQ_S3_BUCKET").ok().filter(|s| !s.trim().is_empty()),
            send_on_transform_failure: env::var("SEND_ON_TRANSFORM_FAILURE")
                .unwrap_or("true".to_string())
                .parse::<bool>()
                .unwrap_or(true),
            fallback_body: env::var("FALLBACK_BODY").unwrap_or(SAMPLE_READING.to_string()),
            duplicate_metrics: parsed("DUPLICATE_METRICS", "Append")?,
            metrics_layout: parsed("METRICS_LAYOUT", "Object")?,
            sas_token_ttl: Duration::from_secs(parsed("SAS_TOKEN_TTL_SECS", "3600")?),
            deadline_margin: Duration::from_millis(parsed("DEADLINE_MARGIN_MS", "1000")?),
            mqtt_keep_alive: Duration::from_secs(parsed("MQTT_KEEP_ALIVE_SECS", "30")?),
        };

        if conf.failure_policy == FailurePolicy::DeadLetter
            && conf.dlq_url.is_none()
            && conf.dlq_s3_bucket.is_none()
        {
            return Err("FAILURE_POLICY is DeadLetter but neither DLQ_URL nor DLQ_S3_BUCKET is set".to_string());
        }

        Ok(conf)
    }

    pub fn credentials(&self) -> DeviceCredentials {
        DeviceCredentials {
            device_id: self.device_id.clone(),
            symmetric_key: self.symmetric_key.clone(),
            provisioning_endpoint: self.dps_endpoint.clone(),
            id_scope: self.dps_id_scope.clone(),
            model_id: self.model_id.clone(),
        }
    }

    pub fn reshape_options(&self) -> ReshapeOptions {
        ReshapeOptions {
            fallback_body: self.fallback_body.clone(),
            duplicates: self.duplicate_metrics,
            layout: self.metrics_layout,
        }
    }

    /// True when the configured key is a Secrets Manager ARN rather than the key itself.
    pub fn symmetric_key_is_secret_arn(&self) -> bool {
        self.symmetric_key
            .expose()
            .starts_with(SECRETS_MANAGER_ARN_PREFIX)
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Config")
            .field("model_id", &self.model_id)
            .field("dps_endpoint", &self.dps_endpoint)
            .field("dps_id_scope", &self.dps_id_scope)
            .field("device_id", &self.device_id)
            .field("provisioning_transport", &self.provisioning_transport)
            .field("hub_transport", &self.hub_transport)
            .field("failure_policy", &self.failure_policy)
            .field("dlq_url", &self.dlq_url)
            .field("dlq_s3_bucket", &self.dlq_s3_bucket)
            .field("send_on_transform_failure", &self.send_on_transform_failure)
            .field("duplicate_metrics", &self.duplicate_metrics)
            .field("metrics_layout", &self.metrics_layout)
            .finish_non_exhaustive()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum KeySourceError {
    #[error("Failed to access AWS Secrets Manager. Please make sure the lambda function has permissions to access the {secret_id} secret. Error: {error:?}")]
    FailedToAccessSecretsManager {
        secret_id: String,
        error: GetSecretValueError,
    },
    #[error("Didn't find the {secret_id} secret in AWS secretsmanager")]
    MissingSecret { secret_id: String },
}

pub async fn get_symmetric_key_from_secrets_manager(
    aws_config: &SdkConfig,
    secret_id: String,
) -> Result<SymmetricKey, KeySourceError> {
    let secretsmanager = aws_sdk_secretsmanager::Client::new(aws_config);
    let response = secretsmanager
        .get_secret_value()
        .set_secret_id(Some(secret_id.clone()))
        .send()
        .await
        .map_err(|error| KeySourceError::FailedToAccessSecretsManager {
            secret_id: secret_id.clone(),
            error: error.into_service_error(),
        })?;
    let secret = response
        .secret_string
        .ok_or(KeySourceError::MissingSecret { secret_id })?;
    Ok(SymmetricKey::new(secret.trim()))
}
