//! Sinks for events that could not be relayed.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_sqs::types::MessageAttributeValue;
use aws_sdk_sqs::Client as SqsClient;
use serde::Serialize;
use tracing::info;

use crate::clients::AwsClients;
use crate::config::Config;
use crate::error::{RelayError, RelayState};

const FAILED_EVENTS_PREFIX: &str = "iot-telemetry-relay/failed-events";

/// The raw inbound event plus why and where relaying it failed.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub state: RelayState,
    pub error: String,
    pub body: String,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn store(&self, letter: &DeadLetter) -> Result<(), RelayError>;
}

pub type DynDeadLetterSink = Arc<dyn DeadLetterSink>;

/// Build the sinks named in the configuration.
pub fn sinks_from_config(config: &Config, clients: &AwsClients) -> Vec<DynDeadLetterSink> {
    let mut sinks: Vec<DynDeadLetterSink> = Vec::new();
    if let Some(queue_url) = &config.dlq_url {
        sinks.push(Arc::new(SqsDeadLetterSink::new(clients.sqs.clone(), queue_url.clone())));
    }
    if let Some(bucket) = &config.dlq_s3_bucket {
        sinks.push(Arc::new(S3DeadLetterSink::new(clients.s3.clone(), bucket.clone())));
    }
    sinks
}

/// Sends the raw event to an SQS queue so it can be redriven; the error and
/// the failed state travel as message attributes.
pub struct SqsDeadLetterSink {
    client: SqsClient,
    queue_url: String,
}

impl SqsDeadLetterSink {
    pub fn new(client: SqsClient, queue_url: String) -> Self {
        SqsDeadLetterSink { client, queue_url }
    }
}

fn string_attribute(value: String) -> Result<MessageAttributeValue, RelayError> {
    MessageAttributeValue::builder()
        .set_data_type(Some("String".to_string()))
        .set_string_value(Some(value))
        .build()
        .map_err(|e| RelayError::DeadLetter(format!("failed building message attribute - {}", e)))
}

#[async_trait]
impl DeadLetterSink for SqsDeadLetterSink {
    async fn store(&self, letter: &DeadLetter) -> Result<(), RelayError> {
        if letter.body.is_empty() {
            return Err(RelayError::DeadLetter(
                "sqs does not accept an empty message body".to_string(),
            ));
        }

        info!("sending message to DLQ");
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_attributes("LastError", string_attribute(letter.error.clone())?)
            .message_attributes("RelayState", string_attribute(letter.state.to_string())?)
            .message_body(&letter.body)
            .send()
            .await
            .map_err(|e| {
                RelayError::DeadLetter(format!(
                    "failed sending message to dlq - {}",
                    e.into_service_error()
                ))
            })?;
        Ok(())
    }
}

/// Writes a JSON envelope of the failed event to S3, one object per event.
pub struct S3DeadLetterSink {
    client: S3Client,
    bucket: String,
}

impl S3DeadLetterSink {
    pub fn new(client: S3Client, bucket: String) -> Self {
        S3DeadLetterSink { client, bucket }
    }
}

pub fn failed_event_key(letter: &DeadLetter) -> String {
    // object name is the md5sum of the event body
    let digest = md5::compute(letter.body.as_bytes());
    let prefix = chrono::Utc::now()
        .format(&format!("{}/%Y/%m/%d/%H", FAILED_EVENTS_PREFIX))
        .to_string();
    format!("{}/{:x}.json", prefix, digest)
}

#[async_trait]
impl DeadLetterSink for S3DeadLetterSink {
    async fn store(&self, letter: &DeadLetter) -> Result<(), RelayError> {
        let key = failed_event_key(letter);
        let data = serde_json::to_vec(letter)?;
        let buffer = aws_smithy_types::byte_stream::ByteStream::new(
            aws_smithy_types::body::SdkBody::from(data),
        );

        info!("uploading failed event to S3: s3://{}/{}", self.bucket, key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(buffer)
            .send()
            .await
            .map_err(|e| {
                RelayError::DeadLetter(format!(
                    "failed uploading file to bucket - {}",
                    e.into_service_error()
                ))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_event_key() {
        let letter = DeadLetter {
            state: RelayState::Provisioning,
            error: "provisioning service answered 401: Unauthorized".to_string(),
            body: "hello".to_string(),
        };
        let key = failed_event_key(&letter);
        assert!(key.starts_with("iot-telemetry-relay/failed-events/"));
        assert!(key.ends_with("/5d41402abc4b2a76b9719d911017c592.json"));
    }

    #[test]
    fn test_envelope_shape() {
        let letter = DeadLetter {
            state: RelayState::Sending,
            error: "operation cancelled".to_string(),
            body: r#"{"payload":{}}"#.to_string(),
        };
        let value = serde_json::to_value(&letter).unwrap();
        assert_eq!(value["state"], "Sending");
        assert_eq!(value["error"], "operation cancelled");
        assert_eq!(value["body"], r#"{"payload":{}}"#);
    }
}
