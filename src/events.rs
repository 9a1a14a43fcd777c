use std::io::Read;

use aws_lambda_events::event::kafka::KafkaEvent;
use aws_lambda_events::event::kinesis::KinesisEvent;
use aws_lambda_events::event::sqs::SqsEvent;
use base64::prelude::*;
use flate2::read::MultiGzDecoder;
use serde::de::{Deserialize, Deserializer};
use serde_json::value::RawValue;
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Any event stream trigger the relay can be attached to. Anything that is
/// not a recognised stream batch is treated as a single direct message.
#[derive(Debug)]
pub enum Combined {
    Kinesis(KinesisEvent),
    Sqs(SqsEvent),
    Kafka(KafkaEvent),
    Direct(Box<RawValue>),
}

impl<'de> Deserialize<'de> for Combined {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // kept raw so a direct message reaches the reshaper byte for byte
        let raw_value: Box<RawValue> = Deserialize::deserialize(deserializer)?;
        let raw = raw_value.get();

        if let Ok(event) = serde_json::from_str::<KinesisEvent>(raw) {
            if !event.records.is_empty() {
                tracing::info!("kinesis event detected");
                return Ok(Combined::Kinesis(event));
            }
        }

        if let Ok(event) = serde_json::from_str::<SqsEvent>(raw) {
            if !event.records.is_empty() {
                tracing::info!("sqs event detected");
                return Ok(Combined::Sqs(event));
            }
        }

        // kafka records are an arbitrary map, so an empty one says nothing
        if let Ok(event) = serde_json::from_str::<KafkaEvent>(raw) {
            if !event.records.is_empty() {
                tracing::info!("kafka event detected");
                return Ok(Combined::Kafka(event));
            }
        }

        tracing::info!("direct invocation detected");
        Ok(Combined::Direct(raw_value))
    }
}

/// One inbound telemetry message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub source: String,
    pub body: String,
}

impl Combined {
    /// The messages carried by the event, in delivery order.
    pub fn into_messages(self) -> Vec<InboundMessage> {
        match self {
            Combined::Kinesis(event) => event
                .records
                .into_iter()
                .map(|record| {
                    debug!("Kinesis record: {:?}", record.event_id);
                    InboundMessage {
                        source: record
                            .event_id
                            .unwrap_or_else(|| record.kinesis.sequence_number.clone()),
                        body: decode_stream_data(record.kinesis.data.0),
                    }
                })
                .collect(),
            Combined::Sqs(event) => event
                .records
                .into_iter()
                .filter_map(|record| {
                    let body = record.body?;
                    Some(InboundMessage {
                        source: record.message_id.unwrap_or_else(|| "sqs".to_string()),
                        body,
                    })
                })
                .collect(),
            Combined::Kafka(event) => {
                let mut partitions: Vec<_> = event.records.into_iter().collect();
                partitions.sort_by(|a, b| a.0.cmp(&b.0));
                partitions
                    .into_iter()
                    .flat_map(|(_, records)| records)
                    .filter_map(|record| {
                        let value = record.value?;
                        let source = format!(
                            "{}-{}@{}",
                            record.topic.unwrap_or_default(),
                            record.partition,
                            record.offset
                        );
                        // kafka values arrive base64 encoded
                        let body = match BASE64_STANDARD.decode(&value) {
                            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                            Err(_) => value,
                        };
                        Some(InboundMessage { source, body })
                    })
                    .collect()
            }
            Combined::Direct(raw) => {
                let body = serde_json::from_str::<String>(raw.get())
                    .unwrap_or_else(|_| raw.get().to_string());
                vec![InboundMessage {
                    source: "direct".to_string(),
                    body,
                }]
            }
        }
    }
}

/// Stream payloads may be gzip compressed; anything else is read as UTF-8.
pub fn decode_stream_data(data: Vec<u8>) -> String {
    if data.starts_with(&GZIP_MAGIC) {
        let mut decoder = MultiGzDecoder::new(&data[..]);
        let mut output = Vec::new();
        match decoder.read_to_end(&mut output) {
            Ok(_) => return String::from_utf8_lossy(&output).into_owned(),
            Err(err) => {
                tracing::warn!(?err, "Problem decompressing data, treating it as UTF-8");
            }
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}
