//! Telemetry readings as they arrive from the edge gateway.
//!
//! A reading is a topic descriptor plus a payload holding an ordered list of
//! metrics. Metric values are kept as raw JSON text so that they can be
//! forwarded exactly as the gateway encoded them.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

pub mod reshape;

pub use reshape::{reshape, sanitize_metric_name, ReshapeError, ReshapeOptions, ReshapeOutcome, Reshaped};

#[derive(Debug, Deserialize)]
pub struct Reading {
    pub topic: Option<Topic>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub namespace: Option<String>,
    pub edge_node_descriptor: Option<String>,
    pub group_id: Option<String>,
    pub edge_node_id: Option<String>,
    pub device_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub timestamp: i64,
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub seq: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub name: Option<String>,
    #[serde(default)]
    pub timestamp: Value,
    pub data_type: Option<String>,
    pub value: Option<Box<RawValue>>,
}
