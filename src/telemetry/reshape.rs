//! Flattens the metrics list of a reading into a `name -> value` object.
//!
//! The reshaped reading is serialized in one pass from an ordered entry list,
//! so metric values are written back exactly as they were received and the
//! remaining fields of the reading are untouched.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::value::RawValue;
use tracing::{debug, error, info};

use crate::telemetry::{Metric, Reading, Topic};

/// Inbound bodies without this marker skip parsing and use the fallback body.
pub const PAYLOAD_MARKER: &str = "payload";

/// Default fallback body: a sample reading already in the flattened shape.
pub const SAMPLE_READING: &str = r#"{"topic":{"namespace":"spBv1.0","edgeNodeDescriptor":"Sample Group/Sample Edge Node","groupId":"Sample Group","edgeNodeId":"Sample Edge Node","deviceId":"Sample Device","type":"DDATA"},"payload":{"timestamp":0,"metrics":{},"seq":0}}"#;

#[derive(thiserror::Error, Debug)]
pub enum ReshapeError {
    #[error("invalid reading: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metric at position {0} has no name")]
    UnnamedMetric(usize),
}

/// How metrics sharing a sanitized name are emitted.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub enum DuplicateMetrics {
    /// One entry per metric, in input order, keys may repeat.
    #[default]
    Append,
    /// One entry per key at its first position, holding the last value.
    Overwrite,
}

impl FromStr for DuplicateMetrics {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "Append" => Ok(DuplicateMetrics::Append),
            "Overwrite" => Ok(DuplicateMetrics::Overwrite),
            other => Err(format!("Invalid duplicate metrics mode {}", other)),
        }
    }
}

impl fmt::Display for DuplicateMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Output shape of the flattened metrics.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default)]
pub enum MetricsLayout {
    /// `{"a": 1, "b": 2}`
    #[default]
    Object,
    /// `[{"a": 1}, {"b": 2}]`
    Fragments,
}

impl FromStr for MetricsLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "Object" => Ok(MetricsLayout::Object),
            "Fragments" => Ok(MetricsLayout::Fragments),
            other => Err(format!("Invalid metrics layout {}", other)),
        }
    }
}

impl fmt::Display for MetricsLayout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub struct ReshapeOptions {
    pub fallback_body: String,
    pub duplicates: DuplicateMetrics,
    pub layout: MetricsLayout,
}

impl Default for ReshapeOptions {
    fn default() -> Self {
        ReshapeOptions {
            fallback_body: SAMPLE_READING.to_string(),
            duplicates: DuplicateMetrics::default(),
            layout: MetricsLayout::default(),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ReshapeOutcome {
    Transformed,
    Fallback,
    Failed,
}

/// The body to send plus how it was obtained.
#[derive(Debug)]
pub struct Reshaped {
    pub outcome: ReshapeOutcome,
    pub body: String,
    pub error: Option<ReshapeError>,
}

/// A single flattened metric. `value` is `None` when the metric carried no value.
#[derive(Debug, Clone)]
pub struct FlatMetric<'a> {
    pub key: String,
    pub value: Option<&'a RawValue>,
}

pub fn sanitize_metric_name(name: &str) -> String {
    name.replace('/', "_").trim().to_string()
}

/// Reshape a raw inbound body. Never fails: a body that cannot be reshaped
/// yields an empty body and the error that caused it.
pub fn reshape(raw: &str, options: &ReshapeOptions) -> Reshaped {
    if !raw.contains(PAYLOAD_MARKER) {
        info!("Inbound message has no payload section, using the fallback body");
        return Reshaped {
            outcome: ReshapeOutcome::Fallback,
            body: options.fallback_body.clone(),
            error: None,
        };
    }

    match transform(raw, options) {
        Ok(body) => {
            info!("new payload is: {}", body);
            Reshaped {
                outcome: ReshapeOutcome::Transformed,
                body,
                error: None,
            }
        }
        Err(e) => {
            error!("{}", e);
            error!("failed to reshape the inbound reading, continuing with an empty payload");
            error!("{}", raw);
            Reshaped {
                outcome: ReshapeOutcome::Failed,
                body: String::new(),
                error: Some(e),
            }
        }
    }
}

/// Parse a reading and serialize it again with flattened metrics.
pub fn transform(raw: &str, options: &ReshapeOptions) -> Result<String, ReshapeError> {
    let reading: Reading = serde_json::from_str(raw)?;
    debug!(
        "parsed reading with {} metrics (seq {})",
        reading.payload.metrics.len(),
        reading.payload.seq
    );

    let entries = flatten_metrics(&reading.payload.metrics, options.duplicates)?;
    let transformed = TransformedReading {
        topic: reading.topic.as_ref(),
        payload: TransformedPayload {
            timestamp: reading.payload.timestamp,
            metrics: FlatMetrics {
                entries,
                layout: options.layout,
            },
            seq: reading.payload.seq,
        },
    };

    Ok(serde_json::to_string(&transformed)?)
}

pub fn flatten_metrics(
    metrics: &[Metric],
    duplicates: DuplicateMetrics,
) -> Result<Vec<FlatMetric<'_>>, ReshapeError> {
    let entries = metrics
        .iter()
        .enumerate()
        .map(|(i, metric)| {
            metric
                .name
                .as_deref()
                .map(|name| FlatMetric {
                    key: sanitize_metric_name(name),
                    value: metric.value.as_deref(),
                })
                .ok_or(ReshapeError::UnnamedMetric(i))
        })
        .collect::<Result<Vec<_>, ReshapeError>>()?;

    match duplicates {
        DuplicateMetrics::Append => Ok(entries),
        DuplicateMetrics::Overwrite => {
            let mut positions: HashMap<String, usize> = HashMap::new();
            let mut merged: Vec<FlatMetric> = Vec::with_capacity(entries.len());
            for entry in entries {
                match positions.get(&entry.key) {
                    Some(&i) => merged[i].value = entry.value,
                    None => {
                        positions.insert(entry.key.clone(), merged.len());
                        merged.push(entry);
                    }
                }
            }
            Ok(merged)
        }
    }
}

#[derive(Serialize)]
struct TransformedReading<'a> {
    topic: Option<&'a Topic>,
    payload: TransformedPayload<'a>,
}

#[derive(Serialize)]
struct TransformedPayload<'a> {
    timestamp: i64,
    metrics: FlatMetrics<'a>,
    seq: i64,
}

struct FlatMetrics<'a> {
    entries: Vec<FlatMetric<'a>>,
    layout: MetricsLayout,
}

impl Serialize for FlatMetrics<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.layout {
            MetricsLayout::Object => {
                let mut map = serializer.serialize_map(Some(self.entries.len()))?;
                for entry in &self.entries {
                    map.serialize_entry(&entry.key, &entry.value)?;
                }
                map.end()
            }
            MetricsLayout::Fragments => {
                let mut seq = serializer.serialize_seq(Some(self.entries.len()))?;
                for entry in &self.entries {
                    seq.serialize_element(&Fragment(entry))?;
                }
                seq.end()
            }
        }
    }
}

struct Fragment<'a, 'b>(&'b FlatMetric<'a>);

impl Serialize for Fragment<'_, '_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.0.key, &self.0.value)?;
        map.end()
    }
}
