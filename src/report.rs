use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MetricDef;
use crate::error::Error;

/// Declared value type of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    #[serde(rename = "int64")]
    Int64,
    #[serde(rename = "double")]
    Double,
}

impl ValueType {
    /// Returns the wire name used in configuration documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int64 => "int64",
            Self::Double => "double",
        }
    }
}

/// A single typed metric value.
///
/// Serialized as a self-describing object: `{"int64Value": 10}` or
/// `{"doubleValue": 1.5}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int64 {
        #[serde(rename = "int64Value")]
        value: i64,
    },
    Double {
        #[serde(rename = "doubleValue")]
        value: f64,
    },
}

impl MetricValue {
    pub fn int64(value: i64) -> Self {
        Self::Int64 { value }
    }

    pub fn double(value: f64) -> Self {
        Self::Double { value }
    }

    /// Returns the type this value carries.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Int64 { .. } => ValueType::Int64,
            Self::Double { .. } => ValueType::Double,
        }
    }

    /// Adds `other` into this value. Both sides must carry the same type;
    /// callers validate against the metric definition before accumulating.
    pub fn accumulate(&mut self, other: MetricValue) -> Result<(), Error> {
        match (self, other) {
            (Self::Int64 { value: a }, Self::Int64 { value: b }) => {
                *a = a.saturating_add(b);
                Ok(())
            }
            (Self::Double { value: a }, Self::Double { value: b }) => {
                *a += b;
                Ok(())
            }
            (a, b) => Err(Error::validation(format!(
                "cannot accumulate {} into {}",
                b.value_type().as_str(),
                a.value_type().as_str(),
            ))),
        }
    }
}

/// A timestamped usage observation for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub name: String,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    pub end_time: DateTime<Utc>,
    pub value: MetricValue,
}

impl Report {
    /// Checks this report against the definition of the metric it targets.
    ///
    /// The name must match, the time range must be ordered, and the value
    /// must carry the metric's declared type.
    pub fn validate(&self, def: &MetricDef) -> Result<(), Error> {
        if self.name != def.name {
            return Err(Error::validation(format!(
                "report for metric {} routed to metric {}",
                self.name, def.name,
            )));
        }
        if self.start_time > self.end_time {
            return Err(Error::validation(format!(
                "metric {}: startTime {} > endTime {}",
                self.name, self.start_time, self.end_time,
            )));
        }
        if self.value.value_type() != def.value_type {
            return Err(Error::validation(format!(
                "metric {}: {} value specified for {} metric",
                self.name,
                self.value.value_type().as_str(),
                def.value_type.as_str(),
            )));
        }
        Ok(())
    }

    /// Parses a report from its self-describing JSON encoding.
    pub fn from_json(data: &str) -> Result<Self, Error> {
        serde_json::from_str(data).map_err(Error::validation)
    }
}
