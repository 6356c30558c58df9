use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::report::{MetricValue, ValueType};

/// Top-level declarative configuration for the metering agent.
///
/// Enumerates the reportable metrics, the endpoints finalized reports are
/// delivered to, and any caller-independent report sources.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// The set of reportable metrics.
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    /// Delivery targets referenced by metrics.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Generators of reports not driven by an external caller.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// A single metric declaration: name, value type, aggregation policy, and
/// the endpoints its finalized reports are delivered to.
#[derive(Debug, Deserialize)]
pub struct MetricConfig {
    pub name: String,

    /// Declared value type ("int64" or "double").
    #[serde(rename = "type")]
    pub value_type: ValueType,

    /// Windowed summation policy. Exactly one of `aggregation` and
    /// `passthrough` must be present.
    #[serde(default)]
    pub aggregation: Option<AggregationConfig>,

    /// Forward-unchanged policy.
    #[serde(default)]
    pub passthrough: Option<PassthroughConfig>,

    /// Names of the endpoints this metric is bound to.
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Buffered-sum aggregation settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AggregationConfig {
    /// Length of the aggregation window in seconds.
    #[serde(rename = "bufferSeconds")]
    pub buffer_seconds: i64,
}

/// Passthrough marker; carries no settings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PassthroughConfig {}

/// A named delivery target. Exactly one kind-specific section must be set.
#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    pub name: String,

    /// Disk endpoint settings.
    #[serde(default)]
    pub disk: Option<DiskEndpointConfig>,
}

/// Disk endpoint settings: where finalized reports land and how long they
/// are retained.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskEndpointConfig {
    #[serde(rename = "reportDir")]
    pub report_dir: PathBuf,

    /// Reports older than this many seconds are deleted by the background
    /// expiration sweep.
    #[serde(rename = "expireSeconds")]
    pub expire_seconds: i64,
}

/// A named report source. Exactly one kind-specific section must be set.
#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    /// Heartbeat source settings.
    #[serde(default)]
    pub heartbeat: Option<HeartbeatConfig>,
}

/// Heartbeat source settings: a fixed value reported for one metric at a
/// fixed interval.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Target metric name.
    pub metric: String,

    #[serde(rename = "intervalSeconds")]
    pub interval_seconds: i64,

    /// Fixed value carried by every heartbeat report.
    pub value: MetricValue,
}

/// Per-metric aggregation policy resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationPolicy {
    /// Forward every report unchanged.
    Passthrough,
    /// Sum values over a fixed window, emitting one report per window.
    BufferedSum { window: Duration },
}

/// Resolved, immutable definition of a single metric. Built once at agent
/// construction from a validated [`MetricConfig`].
#[derive(Debug, Clone)]
pub struct MetricDef {
    pub name: String,
    pub value_type: ValueType,
    pub policy: AggregationPolicy,
    pub endpoints: Vec<String>,
}

impl Config {
    /// Loads configuration from a YAML (or JSON) file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    /// Parses configuration from a YAML (or JSON) document and validates it.
    pub fn from_yaml(data: &str) -> Result<Self, Error> {
        let cfg: Config = serde_yaml::from_str(data).map_err(Error::config)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Returns the metric configuration with the given name, if declared.
    pub fn get_metric(&self, name: &str) -> Option<&MetricConfig> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Validates the configuration for consistency.
    ///
    /// Checks for duplicate names, dangling endpoint references, missing or
    /// ambiguous kind sections, and out-of-range settings. Returns
    /// [`Error::Config`] on the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        let mut endpoint_names = HashSet::new();
        for ep in &self.endpoints {
            if ep.name.is_empty() {
                return Err(Error::config("endpoint: missing name"));
            }
            if !endpoint_names.insert(ep.name.as_str()) {
                return Err(Error::config(format!(
                    "endpoint {}: duplicate name",
                    ep.name,
                )));
            }
            match &ep.disk {
                Some(disk) => {
                    if disk.report_dir.as_os_str().is_empty() {
                        return Err(Error::config(format!(
                            "endpoint {}: disk: missing report directory",
                            ep.name,
                        )));
                    }
                    if disk.expire_seconds < 0 {
                        return Err(Error::config(format!(
                            "endpoint {}: disk: expireSeconds must not be negative",
                            ep.name,
                        )));
                    }
                }
                None => {
                    return Err(Error::config(format!(
                        "endpoint {}: missing kind configuration",
                        ep.name,
                    )));
                }
            }
        }

        let mut metric_names = HashSet::new();
        for metric in &self.metrics {
            if metric.name.is_empty() {
                return Err(Error::config("metric: missing name"));
            }
            if !metric_names.insert(metric.name.as_str()) {
                return Err(Error::config(format!(
                    "metric {}: duplicate name",
                    metric.name,
                )));
            }
            match (&metric.aggregation, &metric.passthrough) {
                (Some(agg), None) => {
                    if agg.buffer_seconds <= 0 {
                        return Err(Error::config(format!(
                            "metric {}: bufferSeconds must be > 0",
                            metric.name,
                        )));
                    }
                }
                (None, Some(_)) => {}
                (None, None) => {
                    return Err(Error::config(format!(
                        "metric {}: missing aggregation or passthrough",
                        metric.name,
                    )));
                }
                (Some(_), Some(_)) => {
                    return Err(Error::config(format!(
                        "metric {}: both aggregation and passthrough specified",
                        metric.name,
                    )));
                }
            }
            if metric.endpoints.is_empty() {
                return Err(Error::config(format!(
                    "metric {}: no endpoints bound",
                    metric.name,
                )));
            }
            for name in &metric.endpoints {
                if !endpoint_names.contains(name.as_str()) {
                    return Err(Error::config(format!(
                        "metric {}: undefined endpoint: {}",
                        metric.name, name,
                    )));
                }
            }
        }

        let mut source_names = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(Error::config("source: missing name"));
            }
            if !source_names.insert(source.name.as_str()) {
                return Err(Error::config(format!(
                    "source {}: duplicate name",
                    source.name,
                )));
            }
            let Some(hb) = &source.heartbeat else {
                return Err(Error::config(format!(
                    "source {}: missing kind configuration",
                    source.name,
                )));
            };
            let Some(metric) = self.get_metric(&hb.metric) else {
                return Err(Error::config(format!(
                    "source {}: unknown metric: {}",
                    source.name, hb.metric,
                )));
            };
            if hb.interval_seconds <= 0 {
                return Err(Error::config(format!(
                    "source {}: intervalSeconds must be > 0",
                    source.name,
                )));
            }
            if hb.value.value_type() != metric.value_type {
                return Err(Error::config(format!(
                    "source {}: {} value for {} metric {}",
                    source.name,
                    hb.value.value_type().as_str(),
                    metric.value_type.as_str(),
                    metric.name,
                )));
            }
        }

        Ok(())
    }

    /// Resolves metric declarations into immutable runtime definitions,
    /// keyed by metric name. Call after [`Config::validate`].
    pub fn metric_defs(&self) -> HashMap<String, MetricDef> {
        self.metrics
            .iter()
            .map(|m| {
                let policy = match &m.aggregation {
                    Some(agg) => AggregationPolicy::BufferedSum {
                        window: Duration::from_secs(agg.buffer_seconds as u64),
                    },
                    None => AggregationPolicy::Passthrough,
                };
                (
                    m.name.clone(),
                    MetricDef {
                        name: m.name.clone(),
                        value_type: m.value_type,
                        policy,
                        endpoints: m.endpoints.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
metrics:
  - name: requests
    type: int64
    aggregation: { bufferSeconds: 10 }
    endpoints: [ disk ]
  - name: instance_time
    type: int64
    passthrough: {}
    endpoints: [ disk ]
endpoints:
  - name: disk
    disk:
      reportDir: /tmp/reports
      expireSeconds: 3600
sources:
  - name: instance-heartbeat
    heartbeat:
      metric: instance_time
      intervalSeconds: 60
      value: { int64Value: 60 }
"#;

    #[test]
    fn test_parse_valid_config() {
        let cfg = Config::from_yaml(VALID_YAML).unwrap();
        assert_eq!(cfg.metrics.len(), 2);
        assert_eq!(cfg.endpoints.len(), 1);
        assert_eq!(cfg.sources.len(), 1);

        let hb = cfg.sources[0].heartbeat.as_ref().unwrap();
        assert_eq!(hb.metric, "instance_time");
        assert_eq!(hb.interval_seconds, 60);
        assert_eq!(hb.value, MetricValue::int64(60));
    }

    #[test]
    fn test_load_reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, VALID_YAML).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.metrics.len(), 2);
        assert_eq!(cfg.endpoints[0].name, "disk");

        assert!(matches!(
            Config::load(&dir.path().join("missing.yaml")),
            Err(Error::Io(_)),
        ));
    }

    #[test]
    fn test_parse_json_config() {
        // YAML is a JSON superset; a JSON document must parse identically.
        let cfg = Config::from_yaml(
            r#"{"metrics":[{"name":"m","type":"int64","passthrough":{},"endpoints":["disk"]}],
                "endpoints":[{"name":"disk","disk":{"reportDir":"/tmp/r","expireSeconds":60}}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.metrics[0].name, "m");
    }

    #[test]
    fn test_metric_defs_resolution() {
        let cfg = Config::from_yaml(VALID_YAML).unwrap();
        let defs = cfg.metric_defs();

        let requests = &defs["requests"];
        assert_eq!(
            requests.policy,
            AggregationPolicy::BufferedSum {
                window: Duration::from_secs(10)
            },
        );
        assert_eq!(requests.endpoints, vec!["disk".to_string()]);

        let instance_time = &defs["instance_time"];
        assert_eq!(instance_time.policy, AggregationPolicy::Passthrough);
    }

    #[test]
    fn test_duplicate_metric_name_rejected() {
        let err = Config::from_yaml(
            r#"
metrics:
  - { name: m, type: int64, passthrough: {}, endpoints: [disk] }
  - { name: m, type: int64, passthrough: {}, endpoints: [disk] }
endpoints:
  - { name: disk, disk: { reportDir: /tmp/r, expireSeconds: 60 } }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate name"));
    }

    #[test]
    fn test_metric_requires_policy() {
        let err = Config::from_yaml(
            r#"
metrics:
  - { name: m, type: int64, endpoints: [disk] }
endpoints:
  - { name: disk, disk: { reportDir: /tmp/r, expireSeconds: 60 } }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing aggregation or passthrough"));
    }

    #[test]
    fn test_metric_rejects_both_policies() {
        let err = Config::from_yaml(
            r#"
metrics:
  - name: m
    type: int64
    aggregation: { bufferSeconds: 5 }
    passthrough: {}
    endpoints: [disk]
endpoints:
  - { name: disk, disk: { reportDir: /tmp/r, expireSeconds: 60 } }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("both aggregation and passthrough"));
    }

    #[test]
    fn test_buffer_seconds_must_be_positive() {
        let err = Config::from_yaml(
            r#"
metrics:
  - { name: m, type: int64, aggregation: { bufferSeconds: 0 }, endpoints: [disk] }
endpoints:
  - { name: disk, disk: { reportDir: /tmp/r, expireSeconds: 60 } }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bufferSeconds"));
    }

    #[test]
    fn test_undefined_endpoint_rejected() {
        let err = Config::from_yaml(
            r#"
metrics:
  - { name: m, type: int64, passthrough: {}, endpoints: [nowhere] }
endpoints:
  - { name: disk, disk: { reportDir: /tmp/r, expireSeconds: 60 } }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("undefined endpoint"));
    }

    #[test]
    fn test_metric_requires_endpoints() {
        let err = Config::from_yaml(
            r#"
metrics:
  - { name: m, type: int64, passthrough: {} }
endpoints:
  - { name: disk, disk: { reportDir: /tmp/r, expireSeconds: 60 } }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no endpoints bound"));
    }

    #[test]
    fn test_endpoint_requires_kind() {
        let err = Config::from_yaml(
            r#"
metrics: []
endpoints:
  - { name: disk }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing kind configuration"));
    }

    #[test]
    fn test_endpoint_rejects_negative_expiry() {
        let err = Config::from_yaml(
            r#"
endpoints:
  - { name: disk, disk: { reportDir: /tmp/r, expireSeconds: -1 } }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("expireSeconds"));
    }

    #[test]
    fn test_heartbeat_requires_known_metric() {
        let err = Config::from_yaml(
            r#"
metrics: []
endpoints: []
sources:
  - name: hb
    heartbeat: { metric: ghost, intervalSeconds: 1, value: { int64Value: 1 } }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown metric"));
    }

    #[test]
    fn test_heartbeat_value_type_must_match_metric() {
        let err = Config::from_yaml(
            r#"
metrics:
  - { name: m, type: int64, passthrough: {}, endpoints: [disk] }
endpoints:
  - { name: disk, disk: { reportDir: /tmp/r, expireSeconds: 60 } }
sources:
  - name: hb
    heartbeat: { metric: m, intervalSeconds: 1, value: { doubleValue: 1.5 } }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("double value for int64 metric"));
    }

    #[test]
    fn test_heartbeat_interval_must_be_positive() {
        let err = Config::from_yaml(
            r#"
metrics:
  - { name: m, type: int64, passthrough: {}, endpoints: [disk] }
endpoints:
  - { name: disk, disk: { reportDir: /tmp/r, expireSeconds: 60 } }
sources:
  - name: hb
    heartbeat: { metric: m, intervalSeconds: 0, value: { int64Value: 1 } }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("intervalSeconds"));
    }
}
