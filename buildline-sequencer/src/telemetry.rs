//! Telemetry shipping for dispatched jobs.
//!
//! Points follow the InfluxDB line protocol. Write failures are logged and
//! never fail the job: telemetry is best effort by contract.

use async_trait::async_trait;

/// Measurement carrying forwarded stage log lines.
pub const MEASUREMENT_LOGS: &str = "job_logs";
/// Measurement carrying job & stage status transitions.
pub const MEASUREMENT_STATUS: &str = "job_status";
/// Measurement carrying per-stage wall-clock durations.
pub const MEASUREMENT_DURATION: &str = "stage_duration_seconds";

/// A status value paired with its numeric code.
pub const STATUS_RUNNING: (&str, i64) = ("running", 1);
pub const STATUS_SUCCEEDED: (&str, i64) = ("succeeded", 2);
pub const STATUS_FAILED: (&str, i64) = ("failed", -1);

/// A field value of a telemetry point.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
}

/// One telemetry point.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    pub measurement: &'static str,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
}

impl Point {
    pub fn new(measurement: &'static str) -> Self {
        Self {
            measurement,
            tags: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.push((key.to_string(), value.to_string()));
        self
    }

    pub fn field_str(mut self, key: &str, value: &str) -> Self {
        self.fields.push((key.to_string(), FieldValue::String(value.to_string())));
        self
    }

    pub fn field_int(mut self, key: &str, value: i64) -> Self {
        self.fields.push((key.to_string(), FieldValue::Integer(value)));
        self
    }

    /// Render this point as one line of InfluxDB line protocol.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_key(self.measurement);
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }
        line.push(' ');
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| match value {
                FieldValue::String(val) => format!("{}=\"{}\"", escape_key(key), val.replace('\\', "\\\\").replace('"', "\\\"")),
                FieldValue::Integer(val) => format!("{}={}i", escape_key(key), val),
            })
            .collect();
        line.push_str(&fields.join(","));
        line
    }
}

/// Escape measurement names, tag keys/values & field keys.
fn escape_key(raw: &str) -> String {
    raw.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

/// The sink receiving job & stage telemetry points.
#[async_trait]
pub trait MetricsSink: Send + Sync + 'static {
    async fn write(&self, point: Point);
}

/// A `MetricsSink` posting line protocol to an InfluxDB endpoint.
pub struct InfluxSink {
    client: reqwest::Client,
    endpoint: String,
}

impl InfluxSink {
    pub fn new(url: &str, database: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/write?db={}", url.trim_end_matches('/'), database),
        }
    }
}

#[async_trait]
impl MetricsSink for InfluxSink {
    async fn write(&self, point: Point) {
        let body = point.to_line_protocol();
        let res = self.client.post(&self.endpoint).body(body).send().await;
        match res {
            Ok(res) if !res.status().is_success() => {
                tracing::warn!(status = %res.status(), measurement = point.measurement, "telemetry endpoint rejected point");
            }
            Ok(_) => (),
            Err(err) => {
                tracing::warn!(error = ?err, measurement = point.measurement, "error shipping telemetry point");
            }
        }
    }
}

/// A sink discarding all points, used when no telemetry endpoint is configured.
pub struct NoopSink;

#[async_trait]
impl MetricsSink for NoopSink {
    async fn write(&self, _point: Point) {}
}

/// A sink recording all points in memory.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    pub points: std::sync::Mutex<Vec<Point>>,
}

#[cfg(test)]
#[async_trait]
impl MetricsSink for RecordingSink {
    async fn write(&self, point: Point) {
        self.points.lock().unwrap().push(point);
    }
}
