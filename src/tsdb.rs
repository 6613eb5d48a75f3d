use crate::config::Config;
use crate::sensor::{scalar_to_f64, scalar_to_string, Reading, ReadingValues, SensorType};
use anyhow::{Context, Result};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub field_key: String,
    pub field_value: FieldValue,
    pub timestamp_ns: i64,
}

impl Point {
    pub fn to_line(&self) -> String {
        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_tag(key));
            line.push('=');
            line.push_str(&escape_tag(value));
        }
        line.push(' ');
        line.push_str(&escape_tag(&self.field_key));
        line.push('=');
        match &self.field_value {
            FieldValue::Float(value) => line.push_str(&value.to_string()),
            FieldValue::Text(value) => {
                line.push('"');
                line.push_str(&value.replace('\\', "\\\\").replace('"', "\\\""));
                line.push('"');
            }
        }
        line.push(' ');
        line.push_str(&self.timestamp_ns.to_string());
        line
    }
}

fn escape_measurement(raw: &str) -> String {
    raw.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(raw: &str) -> String {
    raw.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

/// Map one decoded reading onto its bucket points. Non-numeric values outside
/// the string-valued sensor set are dropped with a warning, never an error.
pub fn points_for_reading(reading: &Reading) -> Vec<Point> {
    let timestamp_ns = reading
        .received_at
        .timestamp_nanos_opt()
        .unwrap_or_else(|| reading.received_at.timestamp_micros().saturating_mul(1000));
    let measurement = format!("sensor_{}", reading.sensor_id);
    let tags = vec![
        ("device_id".to_string(), reading.device_id.clone()),
        ("sensor_type".to_string(), reading.type_name()),
        ("sensor_type_id".to_string(), reading.type_id.to_string()),
    ];

    match &reading.values {
        ReadingValues::Scalar(value) => match scalar_to_f64(value) {
            Some(value) => vec![Point {
                measurement,
                tags,
                field_key: "value".to_string(),
                field_value: FieldValue::Float(value),
                timestamp_ns,
            }],
            None => {
                tracing::warn!(
                    device = %reading.device_id,
                    sensor = %reading.sensor_id,
                    "dropping non-numeric scalar reading"
                );
                Vec::new()
            }
        },
        ReadingValues::Fields(fields) => {
            let string_valued = reading
                .sensor_type
                .is_some_and(SensorType::is_string_valued);
            let mut points = Vec::with_capacity(fields.len());
            for (name, value) in fields {
                let field_value = if string_valued {
                    match scalar_to_string(value) {
                        Some(text) => FieldValue::Text(text),
                        None => {
                            tracing::warn!(
                                device = %reading.device_id,
                                sensor = %reading.sensor_id,
                                field = %name,
                                "dropping unrepresentable string field"
                            );
                            continue;
                        }
                    }
                } else {
                    match scalar_to_f64(value) {
                        Some(value) => FieldValue::Float(value),
                        None => {
                            tracing::warn!(
                                device = %reading.device_id,
                                sensor = %reading.sensor_id,
                                field = %name,
                                "dropping non-numeric field"
                            );
                            continue;
                        }
                    }
                };
                let mut tags = tags.clone();
                tags.push(("field".to_string(), name.clone()));
                points.push(Point {
                    measurement: measurement.clone(),
                    tags,
                    field_key: name.clone(),
                    field_value,
                    timestamp_ns,
                });
            }
            points
        }
    }
}

#[derive(Debug)]
pub enum WriteCommand {
    Point(Point),
    Flush(oneshot::Sender<()>),
}

/// Cheap handle for the writer task. Callers never see write failures; a
/// struggling TSDB must not block ingest or suppress rule evaluation.
#[derive(Clone)]
pub struct TsdbWriter {
    tx: mpsc::Sender<WriteCommand>,
}

impl TsdbWriter {
    pub fn new(tx: mpsc::Sender<WriteCommand>) -> Self {
        Self { tx }
    }

    /// Queue one point without ever blocking the broker intake path. A
    /// saturated queue sheds the point, it does not slow ingest down.
    pub fn enqueue(&self, point: Point) {
        match self.tx.try_send(WriteCommand::Point(point)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("TSDB queue full; dropping point");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("TSDB writer is gone; dropping point");
            }
        }
    }

    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(WriteCommand::Flush(tx)).await;
        let _ = rx.await;
    }
}

#[derive(Debug, Clone)]
pub struct InfluxClient {
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .context("build TSDB HTTP client")?;
        Ok(Self {
            http,
            url: config.tsdb_url.clone(),
            token: config.tsdb_token.clone(),
            org: config.tsdb_org.clone(),
            bucket: config.tsdb_bucket.clone(),
        })
    }

    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.url);
        self.http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .context("TSDB health check failed")?;
        Ok(())
    }

    async fn write_lines(&self, body: String) -> Result<()> {
        let url = format!("{}/api/v2/write", self.url);
        self.http
            .post(&url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .context("TSDB write rejected")?;
        Ok(())
    }
}

pub fn spawn_writer(
    client: InfluxClient,
    mut rx: mpsc::Receiver<WriteCommand>,
    batch_size: usize,
    flush_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<Point> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    flush(&client, &mut buffer).await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(WriteCommand::Point(point)) => {
                            buffer.push(point);
                            if buffer.len() >= batch_size {
                                flush(&client, &mut buffer).await;
                            }
                        }
                        Some(WriteCommand::Flush(done)) => {
                            flush(&client, &mut buffer).await;
                            let _ = done.send(());
                        }
                        None => {
                            flush(&client, &mut buffer).await;
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn flush(client: &InfluxClient, buffer: &mut Vec<Point>) {
    if buffer.is_empty() {
        return;
    }
    let points = std::mem::take(buffer);
    let len = points.len();
    let body = points
        .iter()
        .map(Point::to_line)
        .collect::<Vec<_>>()
        .join("\n");

    // Fire and forget: a transient TSDB failure drops the batch and moves on.
    match client.write_lines(body).await {
        Ok(()) => tracing::debug!(len, "flushed points"),
        Err(err) => tracing::warn!(error = %err, len, "failed to write points; dropping batch"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::decode_reading;
    use chrono::{TimeZone, Utc};

    fn reading(raw: &str) -> Reading {
        let mut payload = raw.as_bytes().to_vec();
        let received_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        decode_reading("esp-1", "s-1", &mut payload, received_at).expect("decoded")
    }

    #[test]
    fn multi_field_reading_fans_out_one_point_per_field() {
        let points = points_for_reading(&reading(
            r#"{"type":9,"values":{"temperature":28.5,"humidity":55}}"#,
        ));
        assert_eq!(points.len(), 2);
        for point in &points {
            assert_eq!(point.measurement, "sensor_s-1");
            assert!(point
                .tags
                .contains(&("device_id".to_string(), "esp-1".to_string())));
            assert!(point
                .tags
                .contains(&("sensor_type".to_string(), "DHT11".to_string())));
        }
        let mut fields: Vec<&str> = points.iter().map(|p| p.field_key.as_str()).collect();
        fields.sort();
        assert_eq!(fields, vec!["humidity", "temperature"]);
    }

    #[test]
    fn actuator_reading_becomes_a_single_value_point() {
        let points = points_for_reading(&reading(r#"{"type":5,"values":{"state":1}}"#));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].field_key, "value");
        assert_eq!(points[0].field_value, FieldValue::Float(1.0));
        assert!(points[0]
            .tags
            .contains(&("sensor_type_id".to_string(), "5".to_string())));
    }

    #[test]
    fn keypad_fields_are_stored_as_strings() {
        let points = points_for_reading(&reading(r#"{"type":7,"values":{"input":"12A"}}"#));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].field_value, FieldValue::Text("12A".to_string()));
    }

    #[test]
    fn non_numeric_fields_are_dropped_not_fatal() {
        let points = points_for_reading(&reading(
            r#"{"type":9,"values":{"temperature":21.0,"note":"warm"}}"#,
        ));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].field_key, "temperature");
    }

    #[test]
    fn line_protocol_escapes_tags_and_strings() {
        let point = Point {
            measurement: "sensor one".to_string(),
            tags: vec![("device_id".to_string(), "a,b c".to_string())],
            field_key: "input".to_string(),
            field_value: FieldValue::Text("he said \"hi\"".to_string()),
            timestamp_ns: 42,
        };
        assert_eq!(
            point.to_line(),
            "sensor\\ one,device_id=a\\,b\\ c input=\"he said \\\"hi\\\"\" 42"
        );
    }

    #[test]
    fn float_points_render_bare_numbers() {
        let point = Point {
            measurement: "sensor_x".to_string(),
            tags: vec![],
            field_key: "value".to_string(),
            field_value: FieldValue::Float(28.5),
            timestamp_ns: 1_000,
        };
        assert_eq!(point.to_line(), "sensor_x value=28.5 1000");
    }
}
