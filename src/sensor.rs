use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorType {
    Mpu,
    Ds18b20,
    HcSr04,
    Apds9960,
    Sg90,
    Relay,
    Joystick,
    Keypad4x4,
    Encoder,
    Dht11,
}

impl SensorType {
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(SensorType::Mpu),
            1 => Some(SensorType::Ds18b20),
            2 => Some(SensorType::HcSr04),
            3 => Some(SensorType::Apds9960),
            4 => Some(SensorType::Sg90),
            5 => Some(SensorType::Relay),
            6 => Some(SensorType::Joystick),
            7 => Some(SensorType::Keypad4x4),
            8 => Some(SensorType::Encoder),
            9 => Some(SensorType::Dht11),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorType::Mpu => "MPU",
            SensorType::Ds18b20 => "DS18B20",
            SensorType::HcSr04 => "HC-SR04",
            SensorType::Apds9960 => "APDS9960",
            SensorType::Sg90 => "SG90",
            SensorType::Relay => "RELAY",
            SensorType::Joystick => "JOYSTICK",
            SensorType::Keypad4x4 => "KEYPAD_4x4",
            SensorType::Encoder => "ENCODER",
            SensorType::Dht11 => "DHT11",
        }
    }

    pub fn is_actuator(self) -> bool {
        matches!(self, SensorType::Sg90 | SensorType::Relay)
    }

    pub fn is_string_valued(self) -> bool {
        matches!(self, SensorType::Keypad4x4)
    }

    /// Field an actuator reports its scalar under when no legacy field is present.
    pub fn actuator_value_field(self) -> Option<&'static str> {
        match self {
            SensorType::Sg90 => Some("angle"),
            SensorType::Relay => Some("state"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReadingValues {
    Scalar(JsonValue),
    Fields(Map<String, JsonValue>),
}

impl ReadingValues {
    pub fn resolve(&self, measure: Option<&str>) -> Option<&JsonValue> {
        match self {
            ReadingValues::Scalar(value) => Some(value),
            ReadingValues::Fields(fields) => measure.and_then(|name| fields.get(name)),
        }
    }

    pub fn password_input(&self) -> Option<String> {
        match self {
            ReadingValues::Scalar(value) => scalar_to_string(value),
            ReadingValues::Fields(fields) => fields.get("input").and_then(scalar_to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reading {
    pub device_id: String,
    pub sensor_id: String,
    pub type_id: i64,
    pub sensor_type: Option<SensorType>,
    pub values: ReadingValues,
    pub received_at: DateTime<Utc>,
}

impl Reading {
    pub fn is_actuator(&self) -> bool {
        self.sensor_type.is_some_and(SensorType::is_actuator)
    }

    pub fn type_name(&self) -> String {
        match self.sensor_type {
            Some(sensor_type) => sensor_type.name().to_string(),
            None => self.type_id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireReading {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    sensor_id: Option<String>,
    #[serde(default, alias = "tipo")]
    r#type: Option<i64>,
    #[serde(default)]
    values: Option<JsonValue>,
    #[serde(default, alias = "attribute1", alias = "atribute1")]
    atributo1: Option<JsonValue>,
}

/// Decode a `<device>/sensors/<sensor>/data` payload. Actuator types collapse
/// to a single scalar; every other type must carry a field mapping.
pub fn decode_reading(
    topic_device: &str,
    topic_sensor: &str,
    payload: &mut [u8],
    received_at: DateTime<Utc>,
) -> Result<Reading> {
    let wire: WireReading = simd_json::serde::from_slice(payload)?;

    let device_id = wire
        .device_id
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| topic_device.to_string());
    let sensor_id = wire
        .sensor_id
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| topic_sensor.to_string());
    let type_id = wire.r#type.unwrap_or(-1);
    let sensor_type = SensorType::from_id(type_id);

    let values = if sensor_type.is_some_and(SensorType::is_actuator) {
        let scalar = actuator_scalar(sensor_type, wire.atributo1, wire.values.as_ref())
            .ok_or_else(|| anyhow!("actuator reading carries no scalar value"))?;
        ReadingValues::Scalar(scalar)
    } else {
        match wire.values {
            Some(JsonValue::Object(fields)) => ReadingValues::Fields(fields),
            Some(other) => {
                return Err(anyhow!(
                    "sensor reading values must be a field mapping, got {other}"
                ))
            }
            None => return Err(anyhow!("sensor reading carries no values")),
        }
    };

    Ok(Reading {
        device_id,
        sensor_id,
        type_id,
        sensor_type,
        values,
        received_at,
    })
}

fn actuator_scalar(
    sensor_type: Option<SensorType>,
    legacy: Option<JsonValue>,
    values: Option<&JsonValue>,
) -> Option<JsonValue> {
    if let Some(legacy) = legacy {
        return Some(legacy);
    }
    match values {
        Some(JsonValue::Object(fields)) => sensor_type
            .and_then(SensorType::actuator_value_field)
            .and_then(|field| fields.get(field).cloned()),
        Some(scalar) if !scalar.is_null() => Some(scalar.clone()),
        _ => None,
    }
}

pub fn scalar_to_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(topic_device: &str, topic_sensor: &str, raw: &str) -> Result<Reading> {
        let mut payload = raw.as_bytes().to_vec();
        decode_reading(topic_device, topic_sensor, &mut payload, Utc::now())
    }

    #[test]
    fn decodes_multi_field_reading() {
        let reading = decode(
            "esp-1",
            "dht-1",
            r#"{"type":9,"values":{"temperature":28.5,"humidity":55}}"#,
        )
        .expect("decoded");
        assert_eq!(reading.device_id, "esp-1");
        assert_eq!(reading.sensor_id, "dht-1");
        assert_eq!(reading.sensor_type, Some(SensorType::Dht11));
        match &reading.values {
            ReadingValues::Fields(fields) => assert_eq!(fields.len(), 2),
            ReadingValues::Scalar(_) => panic!("expected field mapping"),
        }
    }

    #[test]
    fn payload_ids_win_over_topic_parts() {
        let reading = decode(
            "topic-dev",
            "topic-sensor",
            r#"{"device_id":"real-dev","sensor_id":"real-sensor","tipo":9,"values":{"temperature":1}}"#,
        )
        .expect("decoded");
        assert_eq!(reading.device_id, "real-dev");
        assert_eq!(reading.sensor_id, "real-sensor");
    }

    #[test]
    fn actuator_prefers_legacy_scalar() {
        let reading = decode(
            "esp-1",
            "relay-1",
            r#"{"type":5,"atributo1":1,"values":{"state":0}}"#,
        )
        .expect("decoded");
        assert!(reading.is_actuator());
        match &reading.values {
            ReadingValues::Scalar(value) => assert_eq!(scalar_to_f64(value), Some(1.0)),
            ReadingValues::Fields(_) => panic!("expected collapsed scalar"),
        }
    }

    #[test]
    fn actuator_falls_back_to_typed_value_field() {
        let reading = decode("esp-1", "servo-1", r#"{"type":4,"values":{"angle":90}}"#)
            .expect("decoded");
        match &reading.values {
            ReadingValues::Scalar(value) => assert_eq!(scalar_to_f64(value), Some(90.0)),
            ReadingValues::Fields(_) => panic!("expected collapsed scalar"),
        }
    }

    #[test]
    fn non_actuator_scalar_values_are_rejected() {
        assert!(decode("esp-1", "ds-1", r#"{"type":1,"values":27.5}"#).is_err());
        assert!(decode("esp-1", "ds-1", r#"{"type":1}"#).is_err());
    }

    #[test]
    fn keypad_reading_keeps_string_input() {
        let reading = decode(
            "esp-1",
            "pad-1",
            r#"{"type":7,"values":{"input":"1234"}}"#,
        )
        .expect("decoded");
        assert_eq!(reading.values.password_input().as_deref(), Some("1234"));
    }
}
