use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Last-known descriptor of one sensor/actuator, keyed by device then sensor.
/// Wire shape uses the legacy field names the edge API speaks; English
/// aliases are accepted on ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSensorConfig {
    #[serde(alias = "sensor_id")]
    pub id: String,
    #[serde(default, alias = "description")]
    pub desc: Option<String>,
    #[serde(default, alias = "type")]
    pub tipo: Option<i64>,
    #[serde(default, alias = "pins")]
    pub pinos: Vec<i64>,
    #[serde(default, alias = "attribute1", alias = "atribute1")]
    pub atributo1: Option<JsonValue>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceConfigCache {
    inner: Arc<Mutex<HashMap<String, HashMap<String, DeviceSensorConfig>>>>,
}

impl DeviceConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, DeviceSensorConfig>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a `settings/sensors/get/response` body: every descriptor replaces
    /// any prior entry for its `(device, sensor)` wholesale.
    pub fn apply_response(&self, device_id: &str, sensors: Vec<DeviceSensorConfig>) {
        let mut guard = self.lock();
        let device = guard.entry(device_id.to_string()).or_default();
        for sensor in sensors {
            if sensor.id.trim().is_empty() {
                continue;
            }
            device.insert(sensor.id.clone(), sensor);
        }
    }

    /// Record an actuator value seen on the sensor path, so toggles stay
    /// sensible even before an explicit config fetch.
    pub fn observe_actuator(
        &self,
        device_id: &str,
        sensor_id: &str,
        type_id: i64,
        value: &JsonValue,
    ) {
        let mut guard = self.lock();
        let entry = guard
            .entry(device_id.to_string())
            .or_default()
            .entry(sensor_id.to_string())
            .or_insert_with(|| DeviceSensorConfig {
                id: sensor_id.to_string(),
                desc: None,
                tipo: None,
                pinos: Vec::new(),
                atributo1: None,
            });
        entry.tipo.get_or_insert(type_id);
        entry.atributo1 = Some(value.clone());
    }

    /// Mirror a commanded value so back-to-back toggles alternate without
    /// waiting for the actuator's own report to loop back through ingest.
    pub fn set_commanded_value(&self, device_id: &str, actuator_id: &str, value: f64) {
        let mut guard = self.lock();
        let entry = guard
            .entry(device_id.to_string())
            .or_default()
            .entry(actuator_id.to_string())
            .or_insert_with(|| DeviceSensorConfig {
                id: actuator_id.to_string(),
                desc: None,
                tipo: None,
                pinos: Vec::new(),
                atributo1: None,
            });
        entry.atributo1 = Some(JsonValue::from(value));
    }

    pub fn get(&self, device_id: &str, sensor_id: &str) -> Option<DeviceSensorConfig> {
        self.lock()
            .get(device_id)
            .and_then(|device| device.get(sensor_id))
            .cloned()
    }
}
