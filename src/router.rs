use crate::devices::{DeviceConfigCache, DeviceSensorConfig};
use crate::rules::{Rule, RuleEngine, RuleStore};
use crate::sensor::{decode_reading, ReadingValues};
use crate::tsdb::{points_for_reading, TsdbWriter};
use anyhow::{Context, Result};
use chrono::Utc;
use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

pub const RULES_CALLBACK_TOPIC: &str = "callback/rules";

/// Classifies every inbound broker message and drives the matching component:
/// rule management, config-cache updates, or the sensor path (persist, then
/// evaluate). Errors bubble to the listener, which logs and keeps polling.
#[derive(Clone)]
pub struct Router {
    store: Arc<RuleStore>,
    cache: DeviceConfigCache,
    engine: RuleEngine,
    tsdb: TsdbWriter,
    mqtt: AsyncClient,
}

#[derive(Debug, Deserialize)]
struct ConfigResponse {
    #[serde(default)]
    sensors: Vec<DeviceSensorConfig>,
}

impl Router {
    pub fn new(
        store: Arc<RuleStore>,
        cache: DeviceConfigCache,
        engine: RuleEngine,
        tsdb: TsdbWriter,
        mqtt: AsyncClient,
    ) -> Self {
        Self {
            store,
            cache,
            engine,
            tsdb,
            mqtt,
        }
    }

    pub async fn handle_publish(&self, topic: &str, payload: &mut [u8]) -> Result<()> {
        let parts: Vec<&str> = topic.split('/').collect();
        match parts.as_slice() {
            ["rules", op] => self.handle_rule_op(op, payload).await,
            [device, "settings", "sensors", "get", "response"] => {
                self.handle_config_response(device, payload)
            }
            [device, "sensors", sensor, "data"] => self.handle_reading(device, sensor, payload),
            _ => {
                tracing::debug!(topic, "ignoring message on unexpected topic");
                Ok(())
            }
        }
    }

    async fn handle_rule_op(&self, op: &str, payload: &mut [u8]) -> Result<()> {
        match op {
            "add" => {
                let rule: Rule =
                    simd_json::serde::from_slice(payload).context("decode rule payload")?;
                let id = rule.id.clone();
                self.store.create(rule)?;
                tracing::info!(rule = %id, "rule created");
                Ok(())
            }
            "update" => {
                let rule: Rule =
                    simd_json::serde::from_slice(payload).context("decode rule payload")?;
                let id = rule.id.clone();
                self.store.update(rule)?;
                tracing::info!(rule = %id, "rule updated");
                Ok(())
            }
            "delete" => {
                let rule: Rule =
                    simd_json::serde::from_slice(payload).context("decode rule payload")?;
                if self.store.delete(&rule.id)? {
                    tracing::info!(rule = %rule.id, "rule deleted");
                } else {
                    tracing::debug!(rule = %rule.id, "delete for unknown rule");
                }
                Ok(())
            }
            "get" => self.publish_rules().await,
            other => {
                tracing::debug!(op = other, "ignoring unknown rule operation");
                Ok(())
            }
        }
    }

    /// Always answers from the authoritative in-memory set, so a client that
    /// mutates then lists observes its own write.
    async fn publish_rules(&self) -> Result<()> {
        let rules = self.store.list();
        let body = serde_json::to_vec(&json!({ "rules": rules }))?;
        self.mqtt
            .publish(RULES_CALLBACK_TOPIC, QoS::AtLeastOnce, false, body)
            .await
            .context("publish rule list")?;
        Ok(())
    }

    fn handle_config_response(&self, device_id: &str, payload: &mut [u8]) -> Result<()> {
        let response: ConfigResponse =
            simd_json::serde::from_slice(payload).context("decode config response")?;
        let count = response.sensors.len();
        self.cache.apply_response(device_id, response.sensors);
        tracing::debug!(device = device_id, count, "device config cached");
        Ok(())
    }

    fn handle_reading(
        &self,
        topic_device: &str,
        topic_sensor: &str,
        payload: &mut [u8],
    ) -> Result<()> {
        let reading = decode_reading(topic_device, topic_sensor, payload, Utc::now())?;

        // Actuator reports keep the config cache toggle-sensible even without
        // an explicit config fetch.
        if reading.is_actuator() {
            if let ReadingValues::Scalar(value) = &reading.values {
                self.cache
                    .observe_actuator(&reading.device_id, &reading.sensor_id, reading.type_id, value);
            }
        }

        for point in points_for_reading(&reading) {
            self.tsdb.enqueue(point);
        }

        self.engine.evaluate(&reading, Instant::now());
        Ok(())
    }
}
