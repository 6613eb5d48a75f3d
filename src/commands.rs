use crate::config::Config;
use crate::devices::{DeviceConfigCache, DeviceSensorConfig};
use crate::rules::ActionMode;
use crate::sensor::scalar_to_f64;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// One actuator state change requested by the rule engine. The engine hands
/// these off over an unbounded channel and never waits on the HTTP layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub device_id: String,
    pub actuator_id: String,
    pub value: f64,
    pub pulse_seconds: f64,
    pub mode: ActionMode,
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send_set(&self, device_id: &str, body: JsonValue) -> Result<()>;
}

pub struct HttpCommandTransport {
    client: reqwest::Client,
    api_base: String,
}

impl HttpCommandTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .context("build command HTTP client")?;
        Ok(Self {
            client,
            api_base: config.api_base.clone(),
        })
    }
}

#[async_trait]
impl CommandTransport for HttpCommandTransport {
    async fn send_set(&self, device_id: &str, body: JsonValue) -> Result<()> {
        let url = format!("{}/{}/settings/sensors/set", self.api_base, device_id);
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?;
        Ok(())
    }
}

/// Worker that drains command requests. Each request runs as its own task so
/// a slow or failed POST never holds up ingest or other rules; pulse waits
/// are cancelled on shutdown without emitting the off-command.
pub fn spawn_dispatcher(
    transport: Arc<dyn CommandTransport>,
    cache: DeviceConfigCache,
    mut rx: mpsc::UnboundedReceiver<CommandRequest>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => {
                    let Some(request) = maybe else { break };
                    let transport = transport.clone();
                    let cache = cache.clone();
                    let cancel = cancel.clone();
                    tracker.spawn(async move {
                        execute(transport, cache, request, cancel).await;
                    });
                }
            }
        }
    })
}

async fn execute(
    transport: Arc<dyn CommandTransport>,
    cache: DeviceConfigCache,
    request: CommandRequest,
    cancel: CancellationToken,
) {
    let value = match request.mode {
        ActionMode::Set => request.value,
        ActionMode::Toggle => {
            next_toggle_value(cache.get(&request.device_id, &request.actuator_id).as_ref())
        }
    };

    issue(&*transport, &cache, &request, value).await;

    if request.pulse_seconds > 0.0 {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(
                    device = %request.device_id,
                    actuator = %request.actuator_id,
                    "pulse cancelled before off-command"
                );
                return;
            }
            _ = sleep(Duration::from_secs_f64(request.pulse_seconds)) => {}
        }
        issue(&*transport, &cache, &request, 0.0).await;
    }
}

async fn issue(
    transport: &dyn CommandTransport,
    cache: &DeviceConfigCache,
    request: &CommandRequest,
    value: f64,
) {
    let descriptor = build_descriptor(
        cache.get(&request.device_id, &request.actuator_id).as_ref(),
        &request.actuator_id,
        value,
    );
    cache.set_commanded_value(&request.device_id, &request.actuator_id, value);

    let body = json!({ "sensors": [descriptor] });
    if let Err(err) = transport.send_set(&request.device_id, body).await {
        tracing::warn!(
            error = %err,
            device = %request.device_id,
            actuator = %request.actuator_id,
            "actuator command failed; dropping"
        );
    } else {
        tracing::debug!(
            device = %request.device_id,
            actuator = %request.actuator_id,
            value,
            "actuator command sent"
        );
    }
}

/// Full descriptor when the device config is cached, minimal otherwise.
fn build_descriptor(
    config: Option<&DeviceSensorConfig>,
    actuator_id: &str,
    value: f64,
) -> JsonValue {
    match config {
        Some(config) => json!({
            "id": config.id,
            "desc": config.desc,
            "tipo": config.tipo,
            "pinos": config.pinos,
            "atributo1": value,
        }),
        None => json!({
            "id": actuator_id,
            "atributo1": value,
        }),
    }
}

fn next_toggle_value(config: Option<&DeviceSensorConfig>) -> f64 {
    let current = config
        .and_then(|config| config.atributo1.as_ref())
        .and_then(scalar_to_f64)
        .unwrap_or(0.0);
    if current == 0.0 {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::task::yield_now;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, JsonValue)>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<(String, JsonValue)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandTransport for RecordingTransport {
        async fn send_set(&self, device_id: &str, body: JsonValue) -> Result<()> {
            self.sent.lock().unwrap().push((device_id.to_string(), body));
            Ok(())
        }
    }

    fn request(value: f64, pulse_seconds: f64, mode: ActionMode) -> CommandRequest {
        CommandRequest {
            device_id: "dev-b".to_string(),
            actuator_id: "light".to_string(),
            value,
            pulse_seconds,
            mode,
        }
    }

    async fn wait_for_sends(transport: &RecordingTransport, count: usize) {
        for _ in 0..64 {
            if transport.sent().len() >= count {
                return;
            }
            yield_now().await;
        }
        panic!("expected {count} commands, saw {:?}", transport.sent());
    }

    fn commanded_value(body: &JsonValue) -> f64 {
        body["sensors"][0]["atributo1"].as_f64().expect("atributo1")
    }

    #[test]
    fn descriptor_uses_cached_config_when_present() {
        let config = DeviceSensorConfig {
            id: "light".to_string(),
            desc: Some("porch light".to_string()),
            tipo: Some(5),
            pinos: vec![26],
            atributo1: Some(json!(0)),
        };
        let full = build_descriptor(Some(&config), "light", 1.0);
        assert_eq!(full["desc"], json!("porch light"));
        assert_eq!(full["tipo"], json!(5));
        assert_eq!(full["pinos"], json!([26]));
        assert_eq!(full["atributo1"], json!(1.0));

        let minimal = build_descriptor(None, "light", 1.0);
        assert_eq!(minimal, json!({"id": "light", "atributo1": 1.0}));
    }

    #[test]
    fn toggle_alternates_and_defaults_on() {
        assert_eq!(next_toggle_value(None), 1.0);

        let mut config = DeviceSensorConfig {
            id: "light".to_string(),
            desc: None,
            tipo: None,
            pinos: Vec::new(),
            atributo1: Some(json!(1)),
        };
        assert_eq!(next_toggle_value(Some(&config)), 0.0);
        config.atributo1 = Some(json!(0));
        assert_eq!(next_toggle_value(Some(&config)), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_issues_on_then_off_after_the_dwell() {
        let transport = Arc::new(RecordingTransport::default());
        let cache = DeviceConfigCache::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let _worker = spawn_dispatcher(transport.clone(), cache, rx, cancel.clone(), tracker);

        tx.send(request(1.0, 3.0, ActionMode::Set)).expect("send");
        wait_for_sends(&transport, 1).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        yield_now().await;
        assert_eq!(transport.sent().len(), 1, "off-command before the pulse elapsed");

        tokio::time::advance(Duration::from_millis(1100)).await;
        wait_for_sends(&transport, 2).await;

        let sent = transport.sent();
        assert_eq!(commanded_value(&sent[0].1), 1.0);
        assert_eq!(commanded_value(&sent[1].1), 0.0);
        assert_eq!(sent[0].0, "dev-b");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_pulse_skips_the_off_command() {
        let transport = Arc::new(RecordingTransport::default());
        let cache = DeviceConfigCache::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let _worker =
            spawn_dispatcher(transport.clone(), cache, rx, cancel.clone(), tracker.clone());

        tx.send(request(1.0, 30.0, ActionMode::Set)).expect("send");
        wait_for_sends(&transport, 1).await;

        cancel.cancel();
        tracker.close();
        tracker.wait().await;

        tokio::time::advance(Duration::from_secs(60)).await;
        yield_now().await;
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_reads_and_updates_the_cache() {
        let transport = Arc::new(RecordingTransport::default());
        let cache = DeviceConfigCache::new();
        cache.set_commanded_value("dev-b", "light", 1.0);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let _worker =
            spawn_dispatcher(transport.clone(), cache.clone(), rx, cancel, tracker);

        tx.send(request(0.0, 0.0, ActionMode::Toggle)).expect("send");
        wait_for_sends(&transport, 1).await;
        tx.send(request(0.0, 0.0, ActionMode::Toggle)).expect("send");
        wait_for_sends(&transport, 2).await;

        let sent = transport.sent();
        assert_eq!(commanded_value(&sent[0].1), 0.0);
        assert_eq!(commanded_value(&sent[1].1), 1.0);
    }
}
