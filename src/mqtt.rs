use crate::config::Config;
use crate::router::Router;
use anyhow::{anyhow, Result};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

pub const SENSOR_DATA_FILTER: &str = "+/sensors/+/data";
pub const RULES_FILTER: &str = "rules/+";
pub const CONFIG_RESPONSE_FILTER: &str = "+/settings/sensors/get/response";

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub fn connect(config: &Config) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(
        config.broker_client_id.clone(),
        config.broker_host.clone(),
        config.broker_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    if let Some(username) = &config.broker_username {
        options.set_credentials(
            username.clone(),
            config.broker_password.clone().unwrap_or_default(),
        );
    }
    AsyncClient::new(options, 64)
}

/// Single durable broker loop: messages are delivered to the router in FIFO
/// order; connection errors back off exponentially (1s doubling to 30s, reset
/// on success) and become fatal once the retry limit is exhausted.
pub async fn run_listener(
    config: Config,
    client: AsyncClient,
    mut eventloop: EventLoop,
    router: Router,
    cancel: CancellationToken,
) -> Result<()> {
    let mut backoff = INITIAL_BACKOFF;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    // Subscriptions do not survive a reconnect.
                    if let Err(err) = subscribe_all(&client).await {
                        tracing::warn!(error = %err, "failed to subscribe after connect");
                        continue;
                    }
                    tracing::info!(host = %config.broker_host, port = config.broker_port, "connected to broker");
                    backoff = INITIAL_BACKOFF;
                    failures = 0;
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    if let Err(err) = router.handle_publish(&publish.topic, &mut payload).await {
                        tracing::warn!(
                            error = %err,
                            topic = %publish.topic,
                            "failed to process message; discarding"
                        );
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    failures += 1;
                    if failures >= config.broker_max_retries {
                        return Err(anyhow!(
                            "broker unreachable after {failures} attempts: {err}"
                        ));
                    }
                    tracing::warn!(
                        error = %err,
                        attempt = failures,
                        backoff_secs = backoff.as_secs(),
                        "broker connection error; backing off"
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

async fn subscribe_all(client: &AsyncClient) -> Result<()> {
    for filter in [SENSOR_DATA_FILTER, RULES_FILTER, CONFIG_RESPONSE_FILTER] {
        client.subscribe(filter, QoS::AtLeastOnce).await?;
    }
    Ok(())
}
