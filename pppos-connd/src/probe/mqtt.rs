use super::TrafficProbe;
use crate::event_group::{Conditions, EventGroup};
use async_trait::async_trait;
use color_eyre::{
    eyre::{bail, eyre, WrapErr},
    Result,
};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::{
    task::{self, JoinHandle},
    time,
};
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_PORT: u16 = 1883;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u16,
}

impl Broker {
    /// Plain TCP only, `mqtt://host[:port]` or `tcp://host[:port]`.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).wrap_err_with(|| format!("invalid broker uri {uri}"))?;

        match url.scheme() {
            "mqtt" | "tcp" => {}
            other => bail!("unsupported broker scheme {other}, expected mqtt or tcp"),
        }

        let host = url
            .host_str()
            .ok_or_else(|| eyre!("broker uri {uri} has no host"))?;

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}

/// Subscribes to a topic, publishes to the same topic once subscribed, and
/// reports [`Conditions::GOT_DATA`] when the message comes back.
pub struct MqttProbe {
    broker: Broker,
    client_id: String,
    topic: String,
    payload: String,
    running: Option<(AsyncClient, JoinHandle<()>)>,
}

impl MqttProbe {
    pub fn new(broker_uri: &str, topic: &str, payload: &str) -> Result<Self> {
        Ok(Self {
            broker: Broker::parse(broker_uri)?,
            client_id: format!("pppos-connd-{}", std::process::id()),
            topic: topic.to_string(),
            payload: payload.to_string(),
            running: None,
        })
    }
}

#[async_trait]
impl TrafficProbe for MqttProbe {
    async fn start(&mut self, events: EventGroup) -> Result<()> {
        if self.running.is_some() {
            bail!("mqtt probe already started");
        }

        let mut options =
            MqttOptions::new(&self.client_id, &self.broker.host, self.broker.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        let (client, mut event_loop) = AsyncClient::new(options, 10);
        info!(
            "starting mqtt probe against {}:{}",
            self.broker.host, self.broker.port
        );

        let handle = task::spawn({
            let client = client.clone();
            let topic = self.topic.clone();
            let payload = self.payload.clone();

            async move {
                loop {
                    let event = match event_loop.poll().await {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("mqtt error: {e}");
                            time::sleep(RECONNECT_BACKOFF).await;
                            continue;
                        }
                    };
                    debug!("mqtt event: {event:?}");

                    match step(&event) {
                        Step::Subscribe => {
                            info!("mqtt connected, subscribing to {topic}");
                            if let Err(e) = client.try_subscribe(&topic, QoS::AtMostOnce) {
                                warn!("failed to subscribe to {topic}: {e}");
                            }
                        }
                        Step::Publish => {
                            info!("mqtt subscribed, publishing to {topic}");
                            if let Err(e) = client.try_publish(
                                &topic,
                                QoS::AtMostOnce,
                                false,
                                payload.as_bytes(),
                            ) {
                                warn!("failed to publish to {topic}: {e}");
                            }
                        }
                        Step::Received { topic, payload } => {
                            info!("mqtt data");
                            info!("TOPIC={topic}");
                            info!("DATA={payload}");
                            events.set(Conditions::GOT_DATA);
                        }
                        Step::Closed => return,
                        Step::Ignore => {}
                    }
                }
            }
        });

        self.running = Some((client, handle));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some((client, mut handle)) = self.running.take() else {
            return Ok(());
        };

        if let Err(e) = client.try_disconnect() {
            debug!("mqtt disconnect request failed: {e}");
        }

        if time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
            handle.abort();
        }
        info!("mqtt probe stopped");

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    Subscribe,
    Publish,
    Received { topic: String, payload: String },
    Closed,
    Ignore,
}

fn step(event: &Event) -> Step {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => Step::Subscribe,
        Event::Incoming(Packet::SubAck(_)) => Step::Publish,
        Event::Incoming(Packet::Publish(publish)) => Step::Received {
            topic: publish.topic.clone(),
            payload: String::from_utf8_lossy(&publish.payload).into_owned(),
        },
        Event::Outgoing(Outgoing::Disconnect) => Step::Closed,
        _ => Step::Ignore,
    }
}
