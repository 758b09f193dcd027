use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use common::SubscriberConfig;
use log::{debug, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use tokio::time::timeout;

use crate::pump::{Delivery, EventSource};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 10;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub fn client_id(prefix: &str) -> String {
    format!("{}-{:04x}", prefix, rand::random::<u16>())
}

/// A subscribed broker session. Owns the MQTT event loop; whoever holds it is
/// the only code driving the connection.
pub struct MqttSource {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
}

/// Connects and subscribes. Each of CONNACK and SUBACK has to arrive within
/// the configured timeout, and the broker has to grant the subscription.
pub async fn connect(config: &SubscriberConfig) -> Result<MqttSource> {
    let id = client_id(&config.client_prefix);
    let mut options = MqttOptions::new(&id, &config.broker_host, config.broker_port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

    timeout(config.connect_timeout, wait_for_connack(&mut eventloop))
        .await
        .map_err(|_| {
            anyhow!(
                "no answer from {}:{} within {:?}",
                config.broker_host,
                config.broker_port,
                config.connect_timeout
            )
        })??;

    info!(
        "Connected to MQTT broker at {}:{} as {}",
        config.broker_host, config.broker_port, id
    );

    client.subscribe(&config.topic, QoS::AtMostOnce).await?;
    let granted = timeout(config.connect_timeout, wait_for_suback(&mut eventloop))
        .await
        .map_err(|_| {
            anyhow!(
                "no SUBACK for {} within {:?}",
                config.topic,
                config.connect_timeout
            )
        })??;
    if !granted {
        bail!("broker rejected subscription to {}", config.topic);
    }
    info!("Subscribed to topic: {}", config.topic);

    Ok(MqttSource {
        client,
        eventloop,
        topic: config.topic.clone(),
    })
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    bail!("connection refused: {:?}", ack.code);
                }
                return Ok(());
            }
            event => debug!("MQTT event {:?}", event),
        }
    }
}

fn granted(ack: &SubAck) -> bool {
    ack.return_codes
        .iter()
        .all(|code| !matches!(code, SubscribeReasonCode::Failure))
}

/// Whether the broker granted the subscription.
async fn wait_for_suback(eventloop: &mut EventLoop) -> Result<bool> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::SubAck(ack)) => return Ok(granted(&ack)),
            event => debug!("MQTT event {:?}", event),
        }
    }
}

impl MqttSource {
    /// Sends DISCONNECT and drives the event loop until it is on the wire.
    pub async fn close(mut self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("disconnect request failed: {}", e);
            return;
        }

        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if timeout(DISCONNECT_TIMEOUT, flush).await.is_err() {
            warn!("broker did not take the disconnect in time");
        }
        info!("Disconnected from MQTT broker");
    }
}

impl EventSource for MqttSource {
    fn next_delivery(&mut self) -> impl Future<Output = Result<Option<Delivery>>> + Send {
        async move {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::Publish(publish)) => Ok(Some(Delivery {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                })),
                // the first CONNACK is consumed by `connect`, this one is a
                // reconnect and the clean session forgot the subscription
                Event::Incoming(Packet::ConnAck(_)) => {
                    info!("Reconnected, subscribing to {} again", self.topic);
                    self.client
                        .try_subscribe(self.topic.clone(), QoS::AtMostOnce)?;
                    Ok(None)
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    if granted(&ack) {
                        info!("Subscribed to topic: {}", self.topic);
                    } else {
                        warn!("broker rejected subscription to {}", self.topic);
                    }
                    Ok(None)
                }
                event => {
                    debug!("MQTT event {:?}", event);
                    Ok(None)
                }
            }
        }
    }
}
