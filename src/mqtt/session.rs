//! One broker session per connect attempt.
//!
//! A session owns the rumqttc client plus a pump task that polls the
//! connection event loop and forwards what matters into the service loop,
//! tagged with the session's generation. The pump stops on the first
//! connection error instead of letting rumqttc retry internally; the
//! supervisor owns reconnection policy.

use super::BrokerEvent;
use crate::config::BrokerSettings;
use rumqttc::{AsyncClient, ClientError, Event, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// A broker event together with the generation of the session it came from.
#[derive(Debug)]
pub struct SessionEvent {
    pub generation: u64,
    pub event: BrokerEvent,
}

pub struct BrokerSession {
    client: AsyncClient,
    generation: u64,
    pump: JoinHandle<()>,
}

impl BrokerSession {
    /// Builds the client and starts the event pump. The TCP connect itself
    /// happens asynchronously as the pump polls; the service learns the
    /// outcome through `BrokerEvent::Connected` or `ConnectionLost`.
    pub fn open(
        settings: &BrokerSettings,
        device_id: &str,
        generation: u64,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let mut options = MqttOptions::new(device_id, &settings.uri, settings.port);
        options
            .set_credentials(settings.user.clone(), settings.password.clone())
            .set_keep_alive(KEEP_ALIVE);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let pump = tokio::spawn(async move {
            loop {
                let event = match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => BrokerEvent::Connected,
                    Ok(Event::Incoming(Packet::SubAck(_))) => BrokerEvent::Subscribed,
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        BrokerEvent::PublishConfirmed(ack.pkid)
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => BrokerEvent::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    },
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        let _ = events
                            .send(SessionEvent {
                                generation,
                                event: BrokerEvent::ConnectionLost(
                                    "broker sent disconnect".to_string(),
                                ),
                            })
                            .await;
                        return;
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        BrokerEvent::PublishQueued(pkid)
                    }
                    Ok(other) => {
                        debug!(generation, "unhandled broker event: {other:?}");
                        continue;
                    }
                    Err(e) => {
                        let _ = events
                            .send(SessionEvent {
                                generation,
                                event: BrokerEvent::ConnectionLost(e.to_string()),
                            })
                            .await;
                        return;
                    }
                };

                if events.send(SessionEvent { generation, event }).await.is_err() {
                    return;
                }
            }
        });

        Self {
            client,
            generation,
            pump,
        }
    }

    /// Session around an externally built client, without a pump.
    #[cfg(test)]
    pub(crate) fn stub(client: AsyncClient, generation: u64) -> Self {
        Self {
            client,
            generation,
            pump: tokio::spawn(async {}),
        }
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.client.subscribe(topic, QoS::AtLeastOnce).await
    }

    /// Requests a clean disconnect. The pump reports the resulting
    /// connection loss (tagged with this session's generation) and exits.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.client.disconnect().await
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
