use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{InboundMessage, OutboundPublish, PublishResult};
use crate::config::Config;

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    sub_topic: String,
}

impl MqttClient {
    pub fn new(config: &Config) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.mqtt.client_id,
            &config.mqtt.broker_host,
            config.mqtt.broker_port,
        );
        mqttopts.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.mqtt.username, &config.mqtt.password) {
            mqttopts.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(mqttopts, 100);

        Self {
            client,
            eventloop,
            sub_topic: config.mqtt.sub_topic.clone(),
        }
    }

    /// Run the MQTT event loop. Subscribes to the telemetry filter on every
    /// connect, forwards incoming publishes through `inbound_tx`, and publishes
    /// commands received from `outbound_rx`.
    pub async fn run(
        mut self,
        inbound_tx: mpsc::Sender<InboundMessage>,
        mut outbound_rx: mpsc::Receiver<OutboundPublish>,
    ) {
        let mut acks = AckTracker::default();

        loop {
            tokio::select! {
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            if let Err(e) = self
                                .client
                                .subscribe(&self.sub_topic, QoS::AtLeastOnce)
                                .await
                            {
                                error!("Failed to subscribe to {}: {}", self.sub_topic, e);
                            } else {
                                info!("Subscribed to {}", self.sub_topic);
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let msg = InboundMessage {
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            };
                            if inbound_tx.send(msg).await.is_err() {
                                warn!("Inbound channel closed");
                            }
                        }
                        Ok(Event::Incoming(Incoming::PubAck(ack))) => acks.on_puback(ack.pkid),
                        Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.on_outgoing(pkid),
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(request) = outbound_rx.recv() => {
                    self.publish(request, &mut acks);
                }
            }
        }
    }

    fn publish(&self, request: OutboundPublish, acks: &mut AckTracker) {
        let OutboundPublish {
            topic,
            payload,
            ack_required,
            reply,
        } = request;

        // Non-blocking: the event loop runs in this same task.
        if let Err(e) = self
            .client
            .try_publish(&topic, QoS::AtLeastOnce, false, payload)
        {
            warn!("Failed to publish {}: {}", topic, e);
            let _ = reply.send(Err(e.to_string()));
            return;
        }

        debug!("Queued publish on {}", topic);
        if ack_required {
            acks.queue(Some(reply));
        } else {
            let _ = reply.send(Ok(()));
            acks.queue(None);
        }
    }
}

type Reply = oneshot::Sender<PublishResult>;

/// Matches queued publishes to broker acknowledgements.
///
/// Requests are written by the event loop in the order they were queued, so the
/// next `Outgoing::Publish` belongs to the oldest queued request. A packet id
/// already in flight is a retransmission after reconnect and is skipped.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<Option<Reply>>,
    in_flight: HashMap<u16, Option<Reply>>,
}

impl AckTracker {
    fn queue(&mut self, reply: Option<Reply>) {
        self.queued.push_back(reply);
    }

    fn on_outgoing(&mut self, pkid: u16) {
        // pkid 0 is QoS 0, which this client never sends.
        if pkid == 0 || self.in_flight.contains_key(&pkid) {
            return;
        }
        match self.queued.pop_front() {
            Some(reply) => {
                self.in_flight.insert(pkid, reply);
            }
            None => debug!("Outgoing publish {} has no waiting caller", pkid),
        }
    }

    fn on_puback(&mut self, pkid: u16) {
        if let Some(Some(reply)) = self.in_flight.remove(&pkid) {
            let _ = reply.send(Ok(()));
        }
    }
}
