use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::device::codec;
use crate::device::liveness::{Expired, LivenessSupervisor};
use crate::device::now_ms;
use crate::device::registry::DeviceRegistry;
use crate::hub::{FanoutHub, HubEvent};
use crate::mqtt::InboundMessage;
use crate::rules::store::RulesStore;

/// Sole writer of device state. Telemetry and liveness expiries are handled one
/// at a time on this loop, so a reading and its timer re-arm are never split.
pub struct Broker {
    registry: Arc<DeviceRegistry>,
    rules: Arc<RulesStore>,
    hub: Arc<FanoutHub>,
    liveness: LivenessSupervisor,
    expired_rx: mpsc::UnboundedReceiver<Expired>,
}

impl Broker {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        rules: Arc<RulesStore>,
        hub: Arc<FanoutHub>,
        offline_timeout: Duration,
    ) -> Self {
        let (liveness, expired_rx) = LivenessSupervisor::new(offline_timeout);
        Self {
            registry,
            rules,
            hub,
            liveness,
            expired_rx,
        }
    }

    pub async fn run(mut self, mut inbound_rx: mpsc::Receiver<InboundMessage>) {
        loop {
            tokio::select! {
                msg = inbound_rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        info!("Inbound channel closed, stopping broker");
                        break;
                    }
                },
                Some(expired) = self.expired_rx.recv() => {
                    self.handle_expired(expired).await;
                }
            }
        }
        self.liveness.shutdown();
    }

    async fn handle_message(&mut self, msg: InboundMessage) {
        let reading = match codec::decode(&msg.topic, &msg.payload, now_ms()) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Dropping message on {}: {}", msg.topic, e);
                return;
            }
        };
        let device_id = reading.device_id.clone();

        let previous = self.registry.get(&device_id).await;
        let state = self.registry.apply(reading).await;
        self.liveness.on_reading(&device_id);
        debug!("Reading from {}", device_id);

        self.hub
            .broadcast(HubEvent::Reading {
                reading: state.latest.clone(),
                online: state.online,
            })
            .await;

        match previous {
            None => {
                info!("New device {}", device_id);
                self.resync_rules(&device_id);
            }
            Some(previous) if !previous.online => {
                info!("Device {} is back online", device_id);
                self.hub
                    .broadcast(HubEvent::LivenessChanged {
                        device_id: device_id.clone(),
                        online: true,
                        at: state.last_seen_at,
                    })
                    .await;
                self.resync_rules(&device_id);
            }
            Some(_) => {}
        }
    }

    async fn handle_expired(&mut self, expired: Expired) {
        if !self.liveness.on_expired(&expired) {
            return;
        }
        let Some(state) = self.registry.mark_offline(&expired.device_id, now_ms()).await else {
            return;
        };
        warn!("Device {} went offline", state.device_id);
        self.hub
            .broadcast(HubEvent::LivenessChanged {
                device_id: state.device_id,
                online: false,
                at: state.last_seen_at,
            })
            .await;
    }

    /// Push stored rules to a device that just (re)appeared, without waiting.
    fn resync_rules(&self, device_id: &str) {
        let rules = self.rules.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            match rules.resync(&device_id).await {
                Ok(Some(rule_set)) => info!(
                    "Resent {} rule(s) to {} (savedAt={})",
                    rule_set.rules.len(),
                    device_id,
                    rule_set.saved_at
                ),
                Ok(None) => {}
                Err(e) => warn!("Could not resend rules to {}: {}", device_id, e),
            }
        });
    }
}
