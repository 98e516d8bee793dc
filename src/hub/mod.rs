//! FanoutHub - real-time subscriber distribution
//!
//! Every connected subscriber gets its own bounded queue of JSON frames. A full
//! queue drops frames for that subscriber only, so one slow client never holds
//! up the others. Command and rule requests are answered to the requester only.

pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::command::ControlCommand;
use crate::command::router::{CommandRouter, SendOptions};
use crate::device::registry::DeviceRegistry;
use crate::device::{DeviceId, SensorReading};
use crate::rules::RuleSet;
use crate::rules::store::RulesStore;
use protocol::{
    AckFrame, AckReply, ClientFrame, DeviceStatus, SaveRulesRequest, SensorData, ServerEvent,
};

pub type SubscriberId = Uuid;

const SUBSCRIBER_BUFFER: usize = 256;

/// State changes fanned out to every subscriber.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Reading {
        reading: SensorReading,
        online: bool,
    },
    LivenessChanged {
        device_id: DeviceId,
        online: bool,
        at: i64,
    },
    RulesChanged(Vec<RuleSet>),
}

impl From<HubEvent> for ServerEvent {
    fn from(event: HubEvent) -> Self {
        match event {
            HubEvent::Reading { reading, online } => {
                ServerEvent::SensorData(SensorData { reading, online })
            }
            HubEvent::LivenessChanged {
                device_id,
                online,
                at,
            } => ServerEvent::DeviceStatus(DeviceStatus {
                device_id,
                online,
                at,
            }),
            HubEvent::RulesChanged(sets) => ServerEvent::RulesSnapshot(sets),
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<String>,
}

pub struct FanoutHub {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    registry: Arc<DeviceRegistry>,
    rules: Arc<RulesStore>,
    router: Arc<CommandRouter>,
    command_timeout: Duration,
}

impl FanoutHub {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        rules: Arc<RulesStore>,
        router: Arc<CommandRouter>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            registry,
            rules,
            router,
            command_timeout,
        }
    }

    /// Register a subscriber. Its queue starts with the device snapshot and,
    /// if any rules were saved, the rules snapshot.
    pub async fn join(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        // Holding the write lock keeps broadcasts out until the snapshot is queued.
        let mut subscribers = self.subscribers.write().await;

        let devices = self.registry.snapshot().await;
        if let Some(frame) = encode(&ServerEvent::SensorSnapshot(devices)) {
            let _ = tx.try_send(frame);
        }
        let rules = self.rules.snapshot().await;
        if !rules.is_empty() {
            if let Some(frame) = encode(&ServerEvent::RulesSnapshot(rules)) {
                let _ = tx.try_send(frame);
            }
        }

        subscribers.insert(id, Subscriber { tx });
        info!("Subscriber {} joined ({} connected)", id, subscribers.len());
        (id, rx)
    }

    pub async fn leave(&self, id: &SubscriberId) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(id).is_some() {
            info!("Subscriber {} left ({} connected)", id, subscribers.len());
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn broadcast(&self, event: HubEvent) {
        let event = ServerEvent::from(event);
        let Some(frame) = encode(&event) else {
            return;
        };

        let subscribers = self.subscribers.read().await;
        debug!(
            "Broadcasting {} to {} subscriber(s)",
            event.name(),
            subscribers.len()
        );
        for (id, subscriber) in subscribers.iter() {
            match subscriber.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} is lagging, dropped {}", id, event.name());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} already gone", id);
                }
            }
        }
    }

    /// Handle one text frame from a subscriber and answer it with an ack.
    pub async fn handle_frame(&self, subscriber: SubscriberId, text: &str) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.reply(subscriber, None, AckReply::failed(format!("invalid frame: {e}")))
                    .await;
                return;
            }
        };

        let reply = match frame.event.as_str() {
            "control:send" => self.on_command_request(frame.data).await,
            "rules:save" => self.on_rules_save(frame.data).await,
            other => AckReply::failed(format!("unknown event '{other}'")),
        };
        self.reply(subscriber, frame.id, reply).await;
    }

    pub async fn on_command_request(&self, request: Value) -> AckReply {
        let (device_id, command) = match ControlCommand::from_request(request) {
            Ok(parsed) => parsed,
            Err(e) => return AckReply::failed(e),
        };
        match self
            .router
            .send(&device_id, &command, SendOptions::acked(self.command_timeout))
            .await
        {
            Ok(_) => AckReply::ok(),
            Err(e) => AckReply::failed(e),
        }
    }

    /// Save, push to the device, then tell every subscriber about the new rules.
    pub async fn on_rules_save(&self, request: Value) -> AckReply {
        let request: SaveRulesRequest = match serde_json::from_value(request) {
            Ok(request) => request,
            Err(e) => return AckReply::failed(format!("invalid request: {e}")),
        };
        let device_id = request.device_id.unwrap_or_default();

        match self.rules.save(&device_id, &request.rules).await {
            Ok(saved) => {
                self.broadcast(HubEvent::RulesChanged(self.rules.snapshot().await))
                    .await;
                AckReply::saved(saved.saved_at)
            }
            Err(e) => AckReply::failed(e),
        }
    }

    async fn reply(&self, subscriber: SubscriberId, id: Option<u64>, reply: AckReply) {
        let Some(frame) = encode(&AckFrame::new(id, reply)) else {
            return;
        };
        let subscribers = self.subscribers.read().await;
        match subscribers.get(&subscriber) {
            Some(target) => {
                if target.tx.try_send(frame).is_err() {
                    warn!("Could not deliver ack to subscriber {}", subscriber);
                }
            }
            None => debug!("Subscriber {} left before its ack", subscriber),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(json) => Some(json),
        Err(e) => {
            error!("Failed to serialize frame: {}", e);
            None
        }
    }
}
