use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ControlCommand;
use crate::config::control_topic;
use crate::device::DeviceId;
use crate::error::CommandError;
use crate::mqtt::{OutboundPublish, PublishResult};

#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub expect_ack: bool,
    pub timeout: Duration,
}

impl SendOptions {
    pub fn acked(timeout: Duration) -> Self {
        Self {
            expect_ack: true,
            timeout,
        }
    }

    pub fn fire_and_forget(timeout: Duration) -> Self {
        Self {
            expect_ack: false,
            timeout,
        }
    }
}

/// What was published, returned to the caller on success.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub topic: String,
    pub payload: Value,
}

struct PendingCommand {
    device_id: DeviceId,
    command: &'static str,
    issued_at: Instant,
}

/// Removes its pending entry when dropped, including when the caller stops
/// waiting before the transport answers.
struct Tracked<'a> {
    router: &'a CommandRouter,
    id: Uuid,
}

impl Tracked<'_> {
    fn finish(self) -> Option<PendingCommand> {
        self.router.pending_commands().remove(&self.id)
    }
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.router.pending_commands().remove(&self.id) {
            debug!(
                "Command {} ({}) to {} abandoned before the transport answered",
                self.id, pending.command, pending.device_id
            );
        }
    }
}

/// Publishes control commands and waits for the transport's verdict.
/// Never retries; the caller decides what to do with a failure.
pub struct CommandRouter {
    topic_prefix: String,
    outbound: mpsc::Sender<OutboundPublish>,
    pending: Mutex<HashMap<Uuid, PendingCommand>>,
}

impl CommandRouter {
    pub fn new(topic_prefix: String, outbound: mpsc::Sender<OutboundPublish>) -> Self {
        Self {
            topic_prefix,
            outbound,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn send(
        &self,
        device_id: &str,
        command: &ControlCommand,
        options: SendOptions,
    ) -> Result<Ack, CommandError> {
        let topic = control_topic(&self.topic_prefix, device_id);
        let payload = serde_json::to_value(command)
            .map_err(|e| CommandError::PublishFailed(e.to_string()))?;
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| CommandError::PublishFailed(e.to_string()))?;

        let correlation_id = Uuid::new_v4();
        let tracked = self.track(
            correlation_id,
            PendingCommand {
                device_id: device_id.to_string(),
                command: command.name(),
                issued_at: Instant::now(),
            },
        );
        debug!(
            "Command {} ({}) -> {} (ack={})",
            correlation_id,
            command.name(),
            topic,
            options.expect_ack
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = OutboundPublish {
            topic: topic.clone(),
            payload: bytes,
            ack_required: options.expect_ack,
            reply: reply_tx,
        };
        let result = self.dispatch(request, reply_rx, options.timeout).await;

        if let Some(pending) = tracked.finish() {
            match &result {
                Ok(()) => debug!(
                    "Command {} to {} confirmed in {:?}",
                    correlation_id,
                    pending.device_id,
                    pending.issued_at.elapsed()
                ),
                Err(e) => warn!(
                    "Command {} ({}) to {} failed: {}",
                    correlation_id, pending.command, pending.device_id, e
                ),
            }
        }

        result.map(|()| Ack { topic, payload })
    }

    /// Commands currently waiting on the transport.
    pub fn in_flight(&self) -> usize {
        self.pending_commands().len()
    }

    fn pending_commands(&self) -> MutexGuard<'_, HashMap<Uuid, PendingCommand>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, id: Uuid, command: PendingCommand) -> Tracked<'_> {
        self.pending_commands().insert(id, command);
        Tracked { router: self, id }
    }

    async fn dispatch(
        &self,
        request: OutboundPublish,
        reply_rx: oneshot::Receiver<PublishResult>,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let delivery = async {
            self.outbound
                .send(request)
                .await
                .map_err(|_| CommandError::PublishFailed("transport is not running".into()))?;
            match reply_rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(cause)) => Err(CommandError::PublishFailed(cause)),
                Err(_) => Err(CommandError::PublishFailed(
                    "transport dropped the request".into(),
                )),
            }
        };

        tokio::time::timeout(timeout, delivery)
            .await
            .unwrap_or(Err(CommandError::Timeout(timeout)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    /// How the fake transport answers each publish.
    #[derive(Clone, Copy)]
    pub(crate) enum Transport {
        Accept,
        Reject,
        Silent,
    }

    pub(crate) struct Published {
        pub topic: String,
        pub payload: Value,
        pub ack_required: bool,
    }

    /// Stands in for the MQTT task: answers publishes and records them.
    pub(crate) fn fake_transport(
        behaviour: Transport,
    ) -> (mpsc::Sender<OutboundPublish>, mpsc::UnboundedReceiver<Published>) {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundPublish>(16);
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut parked = Vec::new();
            while let Some(request) = outbound_rx.recv().await {
                let _ = seen_tx.send(Published {
                    topic: request.topic.clone(),
                    payload: serde_json::from_slice(&request.payload).unwrap(),
                    ack_required: request.ack_required,
                });
                match behaviour {
                    Transport::Accept => {
                        let _ = request.reply.send(Ok(()));
                    }
                    Transport::Reject => {
                        let _ = request.reply.send(Err("connection refused".into()));
                    }
                    Transport::Silent => parked.push(request.reply),
                }
            }
        });
        (outbound_tx, seen_rx)
    }

    pub(crate) fn router(
        behaviour: Transport,
    ) -> (Arc<CommandRouter>, mpsc::UnboundedReceiver<Published>) {
        let (outbound_tx, seen_rx) = fake_transport(behaviour);
        (
            Arc::new(CommandRouter::new("farm".into(), outbound_tx)),
            seen_rx,
        )
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn publishes_on_device_control_topic() {
        let (router, mut seen) = router(Transport::Accept);
        let ack = router
            .send(
                "node-1",
                &ControlCommand::SetPump { pump: true },
                SendOptions::acked(TIMEOUT),
            )
            .await
            .unwrap();

        assert_eq!(ack.topic, "farm/node-1/control");
        assert_eq!(ack.payload, json!({"cmd":"setPump","pump":true}));

        let published = seen.recv().await.unwrap();
        assert_eq!(published.topic, "farm/node-1/control");
        assert_eq!(published.payload, json!({"cmd":"setPump","pump":true}));
        assert!(published.ack_required);
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn surfaces_transport_failure() {
        let (router, _seen) = router(Transport::Reject);
        let err = router
            .send(
                "node-1",
                &ControlCommand::SetPump { pump: false },
                SendOptions::fire_and_forget(TIMEOUT),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::PublishFailed("connection refused".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_ack() {
        let (router, _seen) = router(Transport::Silent);
        let err = router
            .send(
                "node-1",
                &ControlCommand::SetPump { pump: true },
                SendOptions::acked(TIMEOUT),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout(TIMEOUT));
        assert_eq!(router.in_flight(), 0);
    }

    #[tokio::test]
    async fn fails_when_transport_is_gone() {
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        drop(outbound_rx);
        let router = CommandRouter::new("farm".into(), outbound_tx);
        let err = router
            .send(
                "node-1",
                &ControlCommand::SetPump { pump: true },
                SendOptions::acked(TIMEOUT),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::PublishFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_commands_do_not_block_each_other() {
        let (router, _seen) = router(Transport::Silent);
        let slow = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .send(
                        "node-1",
                        &ControlCommand::SetPump { pump: true },
                        SendOptions::acked(Duration::from_secs(60)),
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;

        let quick = router
            .send(
                "node-2",
                &ControlCommand::SetMode {
                    mode: crate::device::Mode::Manual,
                },
                SendOptions::acked(Duration::from_secs(1)),
            )
            .await;
        assert_eq!(quick, Err(CommandError::Timeout(Duration::from_secs(1))));
        assert!(!slow.is_finished());
        assert_eq!(router.in_flight(), 1);
        slow.abort();
    }
    #[tokio::test(start_paused = true)]
    async fn abandoned_send_is_no_longer_pending() {
        let (router, mut seen) = router(Transport::Silent);
        let waiting = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .send(
                        "node-1",
                        &ControlCommand::SetPump { pump: true },
                        SendOptions::acked(TIMEOUT),
                    )
                    .await
            })
        };
        seen.recv().await.unwrap();
        assert_eq!(router.in_flight(), 1);

        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert_eq!(router.in_flight(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(router.in_flight(), 0);
    }
}
