use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::DeviceId;

/// Sent by a device's timer when its silence window elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub device_id: DeviceId,
    generation: u64,
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// One-shot silence timer per device. Expiries are delivered on a channel so the
/// owning loop handles them in order with readings; an expiry that a later reading
/// superseded is recognised by its generation and ignored.
pub struct LivenessSupervisor {
    timeout: Duration,
    timers: HashMap<DeviceId, Timer>,
    expired_tx: mpsc::UnboundedSender<Expired>,
    next_generation: u64,
}

impl LivenessSupervisor {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<Expired>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            timeout,
            timers: HashMap::new(),
            expired_tx,
            next_generation: 0,
        };
        (supervisor, expired_rx)
    }

    /// Cancel any pending timer for the device and arm a fresh one.
    pub fn on_reading(&mut self, device_id: &str) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let tx = self.expired_tx.clone();
        let deadline = Instant::now() + self.timeout;
        let expired = Expired {
            device_id: device_id.to_string(),
            generation,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(expired);
        });

        if let Some(previous) = self
            .timers
            .insert(device_id.to_string(), Timer { generation, handle })
        {
            previous.handle.abort();
        }
    }

    /// True if `expired` is the device's current timer, which is then disarmed.
    pub fn on_expired(&mut self, expired: &Expired) -> bool {
        match self.timers.get(&expired.device_id) {
            Some(timer) if timer.generation == expired.generation => {
                self.timers.remove(&expired.device_id);
                true
            }
            _ => {
                debug!("Ignoring stale liveness timer for {}", expired.device_id);
                false
            }
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, device_id: &str) -> bool {
        self.timers.contains_key(device_id)
    }

    pub fn shutdown(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for LivenessSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(15_000);

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_silence() {
        let (mut supervisor, mut expired_rx) = LivenessSupervisor::new(TIMEOUT);
        supervisor.on_reading("node-1");
        assert!(supervisor.is_armed("node-1"));

        tokio::time::advance(TIMEOUT).await;
        settle().await;

        let expired = expired_rx.try_recv().unwrap();
        assert_eq!(expired.device_id, "node-1");
        assert!(supervisor.on_expired(&expired));
        assert!(!supervisor.is_armed("node-1"));
        assert!(!supervisor.on_expired(&expired));
    }

    #[tokio::test(start_paused = true)]
    async fn reading_before_deadline_rearms() {
        let (mut supervisor, mut expired_rx) = LivenessSupervisor::new(TIMEOUT);
        supervisor.on_reading("node-1");

        tokio::time::advance(TIMEOUT - Duration::from_millis(1)).await;
        supervisor.on_reading("node-1");
        tokio::time::advance(Duration::from_millis(2)).await;
        settle().await;
        assert!(expired_rx.try_recv().is_err());

        tokio::time::advance(TIMEOUT).await;
        settle().await;
        let expired = expired_rx.try_recv().unwrap();
        assert!(supervisor.on_expired(&expired));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_expiry_is_ignored() {
        let (mut supervisor, mut expired_rx) = LivenessSupervisor::new(TIMEOUT);
        supervisor.on_reading("node-1");
        tokio::time::advance(TIMEOUT).await;
        settle().await;
        let stale = expired_rx.try_recv().unwrap();

        // A reading processed after the timer fired but before its expiry was handled.
        supervisor.on_reading("node-1");
        assert!(!supervisor.on_expired(&stale));
        assert!(supervisor.is_armed("node-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let (mut supervisor, mut expired_rx) = LivenessSupervisor::new(TIMEOUT);
        supervisor.on_reading("node-1");
        supervisor.on_reading("node-2");
        supervisor.shutdown();

        tokio::time::advance(TIMEOUT * 2).await;
        settle().await;
        assert!(expired_rx.try_recv().is_err());
    }
}
