use std::collections::VecDeque;

use indexmap::IndexMap;
use tokio::sync::RwLock;

use super::{DeviceId, DeviceState, SensorReading};

struct DeviceEntry {
    state: DeviceState,
    history: VecDeque<SensorReading>,
}

/// Latest state per device, in first-seen order, plus a bounded reading history.
pub struct DeviceRegistry {
    devices: RwLock<IndexMap<DeviceId, DeviceEntry>>,
    history_limit: usize,
}

impl DeviceRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            devices: RwLock::new(IndexMap::new()),
            history_limit,
        }
    }

    /// Replace the device's state with `reading` (no field merge) and mark it online.
    pub async fn apply(&self, reading: SensorReading) -> DeviceState {
        let mut devices = self.devices.write().await;
        let state = DeviceState {
            device_id: reading.device_id.clone(),
            online: true,
            last_seen_at: reading.received_at,
            latest: reading.clone(),
        };

        let entry = devices
            .entry(reading.device_id.clone())
            .or_insert_with(|| DeviceEntry {
                state: state.clone(),
                history: VecDeque::new(),
            });
        entry.state = state.clone();
        if self.history_limit > 0 {
            if entry.history.len() == self.history_limit {
                entry.history.pop_front();
            }
            entry.history.push_back(reading);
        }
        state
    }

    /// Returns `None` when the device is unknown or already offline.
    pub async fn mark_offline(&self, device_id: &str, at: i64) -> Option<DeviceState> {
        let mut devices = self.devices.write().await;
        let entry = devices.get_mut(device_id)?;
        if !entry.state.online {
            return None;
        }
        entry.state.online = false;
        entry.state.last_seen_at = at;
        Some(entry.state.clone())
    }

    pub async fn snapshot(&self) -> Vec<DeviceState> {
        self.devices
            .read()
            .await
            .values()
            .map(|entry| entry.state.clone())
            .collect()
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceState> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|entry| entry.state.clone())
    }

    /// Oldest first.
    pub async fn history(&self, device_id: &str) -> Option<Vec<SensorReading>> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|entry| entry.history.iter().cloned().collect())
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }
}
