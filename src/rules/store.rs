use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::info;

use super::{Rule, RuleSet};
use crate::command::ControlCommand;
use crate::command::router::{CommandRouter, SendOptions};
use crate::device::{DeviceId, now_ms};
use crate::error::{CommandError, RulesError, ValidationError};

/// Last saved rule set per device. A save is only complete once the device's
/// `setRules` command has been acknowledged or has failed, and only an
/// acknowledged set is kept.
pub struct RulesStore {
    sets: RwLock<IndexMap<DeviceId, RuleSet>>,
    /// Per-device delivery lock holding the last `savedAt` sent to the device.
    deliveries: Mutex<HashMap<DeviceId, Arc<Mutex<i64>>>>,
    router: Arc<CommandRouter>,
    ack_timeout: Duration,
}

impl RulesStore {
    pub fn new(router: Arc<CommandRouter>, ack_timeout: Duration) -> Self {
        Self {
            sets: RwLock::new(IndexMap::new()),
            deliveries: Mutex::new(HashMap::new()),
            router,
            ack_timeout,
        }
    }

    /// Push new rules to the device and, once acknowledged, replace its stored set.
    ///
    /// A publish failure leaves the previous set in place and is returned to the
    /// caller, who decides whether to retry.
    pub async fn save(&self, device_id: &str, rules: &Value) -> Result<RuleSet, RulesError> {
        if device_id.trim().is_empty() {
            return Err(ValidationError::MissingDeviceId.into());
        }
        let rules = parse_rules(rules)?;

        let mut last_sent = self.delivery(device_id).await;
        // savedAt must strictly increase per device even if the clock does not.
        let saved_at = now_ms().max(*last_sent + 1);
        *last_sent = saved_at;
        let rule_set = RuleSet {
            device_id: device_id.to_string(),
            rules,
            saved_at,
        };

        let command = ControlCommand::SetRules {
            rules: rule_set.rules.clone(),
            saved_at,
        };
        self.router
            .send(device_id, &command, SendOptions::acked(self.ack_timeout))
            .await?;

        self.sets
            .write()
            .await
            .insert(device_id.to_string(), rule_set.clone());
        info!(
            "Saved {} rule(s) for {} (savedAt={})",
            rule_set.rules.len(),
            device_id,
            saved_at
        );
        Ok(rule_set)
    }

    /// Send the stored set to the device again without waiting for its ack.
    /// Returns `None` when the device has no saved rules.
    pub async fn resync(&self, device_id: &str) -> Result<Option<RuleSet>, CommandError> {
        let _delivery = self.delivery(device_id).await;
        let Some(rule_set) = self.get(device_id).await else {
            return Ok(None);
        };

        let command = ControlCommand::SetRules {
            rules: rule_set.rules.clone(),
            saved_at: rule_set.saved_at,
        };
        self.router
            .send(
                device_id,
                &command,
                SendOptions::fire_and_forget(self.ack_timeout),
            )
            .await?;
        Ok(Some(rule_set))
    }

    /// Saves and resyncs for one device publish one at a time, in `savedAt` order.
    async fn delivery(&self, device_id: &str) -> OwnedMutexGuard<i64> {
        let lock = self
            .deliveries
            .lock()
            .await
            .entry(device_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub async fn snapshot(&self) -> Vec<RuleSet> {
        self.sets.read().await.values().cloned().collect()
    }

    pub async fn get(&self, device_id: &str) -> Option<RuleSet> {
        self.sets.read().await.get(device_id).cloned()
    }
}

/// Structural check only: an array of rules with distinct ids. Values are taken as-is.
pub fn parse_rules(rules: &Value) -> Result<Vec<Rule>, ValidationError> {
    let Value::Array(items) = rules else {
        return Err(ValidationError::RulesNotSequence);
    };

    let mut seen = HashSet::new();
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let rule: Rule = serde_json::from_value(item.clone()).map_err(|e| {
                ValidationError::InvalidRule {
                    index,
                    reason: e.to_string(),
                }
            })?;
            if !seen.insert(rule.id.clone()) {
                return Err(ValidationError::InvalidRule {
                    index,
                    reason: format!("duplicate id '{}'", rule.id),
                });
            }
            Ok(rule)
        })
        .collect()
}
