// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Queue transactions over the replicated state.
//!
//! Every mutation is copy, mutate the copy, diff, apply+broadcast — the
//! same path any other state change takes, so subscribers see queue edits
//! as ordinary `PATCH_STATE` deltas. Transactions are synchronous and run
//! under the hub's local-subtree lock, which also serializes them against
//! the replicator's rebuild; nothing yields between the copy and the apply.

use std::sync::Arc;

use serde_json::Value;

use crate::state::{delta, QueueItem, StateHub};

pub struct QueueManager {
    hub: Arc<StateHub>,
}

impl QueueManager {
    pub fn new(hub: Arc<StateHub>) -> Self {
        Self { hub }
    }

    pub fn enqueue(&self, server_url: &str, device_id: &str, item: &QueueItem) -> crate::Result<()> {
        let item = serde_json::to_value(item)?;
        self.mutate_queue(server_url, device_id, |queue| queue.push(item.clone()))
    }

    /// Remove by uuid. Removing an id that is not present is a no-op
    /// transaction producing no delta, so cleanup paths may call this
    /// unconditionally.
    pub fn dequeue(&self, server_url: &str, device_id: &str, uuid: &str) -> crate::Result<()> {
        self.mutate_queue(server_url, device_id, |queue| {
            queue.retain(|entry| entry.get("uuid").and_then(Value::as_str) != Some(uuid))
        })
    }

    fn mutate_queue(
        &self,
        server_url: &str,
        device_id: &str,
        mutate: impl Fn(&mut Vec<Value>),
    ) -> crate::Result<()> {
        let _txn = self.hub.local_txn();

        let current = self.hub.store().snapshot();
        let mut candidate = current.clone();

        let queue = candidate
            .get_mut(server_url)
            .and_then(|server| server.get_mut("devices"))
            .and_then(Value::as_array_mut)
            .and_then(|devices| {
                devices.iter_mut().find(|d| {
                    d.get("deviceId").and_then(Value::as_str) == Some(device_id)
                })
            })
            .and_then(|device| device.get_mut("queue"))
            .and_then(Value::as_array_mut);

        match queue {
            Some(queue) => mutate(queue),
            None => crate::raise!("no queue for device {device_id} on {server_url}"),
        }

        if let Some(diff) = delta::diff(&current, &candidate) {
            self.hub.update_state(diff);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LOCAL: &str = "http://local:8080/";

    fn manager_with_device() -> (Arc<StateHub>, QueueManager) {
        let hub = Arc::new(StateHub::new(LOCAL));
        let fragment = json!({"devices": {"$set": [
            {"deviceId": "0", "queue": []},
        ]}});
        hub.store().apply_subtree(LOCAL, &fragment);
        let manager = QueueManager::new(hub.clone());
        (hub, manager)
    }

    fn queue_len(hub: &StateHub) -> usize {
        hub.store().server(LOCAL).unwrap()["devices"][0]["queue"]
            .as_array()
            .unwrap()
            .len()
    }

    #[test]
    fn test_enqueue_then_dequeue_restores_the_exact_prior_state() {
        let (hub, manager) = manager_with_device();
        let before = hub.store().snapshot();
        let item = QueueItem::new("v--m--default");

        manager.enqueue(LOCAL, "0", &item).unwrap();
        assert_eq!(queue_len(&hub), 1);

        manager.dequeue(LOCAL, "0", &item.uuid).unwrap();
        assert_eq!(hub.store().snapshot(), before, "a full cycle must leave no residue");
    }

    #[test]
    fn test_dequeue_unknown_uuid_is_silent_and_broadcast_free() {
        let (hub, manager) = manager_with_device();
        let item = QueueItem::new("v--m--default");
        manager.enqueue(LOCAL, "0", &item).unwrap();

        let mut sub = hub.subscribe_admin();
        manager.dequeue(LOCAL, "0", "no-such-uuid").unwrap();
        assert_eq!(queue_len(&hub), 1);
        assert!(sub.rx.try_recv().is_err(), "no-op dequeue must not broadcast");
    }

    #[test]
    fn test_queue_edits_broadcast_as_patches() {
        let (hub, manager) = manager_with_device();
        let mut sub = hub.subscribe_admin();

        let item = QueueItem::new("v--m--default");
        manager.enqueue(LOCAL, "0", &item).unwrap();

        match sub.rx.try_recv().unwrap() {
            crate::protocols::SessionMessage::PatchState { delta } => {
                assert!(delta[LOCAL]["devices"].is_object(), "wholesale array set: {delta}");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_unknown_device_is_an_error() {
        let (_hub, manager) = manager_with_device();
        let item = QueueItem::new("v--m--default");
        assert!(manager.enqueue(LOCAL, "9", &item).is_err());
    }
}
