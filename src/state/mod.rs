// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Cluster state: one composite tree keyed by canonical server URL.
//!
//! Each subtree has exactly one writer — the replicator for the local
//! subtree, the owning peer's session task for each remote one. Everyone
//! else only reads. Mutations flow through [`StateHub`], which applies a
//! delta to the store and fans it out to admin and peer subscribers.

pub mod delta;
pub mod replicator;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::protocols::SessionMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelStatus {
    #[serde(rename = "INSTALLED")]
    Installed,
    #[serde(rename = "INSTALLING")]
    Installing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub status: ModelStatus,
    /// Declared on-disk size, used as the pipe's required VRAM in bytes.
    #[serde(default)]
    pub size: u64,
}

/// Read-only per-GPU facts, replaced wholesale every replication cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub index: String,
    #[serde(default)]
    pub memory_total: u64,
    #[serde(default)]
    pub memory_free: u64,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub power_draw: f64,
    #[serde(default)]
    pub power_limit: f64,
    #[serde(default)]
    pub temperature_gpu: f64,
    #[serde(default)]
    pub fan_speed: f64,
    #[serde(default)]
    pub max_tflops: f64,
}

/// One in-flight dispatch, appended to its device's queue at dispatch time
/// and removed exactly once regardless of outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    #[serde(rename = "pipeId")]
    pub pipe_id: String,
    #[serde(rename = "timeStarted")]
    pub time_started: i64,
    pub uuid: String,
}

impl QueueItem {
    pub fn new(pipe_id: &str) -> Self {
        Self {
            pipe_id: pipe_id.to_string(),
            time_started: chrono::Utc::now().timestamp_millis(),
            uuid: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(default)]
    pub gpus: Vec<GpuSnapshot>,
    #[serde(default)]
    pub pipes: Vec<String>,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub queue: Vec<QueueItem>,
}

pub type ModelsMap = BTreeMap<String, BTreeMap<String, ModelInfo>>;

/// State owned by one federation member.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerState {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub models: ModelsMap,
    #[serde(rename = "pipesMap", default)]
    pub pipes_map: Value,
}

/// The full replicated picture: canonical server URL → its subtree.
pub type ClusterState = BTreeMap<String, ServerState>;

/// In-memory composite tree with get/replace/patch and diff primitives.
pub struct StateStore {
    tree: RwLock<Value>,
}

impl StateStore {
    pub fn new(local_url: &str) -> Self {
        let mut root = Map::new();
        root.insert(local_url.to_string(), Value::Object(Map::new()));
        Self {
            tree: RwLock::new(Value::Object(root)),
        }
    }

    pub fn snapshot(&self) -> Value {
        self.tree.read().clone()
    }

    /// Typed read view. Subtrees that fail to deserialize (e.g. a remote
    /// peer's half-installed state) are skipped.
    pub fn typed(&self) -> ClusterState {
        let tree = self.tree.read();
        let mut out = ClusterState::new();
        if let Value::Object(map) = &*tree {
            for (url, subtree) in map {
                if let Ok(server) = serde_json::from_value::<ServerState>(subtree.clone()) {
                    out.insert(url.clone(), server);
                }
            }
        }
        out
    }

    pub fn server(&self, url: &str) -> Option<Value> {
        self.tree.read().get(url).cloned()
    }

    pub fn apply(&self, delta: &Value) {
        delta::patch(&mut self.tree.write(), delta);
    }

    /// Apply a delta fragment to one subtree only, without touching siblings.
    pub fn apply_subtree(&self, url: &str, fragment: &Value) {
        let mut tree = self.tree.write();
        if let Some(subtree) = tree.get_mut(url) {
            delta::patch(subtree, fragment);
        }
    }
}

type Subscribers = DashMap<u64, mpsc::UnboundedSender<SessionMessage>>;

/// A registered subscriber; dropping it (or its receiver) detaches it.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<SessionMessage>,
}

/// [`StateStore`] plus fan-out to admin and peer session subscribers.
pub struct StateHub {
    store: StateStore,
    local_url: String,
    // Serializes local-subtree writers: queue transactions and the
    // replicator's rebuild both copy-mutate-apply, and interleaved pairs
    // would silently revert each other's edits.
    local_txn: Mutex<()>,
    next_id: AtomicU64,
    admin: Subscribers,
    peers: Subscribers,
}

impl StateHub {
    pub fn new(local_url: &str) -> Self {
        Self {
            store: StateStore::new(local_url),
            local_url: local_url.to_string(),
            local_txn: Mutex::new(()),
            next_id: AtomicU64::new(1),
            admin: DashMap::new(),
            peers: DashMap::new(),
        }
    }

    /// Take the local-subtree transaction lock. Held for the whole
    /// copy-mutate-apply section of any local write.
    pub fn local_txn(&self) -> MutexGuard<'_, ()> {
        self.local_txn.lock()
    }

    pub fn local_url(&self) -> &str {
        &self.local_url
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn subscribe_admin(&self) -> Subscription {
        self.subscribe(&self.admin)
    }

    pub fn subscribe_peer(&self) -> Subscription {
        self.subscribe(&self.peers)
    }

    fn subscribe(&self, set: &Subscribers) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        set.insert(id, tx);
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.admin.remove(&id);
        self.peers.remove(&id);
    }

    fn broadcast(set: &Subscribers, msg: &SessionMessage) {
        set.retain(|_, tx| tx.send(msg.clone()).is_ok());
    }

    pub fn broadcast_admin(&self, msg: SessionMessage) {
        Self::broadcast(&self.admin, &msg);
    }

    /// Apply a locally-produced delta and fan it out to everyone.
    pub fn update_state(&self, delta: Value) {
        self.store.apply(&delta);
        let msg = SessionMessage::PatchState { delta };
        Self::broadcast(&self.admin, &msg);
        Self::broadcast(&self.peers, &msg);
    }

    /// Replace the local subtree with a freshly built snapshot. Returns the
    /// delta if anything changed.
    ///
    /// Queues are not the caller's to rebuild: the live queue of every
    /// device is read and carried forward under the transaction lock, so an
    /// enqueue landing after the caller assembled `local` is never reverted.
    pub fn replace_local(&self, local: &ServerState) -> crate::Result<Option<Value>> {
        let _txn = self.local_txn.lock();

        let current = self.store.snapshot();
        let mut local = local.clone();
        if let Some(devices) = current
            .get(self.local_url.as_str())
            .and_then(|server| server.get("devices"))
            .and_then(Value::as_array)
        {
            for device in &mut local.devices {
                let live = devices
                    .iter()
                    .find(|d| {
                        d.get("deviceId").and_then(Value::as_str)
                            == Some(device.device_id.as_str())
                    })
                    .and_then(|d| d.get("queue"));
                if let Some(queue) = live {
                    device.queue = serde_json::from_value(queue.clone()).unwrap_or_default();
                }
            }
        }

        let mut candidate = current.clone();
        candidate[self.local_url.as_str()] = serde_json::to_value(&local)?;

        match delta::diff(&current, &candidate) {
            Some(delta) => {
                self.update_state(delta.clone());
                Ok(Some(delta))
            }
            None => Ok(None),
        }
    }

    /// Install a peer's subtree received in `INIT_STATE`; the diff against
    /// the previous composite goes to admin subscribers.
    pub fn init_remote(&self, url: &str, subtree: Value) {
        let current = self.store.snapshot();
        let mut candidate = current.clone();
        candidate[url] = subtree;

        if let Some(delta) = delta::diff(&current, &candidate) {
            self.store.apply(&delta);
            Self::broadcast(&self.admin, &SessionMessage::PatchState { delta });
        }
    }

    /// Apply a `PATCH_STATE` fragment from the subtree's owning peer and
    /// re-broadcast the same fragment to admins. No diff recomputation.
    pub fn patch_remote(&self, url: &str, delta: Value) {
        if let Some(fragment) = delta.get(url) {
            self.store.apply_subtree(url, fragment);
        }
        Self::broadcast(&self.admin, &SessionMessage::PatchState { delta });
    }

    /// Drop a peer's subtree the moment its session closes.
    pub fn delete_remote(&self, url: &str) {
        let current = self.store.snapshot();
        if current.get(url).is_none() {
            return;
        }
        let mut candidate = current.clone();
        if let Some(map) = candidate.as_object_mut() {
            map.remove(url);
        }
        if let Some(delta) = delta::diff(&current, &candidate) {
            self.store.apply(&delta);
            Self::broadcast(&self.admin, &SessionMessage::PatchState { delta });
        }
    }
}
