// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Local-subtree replication: periodically rebuild this server's view of
//! itself and publish the diff.
//!
//! The cycle is non-reentrant: sleep, build, diff, apply+broadcast, and only
//! then sleep again. A slow telemetry read stretches the cycle instead of
//! overlapping it. Queues are never rebuilt here; `replace_local` carries
//! the queue manager's live entries forward under its transaction lock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::state::{Device, GpuSnapshot, ModelStatus, ModelsMap, ServerState, StateHub};
use crate::telemetry::{gpus_for_device, ModelCatalog, PollCadence, TelemetrySource};
use crate::worker::WorkerPool;

pub const REPLICATION_INTERVAL: Duration = Duration::from_millis(200);

pub struct Replicator {
    hub: Arc<StateHub>,
    pool: Arc<WorkerPool>,
    telemetry: Arc<dyn TelemetrySource>,
    catalog: Arc<dyn ModelCatalog>,
    cadence: PollCadence,
    gpus: Vec<GpuSnapshot>,
    models: ModelsMap,
}

impl Replicator {
    pub fn new(
        hub: Arc<StateHub>,
        pool: Arc<WorkerPool>,
        telemetry: Arc<dyn TelemetrySource>,
        catalog: Arc<dyn ModelCatalog>,
    ) -> Self {
        Self {
            hub,
            pool,
            telemetry,
            catalog,
            cadence: PollCadence::default(),
            gpus: Vec::new(),
            models: ModelsMap::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(REPLICATION_INTERVAL) => {}
            }
            if let Err(err) = self.cycle().await {
                tracing::warn!(%err, "replication cycle failed");
            }
        }
    }

    /// One build-diff-publish pass. Public so tests can drive cycles
    /// without the timer.
    pub async fn cycle(&mut self) -> crate::Result<()> {
        let (poll_smi, poll_models) = self.cadence.tick();
        if poll_smi {
            self.gpus = self.telemetry.gpus().await?;
        }
        if poll_models {
            self.models = self.catalog.models().await?;
        }

        let pipes_by_device = self.pool.poll_pipes().await;

        let mut devices = Vec::with_capacity(pipes_by_device.len());
        for (device_id, pipes) in pipes_by_device {
            devices.push(Device {
                gpus: gpus_for_device(&device_id, &self.gpus),
                pipes,
                frozen: self.pool.is_frozen(&device_id),
                disabled: self.pool.is_disabled(&device_id),
                queue: Vec::new(),
                device_id,
            });
        }

        let local = ServerState {
            pipes_map: enrich_pipes_map(self.catalog.pipes_map(), &self.models, &devices),
            models: self.models.clone(),
            devices,
        };
        self.hub.replace_local(&local)?;
        Ok(())
    }
}

/// Annotate the catalog's pipes map with availability facts: a pipe is
/// available when its model is INSTALLED here, and `loadedOnDevices` lists
/// the devices currently holding it in VRAM.
fn enrich_pipes_map(mut pipes_map: Value, models: &ModelsMap, devices: &[Device]) -> Value {
    let Some(entries) = pipes_map.as_object_mut() else {
        return pipes_map;
    };

    for (pipe_id, entry) in entries.iter_mut() {
        let Some(entry) = entry.as_object_mut() else {
            continue;
        };

        let mut parts = pipe_id.splitn(3, "--");
        let installed = match (parts.next(), parts.next()) {
            (Some(vendor), Some(model)) => models
                .get(vendor)
                .and_then(|m| m.get(model))
                .map(|info| info.status == ModelStatus::Installed)
                .unwrap_or(false),
            _ => false,
        };
        entry.insert("isAvailable".to_string(), Value::Bool(installed));

        let loaded_on: Vec<Value> = devices
            .iter()
            .filter(|d| d.pipes.iter().any(|p| p == pipe_id))
            .map(|d| Value::String(d.device_id.clone()))
            .collect();
        entry.insert("loadedOnDevices".to_string(), Value::Array(loaded_on));
    }
    pipes_map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::SessionMessage;
    use crate::state::{ModelInfo, QueueItem};
    use crate::telemetry::{StaticCatalog, StaticTelemetry};
    use crate::worker::WorkerChannel;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    const LOCAL: &str = "http://local:8080/";

    fn fake_worker(device_id: &str, pipes: Vec<&'static str>) -> WorkerChannel {
        let (near, far) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(far);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let reply = json!({
                    "uuid": req["uuid"],
                    "type": "GET_PIPES_RESPONSE",
                    "pipes": pipes,
                });
                let _ = write.write_all(format!("{reply}\n").as_bytes()).await;
            }
        });
        WorkerChannel::attach(device_id, near)
    }

    fn catalog() -> StaticCatalog {
        let mut models = ModelsMap::new();
        models.entry("v".to_string()).or_default().insert(
            "m".to_string(),
            ModelInfo {
                status: ModelStatus::Installed,
                size: 1024,
            },
        );
        StaticCatalog {
            models,
            pipes_map: json!({"v--m--default": {}, "v--other--default": {}}),
        }
    }

    fn replicator(pool: Arc<WorkerPool>) -> (Arc<StateHub>, Replicator) {
        let hub = Arc::new(StateHub::new(LOCAL));
        let telemetry = StaticTelemetry {
            gpus: vec![GpuSnapshot {
                index: "0".into(),
                memory_free: 8192,
                ..Default::default()
            }],
        };
        let repl = Replicator::new(
            hub.clone(),
            pool,
            Arc::new(telemetry),
            Arc::new(catalog()),
        );
        (hub, repl)
    }

    #[tokio::test]
    async fn test_cycle_publishes_local_subtree_and_enriched_pipes() {
        let pool = Arc::new(WorkerPool::new());
        pool.insert(fake_worker("0", vec!["v--m--default"]));
        let (hub, mut repl) = replicator(pool);

        repl.cycle().await.unwrap();

        let local = hub.store().server(LOCAL).unwrap();
        assert_eq!(local["devices"][0]["deviceId"], "0");
        assert_eq!(local["devices"][0]["pipes"][0], "v--m--default");
        assert_eq!(local["devices"][0]["gpus"][0]["index"], "0");
        assert_eq!(local["pipesMap"]["v--m--default"]["isAvailable"], true);
        assert_eq!(local["pipesMap"]["v--m--default"]["loadedOnDevices"][0], "0");
        assert_eq!(local["pipesMap"]["v--other--default"]["isAvailable"], false);
    }

    #[tokio::test]
    async fn test_cycle_carries_queue_forward_and_is_quiet_when_unchanged() {
        let pool = Arc::new(WorkerPool::new());
        pool.insert(fake_worker("0", vec![]));
        let (hub, mut repl) = replicator(pool);

        repl.cycle().await.unwrap();

        // Something else (the queue manager) appends to the queue.
        let item = QueueItem::new("v--m--default");
        let fragment = json!({"devices": {"$set": [{
            "deviceId": "0",
            "queue": [serde_json::to_value(&item).unwrap()],
        }]}});
        hub.store().apply_subtree(LOCAL, &fragment);

        // Next cycle keeps the queue.
        repl.cycle().await.unwrap();
        let local = hub.store().server(LOCAL).unwrap();
        assert_eq!(local["devices"][0]["queue"][0]["uuid"], item.uuid);

        // No change between cycles means no broadcast.
        let mut sub = hub.subscribe_admin();
        repl.cycle().await.unwrap();
        repl.cycle().await.unwrap();
        match sub.rx.try_recv() {
            Err(_) => {}
            Ok(SessionMessage::PatchState { delta }) => {
                panic!("unexpected broadcast: {delta}")
            }
            Ok(other) => panic!("unexpected message {other:?}"),
        }
    }
}
