// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Local worker processes: one channel per device plus the per-device
//! frozen/disabled flags the scheduler consumes.

pub mod channel;
pub mod supervisor;

pub use channel::{StreamCallback, StreamDecision, WorkerChannel, DEFAULT_TIMEOUT_SECS};

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde_json::Value;

use crate::protocols::{frame_type, WorkerRequest};

/// Timeout for the periodic GET_PIPES poll, seconds.
const PIPE_POLL_TIMEOUT_SECS: u64 = 5;

struct PoolEntry {
    channel: WorkerChannel,
    frozen: AtomicBool,
    disabled: AtomicBool,
}

/// Registry of live device channels.
#[derive(Default)]
pub struct WorkerPool {
    entries: DashMap<String, PoolEntry>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any previous one for the device. Flags
    /// survive a respawn only if the caller re-applies them; a fresh entry
    /// starts unfrozen and enabled.
    pub fn insert(&self, channel: WorkerChannel) {
        let device_id = channel.device_id().to_string();
        self.entries.insert(
            device_id,
            PoolEntry {
                channel,
                frozen: AtomicBool::new(false),
                disabled: AtomicBool::new(false),
            },
        );
    }

    pub fn remove(&self, device_id: &str) {
        self.entries.remove(device_id);
    }

    pub fn channel(&self, device_id: &str) -> Option<WorkerChannel> {
        self.entries.get(device_id).map(|e| e.channel.clone())
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Flip a flag; returns false when the device is unknown.
    pub fn set_frozen(&self, device_id: &str, frozen: bool) -> bool {
        match self.entries.get(device_id) {
            Some(entry) => {
                entry.frozen.store(frozen, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn set_disabled(&self, device_id: &str, disabled: bool) -> bool {
        match self.entries.get(device_id) {
            Some(entry) => {
                entry.disabled.store(disabled, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn is_frozen(&self, device_id: &str) -> bool {
        self.entries
            .get(device_id)
            .map(|e| e.frozen.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn is_disabled(&self, device_id: &str) -> bool {
        self.entries
            .get(device_id)
            .map(|e| e.disabled.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Ask every device which pipes it holds in VRAM. Devices that fail to
    /// answer within the poll window report an empty list rather than
    /// failing the whole poll; a hung worker must not stall the replication
    /// cycle for the full dispatch timeout.
    pub async fn poll_pipes(&self) -> Vec<(String, Vec<String>)> {
        let channels: Vec<WorkerChannel> =
            self.entries.iter().map(|e| e.channel.clone()).collect();

        let polls = channels.into_iter().map(|channel| async move {
            let device_id = channel.device_id().to_string();
            let pipes = match channel
                .send(
                    WorkerRequest::new(frame_type::GET_PIPES_REQUEST),
                    PIPE_POLL_TIMEOUT_SECS,
                    None,
                )
                .await
            {
                Ok(response) if response.error.is_none() => {
                    parse_pipes(response.extra.get("pipes"))
                }
                Ok(response) => {
                    tracing::warn!(device = %device_id, error = ?response.error, "pipe poll failed");
                    Vec::new()
                }
                Err(err) => {
                    tracing::warn!(device = %device_id, %err, "pipe poll failed");
                    Vec::new()
                }
            };
            (device_id, pipes)
        });

        let mut out = futures::future::join_all(polls).await;
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

fn parse_pipes(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Fake worker: answers every GET_PIPES_REQUEST with a fixed pipe list.
    fn fake_worker(pipes: Vec<&'static str>) -> WorkerChannel {
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
                let _ = write
                    .write_all(format!("{reply}\n").as_bytes())
                    .await;
            }
        });
        WorkerChannel::attach("0", near)
    }

    #[tokio::test]
    async fn test_poll_pipes_collects_per_device_lists() {
        let pool = WorkerPool::new();
        pool.insert(fake_worker(vec!["v--m--default"]));

        let polled = pool.poll_pipes().await;
        assert_eq!(polled, vec![("0".to_string(), vec!["v--m--default".to_string()])]);
    }

    /// A worker that reads requests and never answers them.
    fn silent_worker(device_id: &str) -> WorkerChannel {
        let (near, far) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let (read, _write) = tokio::io::split(far);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
        });
        WorkerChannel::attach(device_id, near)
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_worker_bounds_the_poll_and_reports_empty() {
        let pool = WorkerPool::new();
        pool.insert(fake_worker(vec!["v--m--default"]));
        pool.insert(silent_worker("1"));

        // Completes within the short poll window, not the dispatch timeout.
        let polled = tokio::time::timeout(
            std::time::Duration::from_secs(PIPE_POLL_TIMEOUT_SECS + 2),
            pool.poll_pipes(),
        )
        .await
        .unwrap();
        assert_eq!(
            polled,
            vec![
                ("0".to_string(), vec!["v--m--default".to_string()]),
                ("1".to_string(), vec![]),
            ]
        );
    }

    #[tokio::test]
    async fn test_flags_default_false_and_round_trip() {
        let pool = WorkerPool::new();
        pool.insert(fake_worker(vec![]));

        assert!(!pool.is_frozen("0"));
        assert!(pool.set_frozen("0", true));
        assert!(pool.is_frozen("0"));

        assert!(!pool.is_disabled("0"));
        assert!(pool.set_disabled("0", true));
        assert!(pool.is_disabled("0"));

        // unknown device
        assert!(!pool.set_frozen("9", true));
        assert!(!pool.is_frozen("9"));
    }
}
