// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Request/response multiplexing over one worker transport.
//!
//! Frames are newline-delimited JSON. Every outbound request gets a fresh
//! correlation uuid and a pending entry; inbound frames are matched purely
//! by that uuid, so responses may arrive out of order and many requests can
//! be outstanding at once. A request resolves exactly once: on its first
//! matching non-stream frame, when its stream callback asks to resolve, or
//! on timeout. Frames for an already-resolved uuid are silently dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::protocols::{WorkerRequest, WorkerResponse};

/// Default per-request timeout, seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 260;

/// Decision returned by a stream callback after each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDecision {
    Continue,
    /// Perform final resolution and cleanup now.
    Resolve,
}

pub type StreamCallback = Box<dyn FnMut(&WorkerResponse) -> StreamDecision + Send + Sync>;

struct Pending {
    resolver: oneshot::Sender<WorkerResponse>,
    stream: Option<StreamCallback>,
}

type PendingMap = Arc<DashMap<String, Pending>>;

/// One bidirectional channel to a local worker process.
#[derive(Clone)]
pub struct WorkerChannel {
    device_id: String,
    outbound: mpsc::Sender<String>,
    pending: PendingMap,
}

impl WorkerChannel {
    /// Attach a channel to any duplex transport (a Unix socket in
    /// production, an in-memory duplex in tests).
    pub fn attach<T>(device_id: &str, transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
        let pending: PendingMap = Arc::new(DashMap::new());

        let mut sink = FramedWrite::new(write_half, LinesCodec::new());
        tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_device = device_id.to_string();
        let mut frames = FramedRead::new(read_half, LinesCodec::new());
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(line) => handle_frame(&reader_pending, &line),
                    Err(err) => {
                        tracing::warn!(device = %reader_device, %err, "worker frame decode error");
                        break;
                    }
                }
            }
            tracing::info!(device = %reader_device, "worker channel closed");
            // In-flight requests against the dead channel are lost; their
            // timers resolve them as timeouts (at-most-once delivery).
        });

        Self {
            device_id: device_id.to_string(),
            outbound: outbound_tx,
            pending,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Send a request and wait for its resolution.
    pub async fn send(
        &self,
        mut msg: WorkerRequest,
        timeout_secs: u64,
        stream: Option<StreamCallback>,
    ) -> crate::Result<WorkerResponse> {
        let uuid = uuid::Uuid::new_v4().to_string();
        msg.uuid = Some(uuid.clone());

        let (resolver, mut rx) = oneshot::channel();
        self.pending.insert(uuid.clone(), Pending { resolver, stream });

        let line = serde_json::to_string(&msg)?;
        if self.outbound.send(line).await.is_err() {
            self.pending.remove(&uuid);
            crate::raise!("worker channel for device {} is down", self.device_id);
        }

        tokio::select! {
            res = &mut rx => Ok(res.unwrap_or_else(|_| WorkerResponse::timed_out(&uuid, timeout_secs))),
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                // Removing the pending entry first makes resolution a race
                // with exactly one winner; a response landing after this
                // point hits a map miss and is dropped.
                match self.pending.remove(&uuid) {
                    Some(_) => Ok(WorkerResponse::timed_out(&uuid, timeout_secs)),
                    None => Ok((&mut rx)
                        .await
                        .unwrap_or_else(|_| WorkerResponse::timed_out(&uuid, timeout_secs))),
                }
            }
        }
    }

    /// Send with the default timeout and no stream callback.
    pub async fn call(&self, msg: WorkerRequest) -> crate::Result<WorkerResponse> {
        self.send(msg, DEFAULT_TIMEOUT_SECS, None).await
    }

    /// Number of unresolved requests (test and introspection hook).
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

fn handle_frame(pending: &DashMap<String, Pending>, line: &str) {
    let response: WorkerResponse = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(err) => {
            tracing::warn!(%err, "ignoring non-JSON worker frame");
            return;
        }
    };
    let uuid = response.uuid.clone();

    if response.is_stream() {
        let decision = match pending.get_mut(&uuid) {
            Some(mut entry) => match entry.stream.as_mut() {
                Some(callback) => callback(&response),
                None => StreamDecision::Continue,
            },
            // Late or unknown chunk: ignore.
            None => return,
        };
        if decision == StreamDecision::Resolve {
            if let Some((_, entry)) = pending.remove(&uuid) {
                let _ = entry.resolver.send(response);
            }
        }
    } else if let Some((_, entry)) = pending.remove(&uuid) {
        let _ = entry.resolver.send(response);
    }
    // else: response for an id that already resolved or timed out — not an
    // error, just ignored.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::frame_type;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::io::{AsyncBufReadExt, BufReader};

    /// Test double: a worker process on the far side of a duplex pipe.
    fn harness() -> (WorkerChannel, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        (WorkerChannel::attach("0", near), far)
    }

    async fn read_request(far: &mut (impl tokio::io::AsyncRead + Unpin)) -> serde_json::Value {
        let mut reader = BufReader::new(far);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_five_concurrent_requests_resolve_in_reverse_order() {
        let (channel, mut far) = harness();

        let mut handles = Vec::new();
        for i in 0..5 {
            let ch = channel.clone();
            let req = WorkerRequest::new(frame_type::CALL_PIPE_REQUEST)
                .with_payload(json!({"n": i}));
            handles.push(tokio::spawn(async move { (i, ch.call(req).await.unwrap()) }));
        }

        // Collect the five requests, then answer them in reverse order.
        let mut seen = Vec::new();
        {
            let mut reader = BufReader::new(&mut far);
            for _ in 0..5 {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                seen.push((
                    req["uuid"].as_str().unwrap().to_string(),
                    req["payload"]["n"].as_i64().unwrap(),
                ));
            }
        }
        for (uuid, n) in seen.iter().rev() {
            let frame = json!({"uuid": uuid, "text": format!("answer-{n}")});
            far.write_all(format!("{frame}\n").as_bytes()).await.unwrap();
        }

        for handle in handles {
            let (i, response) = handle.await.unwrap();
            assert_eq!(response.text.unwrap(), format!("answer-{i}"), "cross-wired response");
        }
        assert_eq!(channel.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_once_and_late_frame_is_ignored() {
        let (channel, mut far) = harness();

        let ch = channel.clone();
        let call = tokio::spawn(async move {
            ch.send(WorkerRequest::new(frame_type::CALL_PIPE_REQUEST), 5, None)
                .await
                .unwrap()
        });

        let req = read_request(&mut far).await;
        let uuid = req["uuid"].as_str().unwrap().to_string();

        // No response within the timeout.
        tokio::time::advance(Duration::from_secs(6)).await;
        let response = call.await.unwrap();
        assert!(response.error.unwrap().contains("timed out after 5 seconds"));
        assert_eq!(channel.outstanding(), 0);

        // A frame for the same id afterwards causes no panic, no duplicate
        // cleanup, nothing.
        let frame = json!({"uuid": uuid, "text": "too late"});
        far.write_all(format!("{frame}\n").as_bytes()).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(channel.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_stream_chunks_reach_callback_until_resolve() {
        let (channel, mut far) = harness();

        let (chunks_tx, mut chunks_rx) = mpsc::unbounded_channel::<String>();
        let callback: StreamCallback = Box::new(move |frame| {
            if frame.done == Some(true) {
                StreamDecision::Resolve
            } else {
                let _ = chunks_tx.send(frame.text.clone().unwrap_or_default());
                StreamDecision::Continue
            }
        });

        let ch = channel.clone();
        let call = tokio::spawn(async move {
            ch.send(
                WorkerRequest::new(frame_type::CALL_PIPE_REQUEST).with_pipe("v--m--default"),
                60,
                Some(callback),
            )
            .await
            .unwrap()
        });

        let req = read_request(&mut far).await;
        let uuid = req["uuid"].as_str().unwrap().to_string();

        for text in ["hel", "lo"] {
            let frame = json!({"uuid": uuid, "type": "STREAM", "text": text});
            far.write_all(format!("{frame}\n").as_bytes()).await.unwrap();
        }
        let done = json!({"uuid": uuid, "type": "STREAM", "done": true});
        far.write_all(format!("{done}\n").as_bytes()).await.unwrap();

        let response = call.await.unwrap();
        assert_eq!(response.done, Some(true));
        assert_eq!(chunks_rx.recv().await.unwrap(), "hel");
        assert_eq!(chunks_rx.recv().await.unwrap(), "lo");
        assert_eq!(channel.outstanding(), 0);
    }
}
