// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Dispatch lifecycle: pick a device, enqueue, run the call locally or
//! forward it to the owning server, and always dequeue.
//!
//! The queue entry is the cluster-visible record that a device is busy, so
//! its removal is not optional: every exit path, including timeouts, worker
//! errors and stream completion, goes through a drop guard that runs the
//! dequeue transaction exactly once.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::auth::Keypair;
use crate::payment::{PaymentError, PaymentVerifier};
use crate::protocols::{frame_type, WorkerRequest, WorkerResponse};
use crate::queue::QueueManager;
use crate::scheduler::{self, CapacityPolicy, SchedulingError, Selection};
use crate::state::{QueueItem, StateHub};
use crate::worker::{StreamCallback, StreamDecision, WorkerPool};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error("{0}")]
    Worker(String),
    #[error(transparent)]
    Internal(#[from] crate::Error),
}

impl DispatchError {
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::Scheduling(_) | DispatchError::DeviceNotFound(_) => 404,
            DispatchError::Payment(err) => err.status,
            DispatchError::Worker(_) | DispatchError::Internal(_) => 500,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub pipe_id: String,
    pub payload: Value,
    /// Pin the call to one local device instead of scheduling.
    pub device_id: Option<String>,
    pub payment_token: Option<String>,
    /// Remote-originated calls were already paid for on the ingress server.
    pub payment_required: bool,
    pub stream: bool,
    /// Remote-originated calls must not be forwarded again.
    pub local_only: bool,
}

impl DispatchRequest {
    pub fn new(pipe_id: &str, payload: Value) -> Self {
        Self {
            pipe_id: pipe_id.to_string(),
            payload,
            payment_required: true,
            ..Default::default()
        }
    }
}

pub enum DispatchOutcome {
    Json(Value),
    /// File contents produced by the worker; the temp file is already gone.
    Binary { data: Vec<u8>, filename: String },
    /// SSE-formatted `data:` lines ending with a `[DONE]` sentinel.
    Stream(mpsc::UnboundedReceiver<String>),
}

pub struct Dispatcher {
    hub: Arc<StateHub>,
    pool: Arc<WorkerPool>,
    queue: Arc<QueueManager>,
    keypair: Arc<Keypair>,
    payment: Arc<dyn PaymentVerifier>,
    policy: CapacityPolicy,
    client: reqwest::Client,
    timeout: Duration,
}

/// Runs the dequeue transaction when dropped, wherever that happens.
struct DequeueGuard {
    queue: Arc<QueueManager>,
    server_url: String,
    device_id: String,
    uuid: String,
}

impl Drop for DequeueGuard {
    fn drop(&mut self) {
        if let Err(err) = self
            .queue
            .dequeue(&self.server_url, &self.device_id, &self.uuid)
        {
            tracing::error!(%err, uuid = %self.uuid, "dequeue failed");
        }
    }
}

impl Dispatcher {
    pub fn new(
        hub: Arc<StateHub>,
        pool: Arc<WorkerPool>,
        queue: Arc<QueueManager>,
        keypair: Arc<Keypair>,
        payment: Arc<dyn PaymentVerifier>,
        policy: CapacityPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            hub,
            pool,
            queue,
            keypair,
            payment,
            policy,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        if request.payment_required {
            self.payment
                .verify(&request.pipe_id, request.payment_token.as_deref())
                .await?;
        }

        let selection = self.select(&request)?;
        let local = selection.server_url == self.hub.local_url();

        // Local targets must have a live channel before we commit a queue
        // entry for them.
        let channel = if local {
            Some(
                self.pool
                    .channel(&selection.device_id)
                    .ok_or_else(|| DispatchError::DeviceNotFound(selection.device_id.clone()))?,
            )
        } else {
            None
        };

        let item = QueueItem::new(&request.pipe_id);
        self.queue
            .enqueue(&selection.server_url, &selection.device_id, &item)
            .map_err(DispatchError::Internal)?;
        let guard = DequeueGuard {
            queue: self.queue.clone(),
            server_url: selection.server_url.clone(),
            device_id: selection.device_id.clone(),
            uuid: item.uuid.clone(),
        };

        match channel {
            Some(channel) => {
                let worker_request = WorkerRequest::new(frame_type::CALL_PIPE_REQUEST)
                    .with_pipe(&request.pipe_id)
                    .with_payload(request.payload.clone())
                    .with_required_vram(selection.required_vram);
                if request.stream {
                    Ok(self.run_local_stream(channel, worker_request, guard))
                } else {
                    let result = channel
                        .send(worker_request, self.timeout.as_secs(), None)
                        .await;
                    drop(guard);
                    map_worker_response(result.map_err(DispatchError::Internal)?).await
                }
            }
            None => {
                let result = self.run_remote(&selection, &request).await;
                drop(guard);
                result
            }
        }
    }

    fn select(&self, request: &DispatchRequest) -> Result<Selection, DispatchError> {
        if let Some(device_id) = &request.device_id {
            if self.pool.channel(device_id).is_none() {
                return Err(DispatchError::DeviceNotFound(device_id.clone()));
            }
            return Ok(Selection {
                server_url: self.hub.local_url().to_string(),
                device_id: device_id.clone(),
                required_vram: self.local_model_size(&request.pipe_id),
            });
        }
        let state = self.hub.store().typed();
        Ok(scheduler::select_device(
            &request.pipe_id,
            &state,
            self.hub.local_url(),
            request.local_only,
            self.policy,
        )?)
    }

    fn local_model_size(&self, pipe_id: &str) -> u64 {
        let mut parts = pipe_id.splitn(3, "--");
        let (Some(vendor), Some(model)) = (parts.next(), parts.next()) else {
            return 0;
        };
        self.hub
            .store()
            .typed()
            .get(self.hub.local_url())
            .and_then(|server| server.models.get(vendor).and_then(|m| m.get(model)))
            .map(|info| info.size)
            .unwrap_or(0)
    }

    /// Local streaming call: chunks flow to the receiver as SSE lines while
    /// the request is in flight; the guard dequeues when the stream ends.
    /// The channel is unbounded: a consumer slower than the worker buffers
    /// chunks, it never loses them.
    fn run_local_stream(
        &self,
        channel: crate::worker::WorkerChannel,
        worker_request: WorkerRequest,
        guard: DequeueGuard,
    ) -> DispatchOutcome {
        let (tx, rx) = mpsc::unbounded_channel::<String>();

        let chunk_tx = tx.clone();
        let callback: StreamCallback = Box::new(move |frame: &WorkerResponse| {
            if frame.done == Some(true) {
                return StreamDecision::Resolve;
            }
            let body = serde_json::to_string(frame).unwrap_or_default();
            let _ = chunk_tx.send(format!("data: {body}\n\n"));
            StreamDecision::Continue
        });

        let timeout_secs = self.timeout.as_secs();
        tokio::spawn(async move {
            let result = channel.send(worker_request, timeout_secs, Some(callback)).await;
            match result {
                Ok(response) if response.error.is_some() => {
                    let body = serde_json::to_string(&response).unwrap_or_default();
                    let _ = tx.send(format!("data: {body}\n\n"));
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(%err, "stream dispatch failed");
                }
            }
            let _ = tx.send("data: [DONE]\n\n".to_string());
            drop(guard);
        });

        DispatchOutcome::Stream(rx)
    }

    /// Forward to the owning server with a fresh full-permission token.
    async fn run_remote(
        &self,
        selection: &Selection,
        request: &DispatchRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let token = self
            .keypair
            .server_token(self.hub.local_url())
            .map_err(DispatchError::Internal)?;

        let response = self
            .client
            .post(format!(
                "{}pipeCallFromRemoteServer/{}",
                selection.server_url, request.pipe_id
            ))
            .header("token", token)
            .header("serverurl", self.hub.local_url())
            .json(&request.payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| DispatchError::Internal(err.into()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Worker(format!(
                "remote dispatch failed ({status}): {body}"
            )));
        }

        if request.stream {
            let (tx, rx) = mpsc::unbounded_channel::<String>();
            let mut body = response.bytes_stream();
            tokio::spawn(async move {
                use futures::StreamExt;
                while let Some(chunk) = body.next().await {
                    match chunk {
                        Ok(bytes) => {
                            if tx.send(String::from_utf8_lossy(&bytes).into_owned()).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(%err, "remote stream interrupted");
                            break;
                        }
                    }
                }
            });
            return Ok(DispatchOutcome::Stream(rx));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if content_type.starts_with("application/json") {
            let value = response
                .json()
                .await
                .map_err(|err| DispatchError::Internal(err.into()))?;
            Ok(DispatchOutcome::Json(value))
        } else {
            let data = response
                .bytes()
                .await
                .map_err(|err| DispatchError::Internal(err.into()))?;
            Ok(DispatchOutcome::Binary {
                data: data.to_vec(),
                filename: request.pipe_id.clone(),
            })
        }
    }

    /// Load a pipe into a device's VRAM, outside the queue.
    pub async fn load_pipe(&self, device_id: &str, pipe_id: &str) -> Result<Value, DispatchError> {
        let channel = self
            .pool
            .channel(device_id)
            .ok_or_else(|| DispatchError::DeviceNotFound(device_id.to_string()))?;
        let response = channel
            .call(
                WorkerRequest::new(frame_type::LOAD_PIPE_REQUEST)
                    .with_pipe(pipe_id)
                    .with_required_vram(self.local_model_size(pipe_id)),
            )
            .await
            .map_err(DispatchError::Internal)?;
        if let Some(error) = response.error {
            return Err(DispatchError::Worker(error));
        }
        Ok(json!({"status": "ok", "pipeId": pipe_id, "deviceId": device_id}))
    }

    /// Evict a pipe from a device's VRAM.
    pub async fn delete_pipe(&self, device_id: &str, pipe_id: &str) -> Result<Value, DispatchError> {
        let channel = self
            .pool
            .channel(device_id)
            .ok_or_else(|| DispatchError::DeviceNotFound(device_id.to_string()))?;
        let response = channel
            .call(WorkerRequest::new(frame_type::DELETE_PIPE_REQUEST).with_pipe(pipe_id))
            .await
            .map_err(DispatchError::Internal)?;
        if let Some(error) = response.error {
            return Err(DispatchError::Worker(error));
        }
        Ok(json!({"status": "ok", "pipeId": pipe_id, "deviceId": device_id}))
    }
}

/// Map a worker's final frame to the caller-facing outcome: an error field
/// is a 500, a filepath is a binary body (temp file consumed), anything
/// else is JSON.
async fn map_worker_response(response: WorkerResponse) -> Result<DispatchOutcome, DispatchError> {
    if let Some(error) = response.error {
        return Err(DispatchError::Worker(error));
    }
    if let Some(filepath) = response.filepath {
        let data = tokio::fs::read(&filepath)
            .await
            .map_err(|err| DispatchError::Internal(err.into()))?;
        if let Err(err) = tokio::fs::remove_file(&filepath).await {
            tracing::warn!(%err, %filepath, "temp file cleanup failed");
        }
        let filename = std::path::Path::new(&filepath)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(filepath);
        return Ok(DispatchOutcome::Binary { data, filename });
    }
    if let Some(text) = response.text {
        return Ok(DispatchOutcome::Json(json!({ "text": text })));
    }
    Ok(DispatchOutcome::Json(Value::Object(response.extra)))
}
