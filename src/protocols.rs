// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire protocols: federation/admin session messages and the worker channel
//! frame format. Field names follow the wire (camelCase) where the protocol
//! requires it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::federation::PeerConnection;

/// Messages exchanged on peer and admin sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionMessage {
    /// Full composite state, sent once when a session opens.
    #[serde(rename = "INIT_STATE")]
    InitState { state: Value },
    /// Incremental delta, sent on every mutation.
    #[serde(rename = "PATCH_STATE")]
    PatchState { delta: Value },
    /// Keep-alive for idle links.
    #[serde(rename = "HEARTBEAT")]
    Heartbeat { ts: i64 },
    /// Admin notification: a remote server asked to federate.
    #[serde(rename = "NEW_CONNECTION_REQUEST")]
    NewConnectionRequest {
        connection: PeerConnection,
        url: String,
    },
}

/// Worker request frame types.
pub mod frame_type {
    pub const CALL_PIPE_REQUEST: &str = "CALL_PIPE_REQUEST";
    pub const LOAD_PIPE_REQUEST: &str = "LOAD_PIPE_REQUEST";
    pub const DELETE_PIPE_REQUEST: &str = "DELETE_PIPE_REQUEST";
    pub const GET_PIPES_REQUEST: &str = "GET_PIPES_REQUEST";
    pub const GET_PIPES_RESPONSE: &str = "GET_PIPES_RESPONSE";
    pub const STREAM: &str = "STREAM";
}

/// Request frame sent to a worker process. The correlation `uuid` is filled
/// in by the channel at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    #[serde(rename = "type")]
    pub frame: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(rename = "pipeId", default, skip_serializing_if = "Option::is_none")]
    pub pipe_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(
        rename = "requiredVRAM",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub required_vram: Option<u64>,
}

impl WorkerRequest {
    pub fn new(frame: &str) -> Self {
        Self {
            frame: frame.to_string(),
            uuid: None,
            pipe_id: None,
            payload: None,
            required_vram: None,
        }
    }

    pub fn with_pipe(mut self, pipe_id: &str) -> Self {
        self.pipe_id = Some(pipe_id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_required_vram(mut self, vram: u64) -> Self {
        self.required_vram = Some(vram);
        self
    }
}

/// Response frame from a worker process. Responses carry the correlation id
/// of the request they answer plus payload-specific fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub uuid: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkerResponse {
    pub fn is_stream(&self) -> bool {
        self.frame.as_deref() == Some(frame_type::STREAM)
    }

    /// Timeout placeholder resolved by the channel when a worker stays
    /// silent past the request's deadline.
    pub fn timed_out(uuid: &str, timeout_secs: u64) -> Self {
        Self {
            uuid: uuid.to_string(),
            error: Some(format!("Request timed out after {timeout_secs} seconds")),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_message_tags() {
        let msg = SessionMessage::Heartbeat { ts: 17 };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded, json!({"type": "HEARTBEAT", "ts": 17}));
    }

    #[test]
    fn test_worker_request_wire_names() {
        let req = WorkerRequest::new(frame_type::CALL_PIPE_REQUEST)
            .with_pipe("v--m--default")
            .with_required_vram(1024);
        let encoded = serde_json::to_value(&req).unwrap();
        assert_eq!(encoded["type"], "CALL_PIPE_REQUEST");
        assert_eq!(encoded["pipeId"], "v--m--default");
        assert_eq!(encoded["requiredVRAM"], 1024);
    }

    #[test]
    fn test_worker_response_keeps_unknown_fields() {
        let raw = json!({"uuid": "u1", "type": "STREAM", "token": "hel", "done": false});
        let resp: WorkerResponse = serde_json::from_value(raw).unwrap();
        assert!(resp.is_stream());
        assert_eq!(resp.extra["token"], "hel");
    }
}
